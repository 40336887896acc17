mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{mark_range, normalize_day, replace_day, slots_in_range};
pub use error::EngineError;
pub use mutations::BookingRequest;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTutorState = Arc<RwLock<TutorState>>;

// ── Log writer task ──────────────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum LogCommand {
    Write(Event, Ack),
    Rewrite(Vec<Event>, Ack),
    Backlog(oneshot::Sender<u64>),
}

/// Task that owns the WAL. Writes drain from the channel in batches and are
/// buffered as they arrive; one fsync settles the whole batch, so concurrent
/// mutations share a single disk sync instead of paying one each.
async fn log_writer(mut wal: Wal, mut rx: mpsc::Receiver<LogCommand>) {
    let mut inbox = Vec::with_capacity(64);
    while rx.recv_many(&mut inbox, 64).await > 0 {
        let mut waiting: Vec<Ack> = Vec::new();
        let mut failure: Option<io::Error> = None;
        for cmd in inbox.drain(..) {
            match cmd {
                LogCommand::Write(event, ack) => {
                    if failure.is_none()
                        && let Err(e) = wal.buffer(&event) {
                            failure = Some(e);
                        }
                    waiting.push(ack);
                }
                LogCommand::Rewrite(events, ack) => {
                    settle_batch(&mut wal, &mut waiting, failure.take());
                    let _ = ack.send(wal.rewrite(&events));
                }
                LogCommand::Backlog(ack) => {
                    let _ = ack.send(wal.events_since_rewrite());
                }
            }
        }
        settle_batch(&mut wal, &mut waiting, failure.take());
    }
}

/// Fsync everything buffered so far and hand every waiting writer the shared
/// outcome. Runs even after a buffering failure, so stale bytes never carry
/// into the next batch.
fn settle_batch(wal: &mut Wal, waiting: &mut Vec<Ack>, failure: Option<io::Error>) {
    if waiting.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(waiting.len() as f64);
    let started = std::time::Instant::now();
    let committed = wal.commit();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    let outcome = match failure {
        Some(e) => Err(e),
        None => committed,
    };
    for ack in waiting.drain(..) {
        let _ = ack.send(match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

// ── Engine ───────────────────────────────────────────────

/// The booking/availability engine: per-tutor slot grids, the booking
/// collection, and the WAL that makes both durable.
///
/// Serialization discipline: every mutation touching a tutor's grid or one of
/// their bookings runs under that tutor's write lock, held from validation
/// through apply. DashMap shard guards are never held across an `.await`.
pub struct Engine {
    pub tutors: DashMap<Ulid, SharedTutorState>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    /// Reverse lookup: booking id → owning tutor id.
    pub(super) booking_to_tutor: DashMap<Ulid, Ulid>,
    pub(super) log_tx: mpsc::Sender<LogCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let history = Wal::load(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (log_tx, log_rx) = mpsc::channel(4096);
        tokio::spawn(log_writer(wal, log_rx));

        let engine = Self {
            tutors: DashMap::new(),
            bookings: DashMap::new(),
            booking_to_tutor: DashMap::new(),
            log_tx,
            notify,
        };

        // Replay. The Arcs are unshared at this point, so try_write always
        // succeeds; blocking_write would panic inside an async context.
        for event in &history {
            match event {
                Event::TutorRegistered { id } => {
                    engine
                        .tutors
                        .insert(*id, Arc::new(RwLock::new(TutorState::new(*id))));
                }
                routed => {
                    let Some(tutor_id) = routed.tutor() else { continue };
                    let Some(ts) = engine.get_tutor(&tutor_id) else { continue };
                    let mut guard = ts.try_write().expect("replay: uncontended write");
                    engine.apply(&mut guard, routed);
                }
            }
        }

        Ok(engine)
    }

    /// Apply an event to a tutor's state. The caller holds the tutor's write
    /// guard. This is the only place booked flags and booking records change,
    /// so a locked slot and its owning booking always move together.
    fn apply(&self, ts: &mut TutorState, event: &Event) {
        match event {
            Event::AvailabilitySet { date, slots, .. } => {
                replace_day(&mut ts.grid, *date, slots.clone());
            }
            Event::BookingCreated { booking } => {
                if booking.status.holds_slots()
                    && let Some(day) = ts.grid.get_mut(&booking.date) {
                        mark_range(day, booking.start, booking.end, true);
                    }
                self.booking_to_tutor.insert(booking.id, booking.tutor);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingCancelled { id, .. } => {
                if let Some((_, b)) = self.bookings.remove(id)
                    && let Some(day) = ts.grid.get_mut(&b.date) {
                        mark_range(day, b.start, b.end, false);
                    }
                self.booking_to_tutor.remove(id);
            }
            Event::BookingConfirmed { id, .. } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Confirmed;
                }
            }
            Event::BookingRejected { id, note, .. } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Rejected;
                    b.reject_note = note.clone();
                    if let Some(day) = ts.grid.get_mut(&b.date) {
                        mark_range(day, b.start, b.end, false);
                    }
                }
            }
            Event::BookingFinished { id, finished_at, .. } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Finished;
                    b.finished_at = Some(*finished_at);
                }
            }
            Event::BookingExpired { id, .. } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Expired;
                    if let Some(day) = ts.grid.get_mut(&b.date) {
                        mark_range(day, b.start, b.end, false);
                    }
                }
            }
            // registration is handled at the tutors map, before routing
            Event::TutorRegistered { .. } => {}
        }
    }

    /// Hand an event to the log writer and wait for its group commit.
    pub(super) async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let (ack, done) = oneshot::channel();
        self.log_tx
            .send(LogCommand::Write(event.clone(), ack))
            .await
            .map_err(|_| EngineError::Storage("log writer is gone".into()))?;
        done.await
            .map_err(|_| EngineError::Storage("log writer dropped the ack".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Durably log, then apply, then publish. Everything a mutation does
    /// after validation goes through here.
    pub(super) async fn commit_event(
        &self,
        ts: &mut TutorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.append(event).await?;
        self.apply(ts, event);
        self.notify.send(ts.id, event);
        Ok(())
    }

    pub fn get_tutor(&self, id: &Ulid) -> Option<SharedTutorState> {
        self.tutors.get(id).map(|e| e.value().clone())
    }

    pub fn tutor_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_tutor.get(booking_id).map(|e| *e.value())
    }

    /// Route a booking id to its tutor and take that tutor's write lock. The
    /// booking itself must be re-read under the returned guard — it may have
    /// been settled or cancelled while we waited.
    pub(super) async fn lock_booking(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<TutorState>), EngineError> {
        let tutor_id = self
            .tutor_of_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ts = self
            .get_tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        Ok((tutor_id, ts.write_owned().await))
    }
}
