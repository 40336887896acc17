use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{normalize_day, slots_in_range};
use super::conflict::{check_lockable, now_ms, require_role, validate_range};
use super::{Engine, EngineError, LogCommand};

use tokio::sync::oneshot;

/// Input for booking creation, as collected by the wire layer.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub tutor: Ulid,
    pub session: Ulid,
    /// Instant anywhere within the requested day; normalized to UTC date.
    pub date: Ms,
    pub start: SlotTime,
    pub end: SlotTime,
    pub location: Location,
    pub note: Option<String>,
}

impl Engine {
    /// Create the tutor record that will own a slot grid. Tutors register
    /// themselves.
    pub async fn register_tutor(&self, actor: &Identity) -> Result<(), EngineError> {
        require_role(actor, Role::Tutor)?;
        if self.tutors.len() >= MAX_TUTORS {
            return Err(EngineError::LimitExceeded("too many tutors"));
        }
        if self.tutors.contains_key(&actor.id) {
            return Err(EngineError::AlreadyExists(actor.id));
        }

        let event = Event::TutorRegistered { id: actor.id };
        self.append(&event).await?;
        self.tutors.insert(
            actor.id,
            std::sync::Arc::new(tokio::sync::RwLock::new(TutorState::new(actor.id))),
        );
        self.notify.send(actor.id, &event);
        Ok(())
    }

    /// Merge an availability edit into the actor's grid. Each submitted date
    /// is replaced wholesale (empty list deletes it); dates not mentioned are
    /// left untouched. Booked flags are taken verbatim from the payload, so a
    /// day containing locked slots must be resubmitted with them — or omitted.
    pub async fn set_availability(
        &self,
        actor: &Identity,
        entries: Vec<AvailabilityEdit>,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        require_role(actor, Role::Tutor)?;
        if entries.len() > MAX_EDIT_ENTRIES {
            return Err(EngineError::LimitExceeded("too many days in one edit"));
        }
        for entry in &entries {
            if entry.slots.len() > MAX_SLOTS_PER_DAY {
                return Err(EngineError::LimitExceeded("too many slots on one day"));
            }
        }

        let ts = self
            .get_tutor(&actor.id)
            .ok_or(EngineError::NotFound(actor.id))?;
        let mut guard = ts.write().await;

        // Validate the whole edit before persisting any of it.
        let mut normalized = Vec::with_capacity(entries.len());
        let mut resulting_days: std::collections::BTreeSet<_> =
            guard.grid.keys().copied().collect();
        for entry in entries {
            let date = normalize_day(entry.date)
                .ok_or(EngineError::Validation("date out of range"))?;
            if entry.slots.is_empty() {
                resulting_days.remove(&date);
            } else {
                resulting_days.insert(date);
            }
            normalized.push((date, entry.slots));
        }
        if resulting_days.len() > MAX_GRID_DAYS {
            return Err(EngineError::LimitExceeded("too many days on grid"));
        }

        for (date, slots) in normalized {
            let event = Event::AvailabilitySet {
                tutor: actor.id,
                date,
                slots,
            };
            self.commit_event(&mut guard, &event).await?;
        }

        Ok(guard
            .grid
            .iter()
            .map(|(date, slots)| DayAvailability {
                date: *date,
                slots: slots.clone(),
            })
            .collect())
    }

    /// Validate a booking request against the tutor's grid and atomically
    /// lock the covered slots. The tutor's write lock is held from lookup
    /// through apply, so overlapping requests serialize and at most one wins.
    pub async fn create_booking(
        &self,
        actor: &Identity,
        req: BookingRequest,
    ) -> Result<Booking, EngineError> {
        require_role(actor, Role::Student)?;
        validate_range(req.start, req.end)?;
        if let Some(ref note) = req.note
            && note.len() > MAX_NOTE_LEN {
                return Err(EngineError::LimitExceeded("note too long"));
            }
        if self.bookings.len() >= MAX_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        let ts = self
            .get_tutor(&req.tutor)
            .ok_or(EngineError::NotFound(req.tutor))?;
        let mut guard = ts.write().await;

        let date = normalize_day(req.date)
            .ok_or(EngineError::Validation("date out of range"))?;
        let day = guard
            .day_slots(date)
            .ok_or(EngineError::Validation("no availability on this date"))?;

        let candidates = slots_in_range(day, req.start, req.end);
        if let Err(e) = check_lockable(&candidates, req.start, req.end) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let booking = Booking {
            id: Ulid::new(),
            tutor: req.tutor,
            student: actor.id,
            session: req.session,
            date,
            start: req.start,
            end: req.end,
            location: req.location,
            note: req.note,
            status: BookingStatus::Pending,
            created_at: now_ms(),
            finished_at: None,
            reject_note: None,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.commit_event(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Withdraw a booking. Only the owning student may cancel; the locked
    /// slots are released and the record is deleted.
    pub async fn cancel_booking(&self, actor: &Identity, id: Ulid) -> Result<Booking, EngineError> {
        let (tutor_id, mut guard) = self.lock_booking(&id).await?;
        let booking = self.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.student != actor.id {
            return Err(EngineError::Forbidden("not your booking"));
        }
        if !booking.status.in_flight() {
            return Err(EngineError::Validation("booking already settled"));
        }

        let event = Event::BookingCancelled { id, tutor: tutor_id };
        self.commit_event(&mut guard, &event).await?;
        Ok(booking)
    }

    /// Tutor accepts a pending booking. Slots stay locked.
    pub async fn confirm_booking(&self, actor: &Identity, id: Ulid) -> Result<Booking, EngineError> {
        let (tutor_id, mut guard) = self.lock_booking(&id).await?;
        let booking = self.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.tutor != actor.id {
            return Err(EngineError::Forbidden("not your booking"));
        }
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::Validation("booking is not pending"));
        }

        let event = Event::BookingConfirmed { id, tutor: tutor_id };
        self.commit_event(&mut guard, &event).await?;
        Ok(self.booking(&id).ok_or(EngineError::NotFound(id))?)
    }

    /// Tutor declines a pending booking. The slots are released, symmetric
    /// with cancellation.
    pub async fn reject_booking(
        &self,
        actor: &Identity,
        id: Ulid,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(ref note) = note
            && note.len() > MAX_NOTE_LEN {
                return Err(EngineError::LimitExceeded("note too long"));
            }
        let (tutor_id, mut guard) = self.lock_booking(&id).await?;
        let booking = self.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.tutor != actor.id {
            return Err(EngineError::Forbidden("not your booking"));
        }
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::Validation("booking is not pending"));
        }

        let event = Event::BookingRejected { id, tutor: tutor_id, note };
        self.commit_event(&mut guard, &event).await?;
        Ok(self.booking(&id).ok_or(EngineError::NotFound(id))?)
    }

    // ── Sweep transitions ────────────────────────────────
    //
    // The sweep is the only caller of the two transitions below. Each one
    // re-validates status under the tutor lock, so a tick that overlaps a
    // user action (or another tick) observes the final state and skips.

    /// Confirmed booking whose scheduled end has passed → finished.
    pub async fn finish_booking(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let (tutor_id, mut guard) = self.lock_booking(&id).await?;
        let booking = self.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::Validation("booking is not confirmed"));
        }

        let event = Event::BookingFinished {
            id,
            tutor: tutor_id,
            finished_at: now,
        };
        self.commit_event(&mut guard, &event).await
    }

    /// Pending booking nobody acted on before its end → expired. The slots
    /// are released.
    pub async fn expire_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let (tutor_id, mut guard) = self.lock_booking(&id).await?;
        let booking = self.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::Validation("booking is not pending"));
        }

        let event = Event::BookingExpired { id, tutor: tutor_id };
        self.commit_event(&mut guard, &event).await
    }

    /// In-flight bookings whose scheduled end has passed, with the status
    /// observed at scan time. Level-triggered: settled bookings never match,
    /// so re-running over the same state selects nothing.
    pub fn collect_due_bookings(&self, now: Ms) -> Vec<(Ulid, BookingStatus)> {
        self.bookings
            .iter()
            .filter(|b| b.status.in_flight() && now > b.end_instant())
            .map(|b| (b.id, b.status))
            .collect()
    }

    /// Rewrite the WAL down to the events needed to recreate the current
    /// state: one registration per tutor, one availability event per grid
    /// day, one creation event per booking (carrying its current status).
    pub async fn compact(&self) -> Result<(), EngineError> {
        let mut snapshot = Vec::new();

        let tutor_ids: Vec<Ulid> = self.tutors.iter().map(|e| *e.key()).collect();
        for id in tutor_ids {
            let Some(ts) = self.get_tutor(&id) else { continue };
            // Hold the tutor lock while emitting, so grid flags and booking
            // records agree within the snapshot.
            let guard = ts.read().await;
            snapshot.push(Event::TutorRegistered { id: guard.id });
            for (date, slots) in &guard.grid {
                snapshot.push(Event::AvailabilitySet {
                    tutor: guard.id,
                    date: *date,
                    slots: slots.clone(),
                });
            }
            let mut tutor_bookings: Vec<Booking> = self
                .bookings
                .iter()
                .filter(|b| b.tutor == guard.id)
                .map(|b| b.value().clone())
                .collect();
            tutor_bookings.sort_by_key(|b| b.id);
            for booking in tutor_bookings {
                snapshot.push(Event::BookingCreated { booking });
            }
        }

        let (ack, done) = oneshot::channel();
        self.log_tx
            .send(LogCommand::Rewrite(snapshot, ack))
            .await
            .map_err(|_| EngineError::Storage("log writer is gone".into()))?;
        done.await
            .map_err(|_| EngineError::Storage("log writer dropped the ack".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Events appended since the last compaction, as the log writer sees it.
    pub async fn wal_backlog(&self) -> u64 {
        let (ack, done) = oneshot::channel();
        if self.log_tx.send(LogCommand::Backlog(ack)).await.is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }
}
