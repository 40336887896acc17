use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{BookingRequest, Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

/// One JSON object per line. The first frame must be `hello`; everything
/// after runs as the identity it established.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        token: String,
        user: Ulid,
        role: Role,
    },
    RegisterTutor,
    SetAvailability {
        entries: Vec<AvailabilityEdit>,
    },
    GetAvailability {
        tutor: Ulid,
    },
    CreateBooking {
        tutor: Ulid,
        session: Ulid,
        date: Ms,
        start: SlotTime,
        end: SlotTime,
        location: Location,
        note: Option<String>,
    },
    CancelBooking {
        booking: Ulid,
    },
    ConfirmBooking {
        booking: Ulid,
    },
    RejectBooking {
        booking: Ulid,
        note: Option<String>,
    },
    ListBookings {
        filter: Option<ActivityFilter>,
    },
    Listen {
        tutor: Ulid,
    },
    Unlisten {
        tutor: Ulid,
    },
    UnlistenAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Limit,
    AlreadyExists,
    Internal,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready,
    Done,
    Grid { days: Vec<DayAvailability> },
    Booking { booking: Booking },
    Bookings { bookings: Vec<Booking> },
    Event { tutor: Ulid, event: Event },
    Error { code: ErrorCode, message: String },
}

/// Map an engine failure to its wire form. Unexpected internals are logged
/// and collapsed to a generic message — callers get the taxonomy, not the
/// stack.
fn failure(e: EngineError) -> Response {
    let (code, message) = match e {
        EngineError::NotFound(id) => (ErrorCode::NotFound, format!("not found: {id}")),
        EngineError::AlreadyExists(id) => (ErrorCode::AlreadyExists, format!("already exists: {id}")),
        EngineError::Forbidden(msg) => (ErrorCode::Forbidden, msg.to_string()),
        EngineError::Validation(msg) => (ErrorCode::Validation, msg.to_string()),
        EngineError::LimitExceeded(msg) => (ErrorCode::Limit, format!("limit exceeded: {msg}")),
        EngineError::Storage(detail) => {
            tracing::error!("persistence failure: {detail}");
            (ErrorCode::Internal, "internal error".to_string())
        }
    };
    Response::Error { code, message }
}

fn ok_booking(result: Result<Booking, EngineError>) -> Response {
    match result {
        Ok(booking) => Response::Booking { booking },
        Err(e) => failure(e),
    }
}

type Conn = Framed<TcpStream, LinesCodec>;

async fn send_json(framed: &mut Conn, response: &Response) -> io::Result<()> {
    let line = serde_json::to_string(response).map_err(io::Error::other)?;
    framed.send(line).await.map_err(io::Error::other)
}

/// Handshake: the first frame must carry the shared secret and the caller's
/// claimed identity. Returns `None` (after replying) when the session must
/// not proceed.
async fn authenticate(framed: &mut Conn, password: &str) -> io::Result<Option<Identity>> {
    let Some(frame) = framed.next().await else {
        return Ok(None);
    };
    let line = frame.map_err(io::Error::other)?;
    match serde_json::from_str::<Request>(&line) {
        Ok(Request::Hello { token, user, role }) if token == password => {
            send_json(framed, &Response::Ready).await?;
            Ok(Some(Identity { id: user, role }))
        }
        Ok(Request::Hello { .. }) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            send_json(
                framed,
                &Response::Error {
                    code: ErrorCode::Unauthorized,
                    message: "bad token".into(),
                },
            )
            .await?;
            Ok(None)
        }
        _ => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            send_json(
                framed,
                &Response::Error {
                    code: ErrorCode::Unauthorized,
                    message: "hello required".into(),
                },
            )
            .await?;
            Ok(None)
        }
    }
}

struct Session {
    identity: Identity,
    /// Forwarder task per listened tutor; aborted on unlisten/disconnect.
    listeners: HashMap<Ulid, JoinHandle<()>>,
    event_tx: mpsc::Sender<(Ulid, Event)>,
}

impl Session {
    fn listen(&mut self, engine: &Engine, tutor: Ulid) {
        let mut rx = engine.notify.subscribe(tutor);
        let tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send((tutor, event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("listener lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        // Re-listening replaces the old forwarder, so delivery stays single.
        if let Some(old) = self.listeners.insert(tutor, handle) {
            old.abort();
        }
    }

    fn unlisten(&mut self, tutor: &Ulid) {
        if let Some(handle) = self.listeners.remove(tutor) {
            handle.abort();
        }
    }

    fn unlisten_all(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unlisten_all();
    }
}

async fn dispatch(engine: &Engine, session: &mut Session, request: Request) -> Response {
    let actor = session.identity;
    match request {
        Request::Hello { .. } => Response::Error {
            code: ErrorCode::BadRequest,
            message: "already authenticated".into(),
        },
        Request::RegisterTutor => match engine.register_tutor(&actor).await {
            Ok(()) => Response::Done,
            Err(e) => failure(e),
        },
        Request::SetAvailability { entries } => {
            match engine.set_availability(&actor, entries).await {
                Ok(days) => Response::Grid { days },
                Err(e) => failure(e),
            }
        }
        Request::GetAvailability { tutor } => Response::Grid {
            days: engine.get_availability(tutor).await,
        },
        Request::CreateBooking {
            tutor,
            session: session_ref,
            date,
            start,
            end,
            location,
            note,
        } => ok_booking(
            engine
                .create_booking(
                    &actor,
                    BookingRequest {
                        tutor,
                        session: session_ref,
                        date,
                        start,
                        end,
                        location,
                        note,
                    },
                )
                .await,
        ),
        Request::CancelBooking { booking } => ok_booking(engine.cancel_booking(&actor, booking).await),
        Request::ConfirmBooking { booking } => {
            ok_booking(engine.confirm_booking(&actor, booking).await)
        }
        Request::RejectBooking { booking, note } => {
            ok_booking(engine.reject_booking(&actor, booking, note).await)
        }
        Request::ListBookings { filter } => Response::Bookings {
            bookings: engine.list_bookings(&actor, filter),
        },
        Request::Listen { tutor } => {
            session.listen(engine, tutor);
            Response::Done
        }
        Request::Unlisten { tutor } => {
            session.unlisten(&tutor);
            Response::Done
        }
        Request::UnlistenAll => {
            session.unlisten_all();
            Response::Done
        }
    }
}

pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let Some(identity) = authenticate(&mut framed, &password).await? else {
        return Ok(());
    };

    let (event_tx, mut event_rx) = mpsc::channel::<(Ulid, Event)>(256);
    let mut session = Session {
        identity,
        listeners: HashMap::new(),
        event_tx,
    };

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else { break };
                let line = frame.map_err(io::Error::other)?;
                let reply = match serde_json::from_str::<Request>(&line) {
                    Err(e) => Response::Error {
                        code: ErrorCode::BadRequest,
                        message: format!("bad request: {e}"),
                    },
                    Ok(request) => {
                        let label = observability::request_label(&request);
                        let start = std::time::Instant::now();
                        let reply = dispatch(&engine, &mut session, request).await;
                        metrics::counter!(observability::REQUESTS_TOTAL, "op" => label)
                            .increment(1);
                        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => label)
                            .record(start.elapsed().as_secs_f64());
                        reply
                    }
                };
                send_json(&mut framed, &reply).await?;
            }
            Some((tutor, event)) = event_rx.recv() => {
                send_json(&mut framed, &Response::Event { tutor, event }).await?;
            }
        }
    }

    Ok(())
}
