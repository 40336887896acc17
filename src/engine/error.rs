use std::error::Error;
use std::fmt;

use ulid::Ulid;

/// What a mutation or query can fail with. Validation and Forbidden carry
/// the message shown to the caller; Storage carries the I/O detail, which
/// the wire layer logs but never forwards.
#[derive(Debug)]
pub enum EngineError {
    /// User-correctable request problem (bad range, no availability,
    /// non-contiguous selection, lost slot race, wrong-state transition).
    Validation(&'static str),
    /// Actor lacks the role or the ownership the operation requires.
    Forbidden(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    Storage(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => f.write_str(msg),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::NotFound(id) => write!(f, "not found: {id}"),
            Self::AlreadyExists(id) => write!(f, "already exists: {id}"),
            Self::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            Self::Storage(detail) => write!(f, "storage failure: {detail}"),
        }
    }
}

impl Error for EngineError {}
