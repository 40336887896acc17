use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn require_role(actor: &Identity, role: Role) -> Result<(), EngineError> {
    if actor.role == role {
        return Ok(());
    }
    Err(EngineError::Forbidden(match role {
        Role::Student => "requires student role",
        Role::Tutor => "requires tutor role",
    }))
}

/// Positive duration of a requested range, in minutes.
pub(crate) fn validate_range(start: SlotTime, end: SlotTime) -> Result<i64, EngineError> {
    let duration = i64::from(end.minutes()) - i64::from(start.minutes());
    if duration <= 0 {
        return Err(EngineError::Validation("end time must be after start time"));
    }
    Ok(duration)
}

/// Gate for the slot locker: the candidate run must cover the requested range
/// exactly — one slot per width unit, no gaps, nothing already booked.
///
/// Grid slots don't overlap, so a count that matches the requested duration
/// means gapless full coverage; any gap or partial overlap drops a candidate
/// and the count falls short.
pub(crate) fn check_lockable(
    candidates: &[Slot],
    start: SlotTime,
    end: SlotTime,
) -> Result<(), EngineError> {
    let duration = validate_range(start, end)?;
    if candidates.len() as i64 * SLOT_WIDTH_MINUTES != duration {
        return Err(EngineError::Validation(
            "slots are not continuous or partially booked",
        ));
    }
    if candidates.iter().any(|s| s.booked) {
        return Err(EngineError::Validation("one or more slots are already booked"));
    }
    Ok(())
}
