//! Bounds on externally-supplied input. Every collection or string that a
//! client controls is capped before it reaches engine state.

pub const MAX_TUTORS: usize = 100_000;
pub const MAX_BOOKINGS: usize = 1_000_000;

/// Days a single availability edit may touch.
pub const MAX_EDIT_ENTRIES: usize = 100;
pub const MAX_SLOTS_PER_DAY: usize = 96;
pub const MAX_GRID_DAYS: usize = 400;

pub const MAX_NOTE_LEN: usize = 1_000;

/// Wire frames above this length are rejected by the codec.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Width of one bookable slot. A booking range is valid only when it is
/// covered by exactly one free slot per this many minutes.
pub const SLOT_WIDTH_MINUTES: i64 = 60;
