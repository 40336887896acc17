use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds — the instant type used on the wire and in timestamps.
pub type Ms = i64;

/// Wall-clock time of day, minute precision, rendered as `"HH:MM"`.
///
/// `24:00` is allowed so a slot can end at midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotTime(u16);

impl SlotTime {
    pub const MIDNIGHT: SlotTime = SlotTime(0);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= 24 * 60).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }

    pub fn hour(&self) -> u16 {
        self.0 / 60
    }

    pub fn minute(&self) -> u16 {
        self.0 % 60
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSlotTimeError;

impl fmt::Display for ParseSlotTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day (expected HH:MM)")
    }
}

impl std::error::Error for ParseSlotTimeError {}

impl FromStr for SlotTime {
    type Err = ParseSlotTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s.split_once(':').ok_or(ParseSlotTimeError)?;
        let hour: u16 = h.parse().map_err(|_| ParseSlotTimeError)?;
        let minute: u16 = m.parse().map_err(|_| ParseSlotTimeError)?;
        Self::from_hm(hour, minute).ok_or(ParseSlotTimeError)
    }
}

impl Serialize for SlotTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl serde::de::Visitor<'_> for V {
            type Value = SlotTime;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a time of day as \"HH:MM\"")
            }
            fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<SlotTime, E> {
                s.parse().map_err(E::custom)
            }
        }
        deserializer.deserialize_str(V)
    }
}

/// UTC instant of a wall-clock time on a calendar day.
pub fn instant_at(date: NaiveDate, time: SlotTime) -> Ms {
    let midnight = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    midnight + Ms::from(time.minutes()) * 60_000
}

/// One bookable unit on a date. `booked` is the sole source of truth for
/// whether the unit is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: SlotTime,
    pub end: SlotTime,
    #[serde(default)]
    pub booked: bool,
}

impl Slot {
    pub fn free(start: SlotTime, end: SlotTime) -> Self {
        Self { start, end, booked: false }
    }
}

/// One date's slot list, as stored and as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
}

/// One entry of an availability edit. The date is an instant; the engine
/// normalizes it to its UTC calendar day. An empty slot list deletes the day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityEdit {
    pub date: Ms,
    pub slots: Vec<Slot>,
}

/// A tutor's declared free time: date → ordered slot list. Dates with no
/// slots are absent, never stored empty.
#[derive(Debug, Clone)]
pub struct TutorState {
    pub id: Ulid,
    pub grid: BTreeMap<NaiveDate, Vec<Slot>>,
}

impl TutorState {
    pub fn new(id: Ulid) -> Self {
        Self { id, grid: BTreeMap::new() }
    }

    pub fn day_slots(&self, date: NaiveDate) -> Option<&[Slot]> {
        self.grid.get(&date).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Tutor,
}

/// Authenticated caller, as supplied by the session handshake. Ownership and
/// capability checks trust this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: Ulid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Location {
    PublicPlace,
    TutorPlace,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Finished,
    Expired,
}

impl BookingStatus {
    /// Statuses whose slot locks are still held. Rejected and expired
    /// bookings have released theirs; cancelled ones no longer exist.
    pub fn holds_slots(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Finished)
    }

    /// Still awaiting a user- or time-driven transition.
    pub fn in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityFilter {
    Active,
    Inactive,
}

/// One reservation covering a contiguous run of a tutor's slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tutor: Ulid,
    pub student: Ulid,
    pub session: Ulid,
    pub date: NaiveDate,
    pub start: SlotTime,
    pub end: SlotTime,
    pub location: Location,
    pub note: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub finished_at: Option<Ms>,
    pub reject_note: Option<String>,
}

impl Booking {
    pub fn end_instant(&self) -> Ms {
        instant_at(self.date, self.end)
    }

    /// Wall-clock classification, independent of `status`: a booking is
    /// active until its scheduled end has passed.
    pub fn active_at(&self, now: Ms) -> bool {
        self.end_instant() > now
    }
}

/// The WAL record format. Slot lock state is never recorded directly; it is
/// derived by applying booking events to the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TutorRegistered {
        id: Ulid,
    },
    /// Wholesale replacement of one date's slot list; empty slots delete
    /// the date.
    AvailabilitySet {
        tutor: Ulid,
        date: NaiveDate,
        slots: Vec<Slot>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        tutor: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        tutor: Ulid,
    },
    BookingRejected {
        id: Ulid,
        tutor: Ulid,
        note: Option<String>,
    },
    BookingFinished {
        id: Ulid,
        tutor: Ulid,
        finished_at: Ms,
    },
    BookingExpired {
        id: Ulid,
        tutor: Ulid,
    },
}

impl Event {
    /// Owning tutor, for events that route to one tutor's state.
    /// Registration events are handled before routing and carry none.
    pub fn tutor(&self) -> Option<Ulid> {
        match self {
            Event::AvailabilitySet { tutor, .. }
            | Event::BookingCancelled { tutor, .. }
            | Event::BookingConfirmed { tutor, .. }
            | Event::BookingRejected { tutor, .. }
            | Event::BookingFinished { tutor, .. }
            | Event::BookingExpired { tutor, .. } => Some(*tutor),
            Event::BookingCreated { booking } => Some(booking.tutor),
            Event::TutorRegistered { .. } => None,
        }
    }
}
