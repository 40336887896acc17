use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::Engine;

impl Engine {
    /// A tutor's full grid, date-ascending. Unknown tutors read as an empty
    /// grid, not an error.
    pub async fn get_availability(&self, tutor: Ulid) -> Vec<DayAvailability> {
        let Some(ts) = self.get_tutor(&tutor) else {
            return Vec::new();
        };
        let guard = ts.read().await;
        guard
            .grid
            .iter()
            .map(|(date, slots)| DayAvailability {
                date: *date,
                slots: slots.clone(),
            })
            .collect()
    }

    /// The caller's bookings: tutors see bookings they teach, everyone else
    /// the ones they booked. The optional partition is wall-clock — a booking
    /// is active until its scheduled end passes, whatever its status says.
    pub fn list_bookings(&self, actor: &Identity, filter: Option<ActivityFilter>) -> Vec<Booking> {
        self.list_bookings_at(actor, filter, now_ms())
    }

    pub fn list_bookings_at(
        &self,
        actor: &Identity,
        filter: Option<ActivityFilter>,
        now: Ms,
    ) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| match actor.role {
                Role::Tutor => b.tutor == actor.id,
                Role::Student => b.student == actor.id,
            })
            .filter(|b| match filter {
                None => true,
                Some(ActivityFilter::Active) => b.active_at(now),
                Some(ActivityFilter::Inactive) => !b.active_at(now),
            })
            .map(|b| b.value().clone())
            .collect();
        out.sort_by(|a, b| (a.date, a.start).cmp(&(b.date, b.start)));
        out
    }

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}
