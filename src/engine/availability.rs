use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::model::*;

// ── Slot Grid Algorithms ─────────────────────────────────────────

/// Calendar day of a unix-ms instant, truncated in UTC.
///
/// Date lookups compare the date portion of the normalized UTC timestamp, not
/// the local calendar day, so the same instant always lands on the same grid
/// key regardless of where the client lives. `None` if the instant is outside
/// chrono's representable range.
pub fn normalize_day(t: Ms) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// Slots falling entirely inside `[from, to]`: `start >= from && end <= to`.
pub fn slots_in_range(slots: &[Slot], from: SlotTime, to: SlotTime) -> Vec<Slot> {
    slots
        .iter()
        .filter(|s| s.start >= from && s.end <= to)
        .copied()
        .collect()
}

/// Flip the booked flag on every slot inside `[from, to]`.
pub fn mark_range(slots: &mut [Slot], from: SlotTime, to: SlotTime, booked: bool) {
    for slot in slots.iter_mut() {
        if slot.start >= from && slot.end <= to {
            slot.booked = booked;
        }
    }
}

/// One merge step of an availability edit: a non-empty list replaces the
/// whole day (booked flags included, exactly as submitted), an empty list
/// deletes the day. Other dates are untouched.
pub fn replace_day(grid: &mut BTreeMap<NaiveDate, Vec<Slot>>, date: NaiveDate, mut slots: Vec<Slot>) {
    if slots.is_empty() {
        grid.remove(&date);
    } else {
        slots.sort_by_key(|s| s.start);
        grid.insert(date, slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> SlotTime {
        s.parse().unwrap()
    }

    fn slot(start: &str, end: &str) -> Slot {
        Slot::free(t(start), t(end))
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    const DAY: Ms = 86_400_000;

    // ── normalize_day ────────────────────────────────────

    #[test]
    fn normalize_truncates_to_utc_date() {
        assert_eq!(normalize_day(0), Some(date("1970-01-01")));
        assert_eq!(normalize_day(DAY - 1), Some(date("1970-01-01")));
        assert_eq!(normalize_day(DAY), Some(date("1970-01-02")));
    }

    #[test]
    fn normalize_same_day_instants_collapse() {
        let morning = normalize_day(10 * DAY + 9 * 3_600_000);
        let night = normalize_day(10 * DAY + 23 * 3_600_000 + 59 * 60_000);
        assert_eq!(morning, night);
    }

    #[test]
    fn normalize_out_of_range_is_none() {
        assert_eq!(normalize_day(i64::MAX), None);
    }

    // ── slots_in_range ───────────────────────────────────

    #[test]
    fn range_selects_fully_contained_slots() {
        let slots = vec![
            slot("08:00", "09:00"),
            slot("09:00", "10:00"),
            slot("10:00", "11:00"),
        ];
        let hit = slots_in_range(&slots, t("09:00"), t("11:00"));
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[0].start, t("09:00"));
        assert_eq!(hit[1].start, t("10:00"));
    }

    #[test]
    fn range_exact_single_slot() {
        let slots = vec![slot("09:00", "10:00")];
        let hit = slots_in_range(&slots, t("09:00"), t("10:00"));
        assert_eq!(hit.len(), 1);
    }

    #[test]
    fn range_partial_overlap_excluded() {
        // request starts 30 minutes into the slot → slot not contained
        let slots = vec![slot("09:00", "10:00")];
        assert!(slots_in_range(&slots, t("09:30"), t("10:00")).is_empty());
        // request ends before the slot does
        assert!(slots_in_range(&slots, t("09:00"), t("09:30")).is_empty());
    }

    #[test]
    fn range_empty_input() {
        assert!(slots_in_range(&[], t("00:00"), t("24:00")).is_empty());
    }

    // ── mark_range ───────────────────────────────────────

    #[test]
    fn mark_flips_only_contained_slots() {
        let mut slots = vec![
            slot("08:00", "09:00"),
            slot("09:00", "10:00"),
            slot("10:00", "11:00"),
        ];
        mark_range(&mut slots, t("09:00"), t("11:00"), true);
        assert!(!slots[0].booked);
        assert!(slots[1].booked);
        assert!(slots[2].booked);

        mark_range(&mut slots, t("10:00"), t("11:00"), false);
        assert!(slots[1].booked);
        assert!(!slots[2].booked);
    }

    // ── replace_day ──────────────────────────────────────

    #[test]
    fn replace_is_wholesale() {
        let mut grid = BTreeMap::new();
        let d = date("2025-07-20");
        let mut booked = slot("09:00", "10:00");
        booked.booked = true;
        grid.insert(d, vec![booked, slot("10:00", "11:00")]);

        // resubmitting the day without the booked flag erases it
        replace_day(&mut grid, d, vec![slot("09:00", "10:00")]);
        let day = &grid[&d];
        assert_eq!(day.len(), 1);
        assert!(!day[0].booked);
    }

    #[test]
    fn empty_list_deletes_day() {
        let mut grid = BTreeMap::new();
        let d = date("2025-07-20");
        grid.insert(d, vec![slot("09:00", "10:00")]);
        replace_day(&mut grid, d, Vec::new());
        assert!(!grid.contains_key(&d));
    }

    #[test]
    fn replace_leaves_other_days_alone() {
        let mut grid = BTreeMap::new();
        let d1 = date("2025-07-20");
        let d2 = date("2025-07-21");
        let original = vec![slot("09:00", "10:00"), slot("10:00", "11:00")];
        grid.insert(d1, original.clone());

        replace_day(&mut grid, d2, vec![slot("14:00", "15:00")]);
        assert_eq!(grid[&d1], original);
    }

    #[test]
    fn replace_sorts_by_start() {
        let mut grid = BTreeMap::new();
        let d = date("2025-07-20");
        replace_day(
            &mut grid,
            d,
            vec![slot("11:00", "12:00"), slot("09:00", "10:00")],
        );
        let day = &grid[&d];
        assert!(day[0].start < day[1].start);
    }
}
