//! Read-only attendance aggregates
//!
//! Derived on demand from fetched records; nothing here is stored.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{AttendanceRecord, Slot, Status};

/// Status counts for one slot across a scope. Unset slots are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotTally {
    pub present: usize,
    pub excused: usize,
    pub unexcused: usize,
}

impl SlotTally {
    fn add(&mut self, status: Status) {
        match status {
            Status::Present => self.present += 1,
            Status::Excused => self.excused += 1,
            Status::Unexcused => self.unexcused += 1,
            Status::Unset => {}
        }
    }

    pub fn total(&self) -> usize {
        self.present + self.excused + self.unexcused
    }
}

/// Per-slot present/excused/unexcused counts.
pub fn day_counts<'a>(records: impl IntoIterator<Item = &'a AttendanceRecord>) -> BTreeMap<Slot, SlotTally> {
    let mut tallies: BTreeMap<Slot, SlotTally> =
        Slot::ALL.into_iter().map(|s| (s, SlotTally::default())).collect();
    for record in records {
        for (slot, status) in record.slots() {
            if let Some(tally) = tallies.get_mut(&slot) {
                tally.add(status);
            }
        }
    }
    tallies
}

/// Number of unexcused slots across all given records.
pub fn count_unexcused<'a>(records: impl IntoIterator<Item = &'a AttendanceRecord>) -> usize {
    records
        .into_iter()
        .flat_map(|r| r.slots())
        .filter(|(_, status)| *status == Status::Unexcused)
        .count()
}

/// Calendar dates with an unexcused slot, ascending and deduplicated.
pub fn unexcused_dates<'a>(records: impl IntoIterator<Item = &'a AttendanceRecord>) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = records
        .into_iter()
        .flat_map(|r| {
            r.slots()
                .filter(|(_, status)| *status == Status::Unexcused)
                .map(|(slot, _)| slot.date_in_week(r.week_start))
                .collect::<Vec<_>>()
        })
        .collect();
    dates.sort();
    dates.dedup();
    dates
}
