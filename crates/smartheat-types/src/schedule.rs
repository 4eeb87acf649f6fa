//! Weekly heating tables and schedule resolution.
//!
//! A heating table is a list of `(day, time, temperature)` transitions. Each
//! entry applies from its own `(day, time)` until the next one; the week wraps
//! from Sunday back to Monday, so before the first transition of the week the
//! last transition of the previous week is still in force.
//!
//! Days are numbered the way the server numbers them: 0 is Monday, 6 is Sunday.
//!
//! ```
//! use smartheat_types::{HeatingTable, HeatingTableEntry};
//! use time::macros::{datetime, time};
//!
//! let table = HeatingTable::new(vec![
//!     HeatingTableEntry::new(1, time!(08:00), 21.0),
//!     HeatingTableEntry::new(1, time!(22:00), 16.0),
//! ])
//! .unwrap();
//!
//! // 2024-01-02 is a Tuesday (day 1).
//! assert_eq!(table.resolve(datetime!(2024-01-02 09:00)).unwrap(), 21.0);
//! ```

use std::cmp::Ordering;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{PrimitiveDateTime, Time};

use crate::error::ScheduleError;

/// Number of days in the weekly cycle.
pub const DAYS_PER_WEEK: u8 = 7;

/// One transition in a weekly heating table.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HeatingTableEntry {
    /// Day of week, 0 (Monday) to 6 (Sunday).
    pub day: u8,
    /// Local time of day at which the entry takes effect.
    #[cfg_attr(feature = "serde", serde(with = "time_of_day"))]
    pub time: Time,
    /// Target temperature in degrees Celsius.
    pub temperature: f32,
}

impl HeatingTableEntry {
    /// Create an entry.
    pub fn new(day: u8, time: Time, temperature: f32) -> Self {
        Self {
            day,
            time,
            temperature,
        }
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        if self.day >= DAYS_PER_WEEK {
            return Err(ScheduleError::InvalidDay(self.day));
        }
        if !self.temperature.is_finite() {
            return Err(ScheduleError::InvalidTemperature(self.temperature));
        }
        Ok(())
    }

    /// Position of the entry within the week.
    fn slot(&self) -> (u8, Time) {
        (self.day, self.time)
    }
}

/// A validated heating table, sorted by `(day, time)`.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "Vec<HeatingTableEntry>", into = "Vec<HeatingTableEntry>")
)]
pub struct HeatingTable {
    entries: Vec<HeatingTableEntry>,
}

impl HeatingTable {
    /// Validate and sort a list of entries.
    ///
    /// Entries are re-sorted rather than trusting the order the server sent.
    /// An empty list is accepted; it resolves to [`ScheduleError::Empty`].
    pub fn new(mut entries: Vec<HeatingTableEntry>) -> Result<Self, ScheduleError> {
        for entry in &entries {
            entry.validate()?;
        }
        entries.sort_by(|a, b| a.slot().cmp(&b.slot()));
        Ok(Self { entries })
    }

    /// An empty table.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The sorted entries.
    pub fn entries(&self) -> &[HeatingTableEntry] {
        &self.entries
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Temperature scheduled at the local wall-clock time `now`.
    pub fn resolve(&self, now: PrimitiveDateTime) -> Result<f32, ScheduleError> {
        resolve(&self.entries, now)
    }
}

impl TryFrom<Vec<HeatingTableEntry>> for HeatingTable {
    type Error = ScheduleError;

    fn try_from(entries: Vec<HeatingTableEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<HeatingTable> for Vec<HeatingTableEntry> {
    fn from(table: HeatingTable) -> Self {
        table.entries
    }
}

/// Resolve the scheduled temperature from an ordered table.
///
/// Returns the temperature of the last entry whose `(day, time)` is at or
/// before `now`. When `now` precedes every entry, the final entry of the
/// table applies (the week wraps around).
///
/// `entries` must be sorted by `(day, time)`; [`HeatingTable`] guarantees this.
pub fn resolve(entries: &[HeatingTableEntry], now: PrimitiveDateTime) -> Result<f32, ScheduleError> {
    let last = entries.last().ok_or(ScheduleError::Empty)?;
    let now_slot = (now.weekday().number_days_from_monday(), now.time());

    let mut current = None;
    for entry in entries {
        match entry.slot().cmp(&now_slot) {
            Ordering::Less | Ordering::Equal => current = Some(entry),
            Ordering::Greater => break,
        }
    }

    Ok(current.unwrap_or(last).temperature)
}

#[cfg(feature = "serde")]
mod time_of_day {
    //! `HH:MM[:SS[.ffffff]]` time-of-day strings, as sent by the server.

    use serde::{Deserialize, Deserializer, Serializer};
    use time::Time;
    use time::format_description::BorrowedFormatItem;
    use time::macros::format_description;

    pub fn serialize<S: Serializer>(time: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        let format = format_description!("[hour]:[minute]:[second]");
        let s = time.format(format).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Time, String> {
        let formats: [&[BorrowedFormatItem<'_>]; 3] = [
            format_description!("[hour]:[minute]:[second].[subsecond]"),
            format_description!("[hour]:[minute]:[second]"),
            format_description!("[hour]:[minute]"),
        ];
        formats
            .iter()
            .find_map(|format| Time::parse(s, *format).ok())
            .ok_or_else(|| format!("invalid time of day '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, time};

    fn reference_table() -> HeatingTable {
        HeatingTable::new(vec![
            HeatingTableEntry::new(1, time!(08:00), 21.0),
            HeatingTableEntry::new(1, time!(22:00), 16.0),
            HeatingTableEntry::new(3, time!(08:00), 21.0),
        ])
        .unwrap()
    }

    // 2024-01-01 is a Monday (day 0).

    #[test]
    fn test_resolve_inside_day() {
        let table = reference_table();
        assert_eq!(table.resolve(datetime!(2024-01-02 09:00)).unwrap(), 21.0);
        assert_eq!(table.resolve(datetime!(2024-01-02 23:00)).unwrap(), 16.0);
    }

    #[test]
    fn test_resolve_wraps_to_last_entry() {
        let table = reference_table();
        assert_eq!(table.resolve(datetime!(2024-01-01 05:00)).unwrap(), 21.0);
    }

    #[test]
    fn test_resolve_carries_across_days() {
        let table = reference_table();
        // Wednesday: Tuesday 22:00 still applies.
        assert_eq!(table.resolve(datetime!(2024-01-03 12:00)).unwrap(), 16.0);
        // Sunday: Thursday 08:00 still applies.
        assert_eq!(table.resolve(datetime!(2024-01-07 23:59)).unwrap(), 21.0);
    }

    #[test]
    fn test_resolve_exact_boundary() {
        let table = reference_table();
        assert_eq!(table.resolve(datetime!(2024-01-02 22:00)).unwrap(), 16.0);
        assert_eq!(table.resolve(datetime!(2024-01-02 21:59:59)).unwrap(), 21.0);
    }

    #[test]
    fn test_resolve_empty_table() {
        let table = HeatingTable::empty();
        assert_eq!(
            table.resolve(datetime!(2024-01-02 09:00)),
            Err(ScheduleError::Empty)
        );
    }

    #[test]
    fn test_resolve_is_stable() {
        let table = reference_table();
        let now = datetime!(2024-01-04 10:30);
        let first = table.resolve(now).unwrap();
        for _ in 0..10 {
            assert_eq!(table.resolve(now).unwrap(), first);
        }
    }

    #[test]
    fn test_new_sorts_entries() {
        let table = HeatingTable::new(vec![
            HeatingTableEntry::new(3, time!(08:00), 21.0),
            HeatingTableEntry::new(1, time!(22:00), 16.0),
            HeatingTableEntry::new(1, time!(08:00), 20.0),
        ])
        .unwrap();
        let slots: Vec<(u8, Time)> = table.entries().iter().map(|e| (e.day, e.time)).collect();
        assert_eq!(
            slots,
            vec![(1, time!(08:00)), (1, time!(22:00)), (3, time!(08:00))]
        );
        assert_eq!(table.resolve(datetime!(2024-01-02 09:00)).unwrap(), 20.0);
    }

    #[test]
    fn test_new_rejects_invalid_entries() {
        assert_eq!(
            HeatingTable::new(vec![HeatingTableEntry::new(7, time!(08:00), 21.0)]),
            Err(ScheduleError::InvalidDay(7))
        );
        assert!(matches!(
            HeatingTable::new(vec![HeatingTableEntry::new(0, time!(08:00), f32::NAN)]),
            Err(ScheduleError::InvalidTemperature(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_server_table() {
        let json = r#"[
            {"day": 3, "time": "08:00:00", "temperature": 21.0},
            {"day": 1, "time": "22:00", "temperature": 16.5},
            {"day": 1, "time": "08:00:00.000000", "temperature": 21.0}
        ]"#;
        let table: HeatingTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.entries()[0].day, 1);
        assert_eq!(table.entries()[1].temperature, 16.5);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_rejects_bad_day() {
        let json = r#"[{"day": 9, "time": "08:00", "temperature": 21.0}]"#;
        assert!(serde_json::from_str::<HeatingTable>(json).is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_time_of_day_formats() {
        assert_eq!(time_of_day::parse("06:30").unwrap(), time!(06:30));
        assert_eq!(time_of_day::parse("06:30:15").unwrap(), time!(06:30:15));
        assert!(time_of_day::parse("6h30").is_err());
    }
}
