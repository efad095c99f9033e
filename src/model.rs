//! Timetable, override, telemetry and display types shared by every stage.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::time::GtfsTime;

/// One row of `stop_times.txt`; immutable reference data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledStopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival: GtfsTime,
    pub departure: GtfsTime,
}

/// Weekly service pattern valid over an inclusive date range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCalendar {
    pub service_id: String,
    /// Monday first.
    pub days: [bool; 7],
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ServiceCalendar {
    /// Weekday rule only; exceptions are applied by the caller.
    pub fn runs_on(&self, date: NaiveDate) -> bool {
        date >= self.start_date
            && date <= self.end_date
            && self.days[date.weekday().num_days_from_monday() as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    Added,
    Removed,
}

impl ExceptionKind {
    /// Maps GTFS `exception_type` (1 = added, 2 = removed).
    pub fn from_gtfs(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Added),
            2 => Some(Self::Removed),
            _ => None,
        }
    }
}

/// A `calendar_dates.txt` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarException {
    pub service_id: String,
    pub date: NaiveDate,
    pub kind: ExceptionKind,
}

/// A scheduled trip plus any manual markers attached for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub direction_id: Option<u32>,
    pub service_id: String,
    pub headsign: Option<String>,
    /// Nominal first departure from a trip summary, when the store has one.
    pub first_departure: Option<GtfsTime>,
    #[serde(default)]
    pub manual: TripOverrideFlags,
}

/// Dispatcher cancellation of one trip on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledTrip {
    pub trip_id: String,
    pub date: NaiveDate,
    pub reason: Option<String>,
}

/// Dispatcher delay of one trip on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedTrip {
    pub trip_id: String,
    pub date: NaiveDate,
    pub delay_minutes: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualDelay {
    pub minutes: i32,
    pub reason: Option<String>,
}

/// Trip-level manual state copied onto every stop row of the trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripOverrideFlags {
    pub is_manually_cancelled: bool,
    pub cancellation_reason: Option<String>,
    pub is_manually_delayed: bool,
    pub delay_info: Option<ManualDelay>,
}

/// Manual overrides for one network and one date, keyed by trip id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideMaps {
    pub network_id: String,
    pub date: NaiveDate,
    pub cancelled: HashMap<String, CancelledTrip>,
    pub delayed: HashMap<String, DelayedTrip>,
}

impl OverrideMaps {
    pub fn empty(network_id: &str, date: NaiveDate) -> Self {
        Self {
            network_id: network_id.to_string(),
            date,
            cancelled: HashMap::new(),
            delayed: HashMap::new(),
        }
    }

    /// Builds the maps, ignoring records for any other date.
    pub fn from_records(
        network_id: &str,
        date: NaiveDate,
        cancelled: Vec<CancelledTrip>,
        delayed: Vec<DelayedTrip>,
    ) -> Self {
        let mut maps = Self::empty(network_id, date);
        for c in cancelled.into_iter().filter(|c| c.date == date) {
            maps.cancelled.insert(c.trip_id.clone(), c);
        }
        for d in delayed.into_iter().filter(|d| d.date == date) {
            maps.delayed.insert(d.trip_id.clone(), d);
        }
        maps
    }

    pub fn flags_for(&self, trip_id: &str) -> TripOverrideFlags {
        let cancelled = self.cancelled.get(trip_id);
        let delayed = self.delayed.get(trip_id);
        TripOverrideFlags {
            is_manually_cancelled: cancelled.is_some(),
            cancellation_reason: cancelled.and_then(|c| c.reason.clone()),
            is_manually_delayed: delayed.is_some(),
            delay_info: delayed.map(|d| ManualDelay {
                minutes: d.delay_minutes,
                reason: d.reason.clone(),
            }),
        }
    }
}

/// Live vehicle telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub lat: f64,
    pub lon: f64,
    pub bearing: Option<f32>,
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    /// Epoch seconds; `0` means the agency has no reliable clock.
    pub timestamp: i64,
    pub label: Option<String>,
}

/// Which rule produced a row's effective time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelaySource {
    Scheduled,
    Realtime,
    Manual,
    Cancelled,
    Skipped,
}

/// One rendered stop of the displayed trip. Derived on every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayStopRow {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub scheduled: GtfsTime,
    pub effective: GtfsTime,
    pub delay_minutes: Option<i32>,
    pub source: DelaySource,
    pub skipped: bool,
    /// Feed data existed for this stop, even if it said "on time".
    pub has_realtime: bool,
    #[serde(flatten)]
    pub manual: TripOverrideFlags,
}

impl DisplayStopRow {
    pub fn scheduled_display(&self) -> String {
        self.scheduled.display()
    }

    pub fn effective_display(&self) -> String {
        self.effective.display()
    }
}
