//! Composes scheduled stop times, the feed snapshot and manual overrides
//! into the rows of the displayed trip.

use std::collections::HashMap;
use tracing::debug;

use crate::model::{DisplayStopRow, OverrideMaps, ScheduledStopTime, TripOverrideFlags};
use crate::resolver::resolve_stop;
use crate::snapshot::FeedSnapshot;
use crate::time::ServiceDay;

/// Resolves every stop of one trip and keeps effective times non-decreasing.
///
/// Skipped rows do not take part in the clamp. The badge is left as
/// resolved so the rider still sees the reported delay.
pub fn merge_rows(
    stop_times: &[ScheduledStopTime],
    snapshot: &FeedSnapshot,
    flags: &TripOverrideFlags,
    service_day: &ServiceDay,
) -> Vec<DisplayStopRow> {
    let mut rows: Vec<DisplayStopRow> = stop_times
        .iter()
        .map(|st| resolve_stop(st, snapshot, flags, service_day))
        .collect();

    let mut floor = None;
    for row in rows.iter_mut().filter(|r| !r.skipped) {
        match floor {
            Some(floor) if row.effective < floor => {
                debug!(stop_id = %row.stop_id, "Clamping effective time to previous stop");
                row.effective = floor;
            }
            _ => {}
        }
        floor = Some(row.effective);
    }

    rows
}

/// Remembers the manual flags each trip was last rendered with so that an
/// override refresh only recomputes trips it actually changes.
#[derive(Debug)]
pub struct OverrideMerger {
    service_day: ServiceDay,
    rendered: HashMap<String, TripOverrideFlags>,
}

impl OverrideMerger {
    pub fn new(service_day: ServiceDay) -> Self {
        Self {
            service_day,
            rendered: HashMap::new(),
        }
    }

    pub fn service_day(&self) -> &ServiceDay {
        &self.service_day
    }

    /// Full rows for one trip. `stop_times` must belong to a single trip.
    pub fn merge(
        &mut self,
        stop_times: &[ScheduledStopTime],
        snapshot: &FeedSnapshot,
        overrides: &OverrideMaps,
    ) -> Vec<DisplayStopRow> {
        let Some(trip_id) = stop_times.first().map(|st| st.trip_id.as_str()) else {
            return Vec::new();
        };
        let flags = overrides.flags_for(trip_id);
        let rows = merge_rows(stop_times, snapshot, &flags, &self.service_day);
        self.rendered.insert(trip_id.to_string(), flags);
        rows
    }

    /// Recomputes the trip's rows only when new override maps change its
    /// flags or delay amount.
    pub fn on_overrides(
        &mut self,
        stop_times: &[ScheduledStopTime],
        snapshot: &FeedSnapshot,
        overrides: &OverrideMaps,
    ) -> Option<Vec<DisplayStopRow>> {
        let trip_id = stop_times.first().map(|st| st.trip_id.as_str())?;
        let flags = overrides.flags_for(trip_id);
        let previous = self.rendered.get(trip_id).cloned().unwrap_or_default();
        if previous == flags {
            return None;
        }
        debug!(trip_id, "Manual overrides changed, recomputing trip");
        Some(self.merge(stop_times, snapshot, overrides))
    }

    /// Drops remembered flags, e.g. on a date change.
    pub fn reset(&mut self, service_day: ServiceDay) {
        self.service_day = service_day;
        self.rendered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CancelledTrip, DelaySource, DelayedTrip};
    use crate::snapshot::StopEvent;
    use crate::time::GtfsTime;
    use chrono::NaiveDate;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    fn trip_stops() -> Vec<ScheduledStopTime> {
        (1..=3)
            .map(|seq| {
                let t = GtfsTime::from_hms(8, seq * 10, 0);
                ScheduledStopTime {
                    trip_id: "T".into(),
                    stop_id: format!("S{seq}"),
                    stop_sequence: seq,
                    arrival: t,
                    departure: t,
                }
            })
            .collect()
    }

    fn on_time_snapshot() -> FeedSnapshot {
        let mut snapshot = FeedSnapshot::new(0);
        for st in trip_stops() {
            snapshot.record(
                &st.trip_id,
                &st.stop_id,
                Some(st.stop_sequence),
                StopEvent {
                    delay_minutes: Some(0),
                    ..Default::default()
                },
            );
        }
        snapshot
    }

    fn cancelled_maps() -> OverrideMaps {
        OverrideMaps::from_records(
            "net",
            date(),
            vec![CancelledTrip {
                trip_id: "T".into(),
                date: date(),
                reason: Some("driver shortage".into()),
            }],
            vec![],
        )
    }

    fn merger() -> OverrideMerger {
        OverrideMerger::new(ServiceDay::new(date(), chrono_tz::UTC))
    }

    #[test]
    fn test_cancelled_trip_with_on_time_feed_is_fully_skipped() {
        let rows = merger().merge(&trip_stops(), &on_time_snapshot(), &cancelled_maps());
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert!(row.skipped);
            assert_eq!(row.delay_minutes, None);
            assert!(row.manual.is_manually_cancelled);
            assert_eq!(row.manual.cancellation_reason.as_deref(), Some("driver shortage"));
        }
    }

    #[test]
    fn test_effective_times_never_go_backwards() {
        let mut snapshot = FeedSnapshot::new(0);
        snapshot.record(
            "T",
            "S1",
            Some(1),
            StopEvent {
                delay_minutes: Some(15),
                ..Default::default()
            },
        );
        snapshot.record(
            "T",
            "S2",
            Some(2),
            StopEvent {
                delay_minutes: Some(0),
                ..Default::default()
            },
        );

        let rows = merger().merge(&trip_stops(), &snapshot, &OverrideMaps::empty("net", date()));
        assert_eq!(rows[0].effective, GtfsTime::from_hms(8, 25, 0));
        assert_eq!(rows[1].effective, GtfsTime::from_hms(8, 25, 0));
        assert_eq!(rows[1].delay_minutes, Some(0));
        assert_eq!(rows[2].effective, GtfsTime::from_hms(8, 30, 0));
    }

    #[test]
    fn test_on_overrides_only_recomputes_on_material_change() {
        let mut merger = merger();
        let empty = OverrideMaps::empty("net", date());
        merger.merge(&trip_stops(), &on_time_snapshot(), &empty);

        assert!(merger.on_overrides(&trip_stops(), &on_time_snapshot(), &empty).is_none());

        let delayed = |minutes| {
            OverrideMaps::from_records(
                "net",
                date(),
                vec![],
                vec![DelayedTrip {
                    trip_id: "T".into(),
                    date: date(),
                    delay_minutes: minutes,
                    reason: None,
                }],
            )
        };

        let rows = merger
            .on_overrides(&trip_stops(), &on_time_snapshot(), &delayed(12))
            .unwrap();
        assert!(rows.iter().all(|r| r.source == DelaySource::Manual && r.delay_minutes == Some(12)));

        assert!(merger.on_overrides(&trip_stops(), &on_time_snapshot(), &delayed(12)).is_none());
        assert!(merger.on_overrides(&trip_stops(), &on_time_snapshot(), &delayed(20)).is_some());
    }

    #[test]
    fn test_merge_of_empty_trip_is_empty() {
        let rows = merger().merge(&[], &FeedSnapshot::empty(), &OverrideMaps::empty("net", date()));
        assert!(rows.is_empty());
    }
}
