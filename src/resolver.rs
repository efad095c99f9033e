//! Effective time and delay badge for one scheduled stop.

use crate::model::{DelaySource, DisplayStopRow, ScheduledStopTime, TripOverrideFlags};
use crate::snapshot::{FeedSnapshot, StopEvent};
use crate::time::{GtfsTime, ServiceDay, round_minutes};

/// Resolves one stop in priority order: manual cancellation, manual delay,
/// absolute feed time, feed delay, schedule.
///
/// The scheduled time shown is the departure. An absolute feed time is
/// converted back to a service-day time through `service_day` so that
/// post-midnight arrivals keep their ≥24:00 value.
pub fn resolve_stop(
    stop_time: &ScheduledStopTime,
    snapshot: &FeedSnapshot,
    flags: &TripOverrideFlags,
    service_day: &ServiceDay,
) -> DisplayStopRow {
    let event = snapshot.lookup(&stop_time.trip_id, &stop_time.stop_id, stop_time.stop_sequence);
    let scheduled = stop_time.departure;

    let mut row = DisplayStopRow {
        trip_id: stop_time.trip_id.clone(),
        stop_id: stop_time.stop_id.clone(),
        stop_sequence: stop_time.stop_sequence,
        scheduled,
        effective: scheduled,
        delay_minutes: None,
        source: DelaySource::Scheduled,
        skipped: false,
        has_realtime: event.is_some(),
        manual: flags.clone(),
    };

    if flags.is_manually_cancelled {
        row.skipped = true;
        row.source = DelaySource::Cancelled;
        return row;
    }

    if let Some(manual) = flags.delay_info.as_ref().filter(|_| flags.is_manually_delayed) {
        row.effective = scheduled.offset_by(manual.minutes as i64 * 60);
        row.delay_minutes = Some(manual.minutes);
        row.source = DelaySource::Manual;
        return row;
    }

    let Some(event) = event else {
        return row;
    };

    if event.skipped {
        row.skipped = true;
        row.source = DelaySource::Skipped;
        return row;
    }

    if let Some((effective, delay)) = from_absolute_time(stop_time, event, service_day) {
        row.effective = effective;
        row.delay_minutes = Some(delay);
        row.source = DelaySource::Realtime;
    } else if let Some(delay) = event.delay_minutes {
        row.effective = scheduled.offset_by(delay as i64 * 60);
        row.delay_minutes = Some(delay);
        row.source = DelaySource::Realtime;
    }

    row
}

/// Updated service-day time and badge minutes from an absolute epoch.
fn from_absolute_time(
    stop_time: &ScheduledStopTime,
    event: &StopEvent,
    service_day: &ServiceDay,
) -> Option<(GtfsTime, i32)> {
    let (actual, scheduled) = match (event.actual_departure, event.actual_arrival) {
        (Some(departure), _) => (departure, stop_time.departure),
        (None, Some(arrival)) => (arrival, stop_time.arrival),
        (None, None) => return None,
    };

    let origin = service_day.epoch_of(GtfsTime::default())?;
    let scheduled_epoch = origin + scheduled.seconds() as i64;
    let effective = GtfsTime::default().offset_by(actual.checked_sub(origin)?);

    Some((effective, round_minutes(actual.checked_sub(scheduled_epoch)?)))
}
