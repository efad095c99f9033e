//! Read-only collaborators: the static timetable and the dispatcher override
//! tables.
//!
//! [`TimetableStore`] is the one authoritative source; its errors are the only
//! ones a view surfaces. [`OverrideStore`] failures leave prior maps in place.

mod overrides;
mod timetable;

pub use overrides::{JsonOverrideStore, StaticOverrides};
pub use timetable::StaticTimetable;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

use crate::error::StoreError;
use crate::model::{CancelledTrip, DelayedTrip, OverrideMaps, ScheduledStopTime, Trip};
use crate::time::GtfsTime;

#[async_trait]
pub trait TimetableStore: Send + Sync {
    /// Service ids running on `date`, calendar exceptions applied.
    async fn valid_service_ids(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError>;

    /// Trips of a route (and direction, when given) whose service is listed.
    async fn trips_for_service_ids(
        &self,
        route_id: &str,
        direction_id: Option<u32>,
        service_ids: &HashSet<String>,
    ) -> Result<Vec<Trip>, StoreError>;

    /// Stop times of one trip ordered by stop sequence.
    async fn stop_times_for_trip(&self, trip_id: &str) -> Result<Vec<ScheduledStopTime>, StoreError>;

    /// One lookup for a whole trip-id set. Unknown trips are absent from the map.
    async fn stop_times_for_trips(
        &self,
        trip_ids: &[String],
    ) -> Result<HashMap<String, Vec<ScheduledStopTime>>, StoreError>;

    /// First-stop departure per trip, batched.
    async fn first_stop_times(
        &self,
        trip_ids: &[String],
    ) -> Result<HashMap<String, GtfsTime>, StoreError>;
}

#[async_trait]
pub trait OverrideStore: Send + Sync {
    async fn cancelled_trips(
        &self,
        network_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CancelledTrip>, StoreError>;

    async fn delayed_trips(
        &self,
        network_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DelayedTrip>, StoreError>;
}

/// Fetches both override tables concurrently into one date-scoped map.
#[tracing::instrument(skip(store))]
pub async fn load_override_maps<S: OverrideStore + ?Sized>(
    store: &S,
    network_id: &str,
    date: NaiveDate,
) -> Result<OverrideMaps, StoreError> {
    let (cancelled, delayed) = tokio::try_join!(
        store.cancelled_trips(network_id, date),
        store.delayed_trips(network_id, date)
    )?;
    tracing::debug!(
        cancelled = cancelled.len(),
        delayed = delayed.len(),
        "Override tables loaded"
    );
    Ok(OverrideMaps::from_records(network_id, date, cancelled, delayed))
}
