//! Live refresh: three fixed-interval loops keep the latest trip-update
//! snapshot, vehicle positions and override maps published on `watch`
//! channels.
//!
//! A value is replaced only when a poll fully succeeds. Failed polls are
//! logged and the previous value stays visible until the next tick.

use chrono::NaiveDate;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, warn};

use crate::config::RefreshIntervals;
use crate::decode::{Decoded, FeedDecoder};
use crate::error::FeedError;
use crate::fetch::{HttpClient, fetch_source};
use crate::model::{OverrideMaps, VehiclePosition};
use crate::snapshot::FeedSnapshot;
use crate::stats::SnapshotStats;
use crate::store::{OverrideStore, TimetableStore, load_override_maps};

/// One pollable feed: where to read it, with which client, in which format.
#[derive(Clone)]
pub struct FeedSource {
    pub client: Arc<dyn HttpClient>,
    /// URL or local file path.
    pub location: String,
    pub decoder: FeedDecoder,
}

impl FeedSource {
    pub fn new(client: Arc<dyn HttpClient>, location: impl Into<String>, decoder: FeedDecoder) -> Self {
        Self {
            client,
            location: location.into(),
            decoder,
        }
    }
}

/// Polls trip updates once. Each route is fetched and decoded in its own
/// task; the combined snapshot is only returned when every route succeeded.
///
/// With no routes the whole feed is decoded unfiltered. Entities without a
/// route pass every route filter, so they land in each route's snapshot and
/// collapse to one entry on merge, while their stats are counted per route.
#[tracing::instrument(skip(feed, store), fields(location = %feed.location))]
pub async fn poll_trip_updates(
    feed: &FeedSource,
    routes: &[String],
    store: Arc<dyn TimetableStore>,
) -> Result<Decoded, FeedError> {
    if routes.is_empty() {
        let payload = fetch_source(&*feed.client, &feed.location).await?;
        return Ok(feed.decoder.try_decode(&payload, None, &*store).await?);
    }

    let mut tasks = JoinSet::new();
    for route in routes {
        let feed = feed.clone();
        let store = Arc::clone(&store);
        let route = route.clone();
        let span = tracing::debug_span!("route_poll", route = %route);
        tasks.spawn(
            async move {
                let payload = fetch_source(&*feed.client, &feed.location).await?;
                let decoded = feed
                    .decoder
                    .try_decode(&payload, Some(route.as_str()), &*store)
                    .await?;
                Ok::<_, FeedError>(decoded)
            }
            .instrument(span),
        );
    }

    let mut combined = Decoded::default();
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(FeedError::from).and_then(|r| r) {
            Ok(decoded) => {
                combined.snapshot.absorb(decoded.snapshot);
                combined.stats.absorb(&decoded.stats);
            }
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(combined),
    }
}

/// Polls vehicle positions once.
#[tracing::instrument(skip(feed), fields(location = %feed.location))]
pub async fn poll_vehicles(feed: &FeedSource) -> Result<Vec<VehiclePosition>, FeedError> {
    let payload = fetch_source(&*feed.client, &feed.location).await?;
    Ok(feed.decoder.try_decode_vehicles(&payload)?)
}

/// Everything the live loops need, handed over once at start.
pub struct LiveSources {
    pub network_id: String,
    pub date: NaiveDate,
    pub routes: Vec<String>,
    pub trip_updates: FeedSource,
    pub vehicle_positions: Option<FeedSource>,
    pub timetable: Arc<dyn TimetableStore>,
    pub overrides: Arc<dyn OverrideStore>,
}

/// Handle on the running refresh loops and their latest published values.
pub struct LiveBoard {
    snapshot: watch::Receiver<Arc<FeedSnapshot>>,
    vehicles: watch::Receiver<Arc<Vec<VehiclePosition>>>,
    overrides: watch::Receiver<Arc<OverrideMaps>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveBoard {
    /// Spawns the refresh loops. The first tick of each fires immediately.
    pub fn start(sources: LiveSources, refresh: RefreshIntervals) -> Self {
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(FeedSnapshot::empty()));
        let (vehicles_tx, vehicles) = watch::channel(Arc::new(Vec::new()));
        let (overrides_tx, overrides) = watch::channel(Arc::new(OverrideMaps::empty(
            &sources.network_id,
            sources.date,
        )));

        let mut tasks = Vec::with_capacity(3);

        let trip_updates = sources.trip_updates;
        let routes = Arc::new(sources.routes);
        let timetable = sources.timetable;
        tasks.push(spawn_refresh(
            "trip_updates",
            refresh.trip_updates(),
            snapshot_tx,
            move || {
                let feed = trip_updates.clone();
                let routes = Arc::clone(&routes);
                let store = Arc::clone(&timetable);
                async move {
                    let decoded = poll_trip_updates(&feed, &routes, store).await?;
                    let stats = SnapshotStats::from_snapshot(&decoded.snapshot);
                    info!(
                        produced_at = stats.produced_at,
                        stops = stats.stops,
                        skipped = stats.skipped,
                        with_delay = stats.with_delay,
                        on_time_pct = stats.on_time_pct(),
                        dropped = decoded.stats.updates_dropped,
                        "Snapshot published"
                    );
                    Ok(decoded.snapshot)
                }
            },
        ));

        if let Some(feed) = sources.vehicle_positions {
            tasks.push(spawn_refresh(
                "vehicle_positions",
                refresh.vehicles(),
                vehicles_tx,
                move || {
                    let feed = feed.clone();
                    async move {
                        let positions = poll_vehicles(&feed).await?;
                        debug!(positions = positions.len(), "Vehicle positions published");
                        Ok(positions)
                    }
                },
            ));
        }

        let store = sources.overrides;
        let network_id = sources.network_id;
        let date = sources.date;
        tasks.push(spawn_refresh(
            "overrides",
            refresh.overrides(),
            overrides_tx,
            move || {
                let store = Arc::clone(&store);
                let network_id = network_id.clone();
                async move {
                    let maps = load_override_maps(&*store, &network_id, date).await?;
                    Ok(maps)
                }
            },
        ));

        Self {
            snapshot,
            vehicles,
            overrides,
            tasks,
        }
    }

    /// Latest good snapshot; empty until the first successful poll.
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn vehicles(&self) -> Arc<Vec<VehiclePosition>> {
        Arc::clone(&self.vehicles.borrow())
    }

    pub fn overrides(&self) -> Arc<OverrideMaps> {
        Arc::clone(&self.overrides.borrow())
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.snapshot.clone()
    }

    pub fn subscribe_vehicles(&self) -> watch::Receiver<Arc<Vec<VehiclePosition>>> {
        self.vehicles.clone()
    }

    pub fn subscribe_overrides(&self) -> watch::Receiver<Arc<OverrideMaps>> {
        self.overrides.clone()
    }

    /// Aborts every loop. Published values stay readable.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }
}

impl Drop for LiveBoard {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_refresh<T, F, Fut>(
    name: &'static str,
    period: Duration,
    sender: watch::Sender<Arc<T>>,
    mut poll: F,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FeedError>> + Send,
{
    let span = tracing::info_span!("refresh", source = name, period_secs = period.as_secs());
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match poll().await {
                    Ok(value) => {
                        sender.send_replace(Arc::new(value));
                    }
                    Err(e) => warn!(error = %e, "Refresh failed, keeping previous value"),
                }
            }
        }
        .instrument(span),
    )
}
