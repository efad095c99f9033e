//! Trip selection for a route/direction on a service date.
//!
//! The selector owns the per-trip first-departure cache. The cache and the
//! generation token are both tied to the current [`ViewContext`]; switching
//! context evicts the cache and makes any selection still in flight return
//! [`Selection::Superseded`].

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{CalendarException, ExceptionKind, OverrideMaps, ScheduledStopTime, ServiceCalendar, Trip};
use crate::store::TimetableStore;
use crate::time::GtfsTime;

/// Service ids valid on `date`.
///
/// A calendar counts when the date is in range and its weekday flag is set.
/// Exceptions for that exact date then force-include (`Added`) or exclude
/// (`Removed`) regardless of the weekday rule.
pub fn active_service_ids(
    calendars: &[ServiceCalendar],
    exceptions: &[CalendarException],
    date: NaiveDate,
) -> HashSet<String> {
    let mut ids: HashSet<String> = calendars
        .iter()
        .filter(|c| c.runs_on(date))
        .map(|c| c.service_id.clone())
        .collect();

    for exception in exceptions.iter().filter(|e| e.date == date) {
        match exception.kind {
            ExceptionKind::Added => {
                ids.insert(exception.service_id.clone());
            }
            ExceptionKind::Removed => {
                ids.remove(&exception.service_id);
            }
        }
    }

    ids
}

/// What the rider is looking at. Any change invalidates cached work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewContext {
    pub network_id: String,
    pub route_id: String,
    pub direction_id: Option<u32>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    pub context: ViewContext,
    pub target: GtfsTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureSource {
    /// First stop of stop_times already fetched for this context.
    Observed,
    /// Summary time carried by the trip record.
    Nominal,
    /// Batched first-stop lookup.
    FirstStop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateTrip {
    pub trip: Trip,
    pub effective_departure: GtfsTime,
    pub source: DepartureSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Selection {
    /// No service runs on this date.
    NoSchedule { date: NaiveDate },
    /// Trips sorted by raw effective departure; `index` is the nearest one.
    Selected {
        trips: Vec<CandidateTrip>,
        index: Option<usize>,
    },
    /// The view context changed while this selection was running.
    Superseded,
}

impl Selection {
    pub fn selected(&self) -> Option<&CandidateTrip> {
        match self {
            Selection::Selected {
                trips,
                index: Some(i),
            } => trips.get(*i),
            _ => None,
        }
    }

    /// Copies manual markers onto every listed trip.
    pub fn annotate(&mut self, overrides: &OverrideMaps) {
        if let Selection::Selected { trips, .. } = self {
            for candidate in trips.iter_mut() {
                candidate.trip.manual = overrides.flags_for(&candidate.trip.trip_id);
            }
        }
    }
}

/// Observed first-stop departures, keyed by trip id.
#[derive(Debug, Default)]
pub struct FirstDepartureCache {
    entries: HashMap<String, GtfsTime>,
}

impl FirstDepartureCache {
    pub fn get(&self, trip_id: &str) -> Option<GtfsTime> {
        self.entries.get(trip_id).copied()
    }

    pub fn insert(&mut self, trip_id: &str, departure: GtfsTime) {
        self.entries.insert(trip_id.to_string(), departure);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct SelectorState {
    context: Option<ViewContext>,
    generation: u64,
    cache: FirstDepartureCache,
}

/// Index of the candidate nearest `target` in raw minutes; ties keep list order.
pub fn nearest_index(candidates: &[CandidateTrip], target: GtfsTime) -> Option<usize> {
    let target = target.minutes() as i64;
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| (c.effective_departure.minutes() as i64 - target).abs())
        .map(|(i, _)| i)
}

pub struct ScheduleSelector<S: ?Sized> {
    store: Arc<S>,
    state: Mutex<SelectorState>,
}

impl<S: TimetableStore + ?Sized> ScheduleSelector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            state: Mutex::new(SelectorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes `context` current and returns its generation token. A different
    /// context bumps the generation and evicts the cache.
    pub fn switch_context(&self, context: &ViewContext) -> u64 {
        let mut state = self.state();
        if state.context.as_ref() != Some(context) {
            state.generation += 1;
            state.cache.clear();
            state.context = Some(context.clone());
            debug!(generation = state.generation, route = %context.route_id, date = %context.date, "View context switched");
        }
        state.generation
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.generation() == token
    }

    pub fn cached_departures(&self) -> usize {
        self.state().cache.len()
    }

    /// Fetches a trip's stop times and remembers its observed first departure.
    pub async fn stop_times(&self, trip_id: &str) -> Result<Vec<ScheduledStopTime>, StoreError> {
        let stop_times = self.store.stop_times_for_trip(trip_id).await?;
        if let Some(first) = stop_times.first() {
            self.state().cache.insert(trip_id, first.departure);
        }
        Ok(stop_times)
    }

    #[tracing::instrument(skip(self), fields(route = %request.context.route_id, date = %request.context.date, target = %request.target))]
    pub async fn select(&self, request: &SelectionRequest) -> Result<Selection, StoreError> {
        let token = self.switch_context(&request.context);
        let context = &request.context;

        let service_ids = self.store.valid_service_ids(context.date).await?;
        if service_ids.is_empty() {
            if !self.is_current(token) {
                return Ok(Selection::Superseded);
            }
            info!("No service on this date");
            return Ok(Selection::NoSchedule { date: context.date });
        }

        let trips = self
            .store
            .trips_for_service_ids(&context.route_id, context.direction_id, &service_ids)
            .await?;

        let mut resolved: Vec<(Trip, Option<(GtfsTime, DepartureSource)>)> = {
            let state = self.state();
            trips
                .into_iter()
                .map(|trip| {
                    let departure = state
                        .cache
                        .get(&trip.trip_id)
                        .map(|t| (t, DepartureSource::Observed))
                        .or(trip.first_departure.map(|t| (t, DepartureSource::Nominal)));
                    (trip, departure)
                })
                .collect()
        };

        let missing: Vec<String> = resolved
            .iter()
            .filter(|(_, d)| d.is_none())
            .map(|(t, _)| t.trip_id.clone())
            .collect();

        if !missing.is_empty() {
            let firsts = self.store.first_stop_times(&missing).await?;
            {
                let mut state = self.state();
                if state.generation == token {
                    for (trip_id, departure) in &firsts {
                        state.cache.insert(trip_id, *departure);
                    }
                }
            }
            for (trip, departure) in resolved.iter_mut().filter(|(_, d)| d.is_none()) {
                *departure = firsts
                    .get(&trip.trip_id)
                    .map(|t| (*t, DepartureSource::FirstStop));
            }
        }

        let mut candidates: Vec<CandidateTrip> = resolved
            .into_iter()
            .filter_map(|(trip, departure)| match departure {
                Some((effective_departure, source)) => Some(CandidateTrip {
                    trip,
                    effective_departure,
                    source,
                }),
                None => {
                    debug!(trip_id = %trip.trip_id, "Trip has no stop times, not selectable");
                    None
                }
            })
            .collect();

        // Raw minutes: 24:05 sorts after 23:40.
        candidates.sort_by_key(|c| c.effective_departure.minutes());
        let index = nearest_index(&candidates, request.target);

        if !self.is_current(token) {
            debug!(token, "Selection finished after a context switch, discarding");
            return Ok(Selection::Superseded);
        }

        info!(trips = candidates.len(), index = ?index, "Trip selection complete");
        Ok(Selection::Selected {
            trips: candidates,
            index,
        })
    }
}
