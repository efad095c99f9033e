use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use super::TimetableStore;
use crate::error::StoreError;
use crate::model::{CalendarException, ExceptionKind, ScheduledStopTime, ServiceCalendar, Trip};
use crate::selector::active_service_ids;
use crate::time::{GtfsTime, parse_service_date};

#[derive(Debug, Deserialize)]
struct TripRow {
    route_id: String,
    service_id: String,
    trip_id: String,
    #[serde(default)]
    trip_headsign: Option<String>,
    #[serde(default)]
    direction_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    #[serde(default)]
    arrival_time: Option<String>,
    #[serde(default)]
    departure_time: Option<String>,
    stop_id: String,
    stop_sequence: u32,
}

#[derive(Debug, Deserialize)]
struct CalendarRow {
    service_id: String,
    monday: u8,
    tuesday: u8,
    wednesday: u8,
    thursday: u8,
    friday: u8,
    saturday: u8,
    sunday: u8,
    start_date: String,
    end_date: String,
}

#[derive(Debug, Deserialize)]
struct CalendarDateRow {
    service_id: String,
    date: String,
    exception_type: u8,
}

/// In-memory timetable, loaded from a GTFS directory or built directly.
#[derive(Debug, Default)]
pub struct StaticTimetable {
    trips: Vec<Trip>,
    stop_times: HashMap<String, Vec<ScheduledStopTime>>,
    calendars: Vec<ServiceCalendar>,
    exceptions: Vec<CalendarException>,
}

impl StaticTimetable {
    pub fn new(
        trips: Vec<Trip>,
        stop_times: Vec<ScheduledStopTime>,
        calendars: Vec<ServiceCalendar>,
        exceptions: Vec<CalendarException>,
    ) -> Self {
        let mut by_trip: HashMap<String, Vec<ScheduledStopTime>> = HashMap::new();
        for st in stop_times {
            by_trip.entry(st.trip_id.clone()).or_default().push(st);
        }
        for list in by_trip.values_mut() {
            list.sort_by_key(|st| st.stop_sequence);
        }

        Self {
            trips,
            stop_times: by_trip,
            calendars,
            exceptions,
        }
    }

    /// Reads `trips.txt`, `stop_times.txt` and whichever of `calendar.txt` /
    /// `calendar_dates.txt` exist.
    #[tracing::instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();

        let trips = read_rows::<TripRow>(&dir.join("trips.txt"))?
            .into_iter()
            .map(|row| Trip {
                trip_id: row.trip_id,
                route_id: row.route_id,
                direction_id: row.direction_id,
                service_id: row.service_id,
                headsign: row.trip_headsign.filter(|h| !h.is_empty()),
                first_departure: None,
                manual: Default::default(),
            })
            .collect::<Vec<_>>();

        let mut stop_times = Vec::new();
        for row in read_rows::<StopTimeRow>(&dir.join("stop_times.txt"))? {
            let arrival = parse_optional_time(row.arrival_time.as_deref())?;
            let departure = parse_optional_time(row.departure_time.as_deref())?;
            let (arrival, departure) = match (arrival, departure) {
                (Some(a), Some(d)) => (a, d),
                (Some(a), None) => (a, a),
                (None, Some(d)) => (d, d),
                (None, None) => {
                    debug!(trip_id = %row.trip_id, stop_id = %row.stop_id, "Skipping untimed stop");
                    continue;
                }
            };
            stop_times.push(ScheduledStopTime {
                trip_id: row.trip_id,
                stop_id: row.stop_id,
                stop_sequence: row.stop_sequence,
                arrival,
                departure,
            });
        }

        let calendar_path = dir.join("calendar.txt");
        let calendars = if calendar_path.exists() {
            read_rows::<CalendarRow>(&calendar_path)?
                .into_iter()
                .map(|row| {
                    Ok(ServiceCalendar {
                        days: [
                            row.monday == 1,
                            row.tuesday == 1,
                            row.wednesday == 1,
                            row.thursday == 1,
                            row.friday == 1,
                            row.saturday == 1,
                            row.sunday == 1,
                        ],
                        start_date: parse_date(&row.start_date)?,
                        end_date: parse_date(&row.end_date)?,
                        service_id: row.service_id,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?
        } else {
            Vec::new()
        };

        let dates_path = dir.join("calendar_dates.txt");
        let mut exceptions = Vec::new();
        if dates_path.exists() {
            for row in read_rows::<CalendarDateRow>(&dates_path)? {
                let Some(kind) = ExceptionKind::from_gtfs(row.exception_type) else {
                    debug!(service_id = %row.service_id, code = row.exception_type, "Ignoring unknown exception type");
                    continue;
                };
                exceptions.push(CalendarException {
                    date: parse_date(&row.date)?,
                    service_id: row.service_id,
                    kind,
                });
            }
        }

        info!(
            trips = trips.len(),
            stop_times = stop_times.len(),
            calendars = calendars.len(),
            exceptions = exceptions.len(),
            "Timetable loaded"
        );

        Ok(Self::new(trips, stop_times, calendars, exceptions))
    }
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}

fn parse_optional_time(raw: Option<&str>) -> Result<Option<GtfsTime>, StoreError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| StoreError::InvalidTime(s.to_string())),
        None => Ok(None),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    parse_service_date(raw).ok_or_else(|| StoreError::InvalidDate(raw.to_string()))
}

#[async_trait]
impl TimetableStore for StaticTimetable {
    async fn valid_service_ids(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError> {
        Ok(active_service_ids(&self.calendars, &self.exceptions, date))
    }

    async fn trips_for_service_ids(
        &self,
        route_id: &str,
        direction_id: Option<u32>,
        service_ids: &HashSet<String>,
    ) -> Result<Vec<Trip>, StoreError> {
        Ok(self
            .trips
            .iter()
            .filter(|t| t.route_id == route_id)
            .filter(|t| direction_id.is_none() || t.direction_id == direction_id)
            .filter(|t| service_ids.contains(&t.service_id))
            .cloned()
            .collect())
    }

    async fn stop_times_for_trip(&self, trip_id: &str) -> Result<Vec<ScheduledStopTime>, StoreError> {
        Ok(self.stop_times.get(trip_id).cloned().unwrap_or_default())
    }

    async fn stop_times_for_trips(
        &self,
        trip_ids: &[String],
    ) -> Result<HashMap<String, Vec<ScheduledStopTime>>, StoreError> {
        Ok(trip_ids
            .iter()
            .filter_map(|id| self.stop_times.get(id).map(|st| (id.clone(), st.clone())))
            .collect())
    }

    async fn first_stop_times(
        &self,
        trip_ids: &[String],
    ) -> Result<HashMap<String, GtfsTime>, StoreError> {
        Ok(trip_ids
            .iter()
            .filter_map(|id| {
                let first = self.stop_times.get(id)?.first()?;
                Some((id.clone(), first.departure))
            })
            .collect())
    }
}
