//! Feed decoding: wire format → canonical stop updates → [`FeedSnapshot`].
//!
//! Each wire format has a [`FeedTranscoder`] that only knows its own
//! document shape. Everything after that (schedule lookups for time-only
//! updates, service-date reconstruction, rounding, keying) is shared and
//! lives in [`FeedDecoder`].

pub mod envelope;
mod gtfs_rt;
mod siri;

pub use gtfs_rt::{GtfsRtJsonTranscoder, ProtobufTranscoder};
pub use siri::{SiriJsonTranscoder, SiriXmlTranscoder, short_ref};

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::error::{DataIntegrityError, DecodeError};
use crate::model::{ScheduledStopTime, VehiclePosition};
use crate::snapshot::{FeedSnapshot, StopEvent};
use crate::stats::DecodeStats;
use crate::store::TimetableStore;
use crate::time::{ServiceDay, disambiguate_service_date, round_minutes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedFamily {
    GtfsRt,
    Siri,
}

impl FeedFamily {
    /// Archive entry extensions accepted inside a zip envelope.
    pub fn archive_extensions(self) -> &'static [&'static str] {
        match self {
            FeedFamily::GtfsRt => &[".pb", ".protobuf", ".bin"],
            FeedFamily::Siri => &[".xml", ".json"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FeedFormat {
    GtfsRtProtobuf,
    GtfsRtJson,
    SiriXml,
    SiriJson,
}

impl FeedFormat {
    pub fn family(self) -> FeedFamily {
        match self {
            FeedFormat::GtfsRtProtobuf | FeedFormat::GtfsRtJson => FeedFamily::GtfsRt,
            FeedFormat::SiriXml | FeedFormat::SiriJson => FeedFamily::Siri,
        }
    }

    /// Narrows the format using an archive entry extension.
    pub fn refine(self, extension: &str) -> FeedFormat {
        match (self.family(), extension) {
            (FeedFamily::Siri, ".json") => FeedFormat::SiriJson,
            (FeedFamily::Siri, ".xml") => FeedFormat::SiriXml,
            (FeedFamily::GtfsRt, ".pb" | ".protobuf" | ".bin") => FeedFormat::GtfsRtProtobuf,
            _ => self,
        }
    }

    pub fn transcoder(self) -> &'static dyn FeedTranscoder {
        match self {
            FeedFormat::GtfsRtProtobuf => &ProtobufTranscoder,
            FeedFormat::GtfsRtJson => &GtfsRtJsonTranscoder,
            FeedFormat::SiriXml => &SiriXmlTranscoder,
            FeedFormat::SiriJson => &SiriJsonTranscoder,
        }
    }
}

/// One stop update in a family-neutral shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopUpdate {
    pub trip_id: String,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub skipped: bool,
    pub delay_seconds: Option<i64>,
    pub arrival_time: Option<i64>,
    pub departure_time: Option<i64>,
    pub service_date: Option<NaiveDate>,
    /// Whether a time-only update may be resolved against the timetable.
    pub lookup_schedule: bool,
}

impl StopUpdate {
    fn actual_time(&self) -> Option<i64> {
        self.departure_time.or(self.arrival_time)
    }

    fn has_data(&self) -> bool {
        self.skipped || self.delay_seconds.is_some() || self.actual_time().is_some()
    }

    fn needs_schedule(&self) -> bool {
        self.stop_id.is_none()
            || (self.lookup_schedule
                && !self.skipped
                && self.delay_seconds.is_none()
                && self.actual_time().is_some())
    }
}

/// Output of a transcoder for one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripUpdates {
    pub updates: Vec<StopUpdate>,
    pub entities_kept: usize,
    pub entities_dropped: usize,
    pub produced_at: i64,
}

/// Parses one wire format. Implementations hold no state.
pub trait FeedTranscoder: Send + Sync {
    /// Stop updates of entities on `line`, or of every entity when `None`.
    fn trip_updates(&self, document: &[u8], line: Option<&str>) -> Result<TripUpdates, DecodeError>;

    /// Vehicle positions with coordinates.
    fn vehicles(&self, document: &[u8]) -> Result<Vec<VehiclePosition>, DecodeError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub snapshot: FeedSnapshot,
    pub stats: DecodeStats,
}

#[derive(Debug, Clone, Copy)]
pub struct FeedDecoder {
    format: FeedFormat,
    tz: Tz,
}

impl FeedDecoder {
    pub fn new(format: FeedFormat, tz: Tz) -> Self {
        Self { format, tz }
    }

    pub fn format(&self) -> FeedFormat {
        self.format
    }

    /// One-shot decode: any failure yields an empty snapshot.
    pub async fn decode<S: TimetableStore + ?Sized>(
        &self,
        payload: &[u8],
        line: Option<&str>,
        store: &S,
    ) -> FeedSnapshot {
        match self.try_decode(payload, line, store).await {
            Ok(decoded) => decoded.snapshot,
            Err(e) => {
                warn!(error = %e, format = ?self.format, "Feed decode failed, using empty snapshot");
                FeedSnapshot::empty()
            }
        }
    }

    #[tracing::instrument(skip(self, payload, store), fields(format = ?self.format, bytes = payload.len()))]
    pub async fn try_decode<S: TimetableStore + ?Sized>(
        &self,
        payload: &[u8],
        line: Option<&str>,
        store: &S,
    ) -> Result<Decoded, DecodeError> {
        let (document, format) = envelope::open(payload, self.format)?;
        let parsed = format.transcoder().trip_updates(&document, line)?;

        let mut stats = DecodeStats {
            entities_kept: parsed.entities_kept,
            entities_dropped: parsed.entities_dropped,
            ..Default::default()
        };

        let lookup_ids: Vec<String> = parsed
            .updates
            .iter()
            .filter(|u| u.has_data() && u.needs_schedule())
            .map(|u| u.trip_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let schedule = if lookup_ids.is_empty() {
            Some(HashMap::new())
        } else {
            match store.stop_times_for_trips(&lookup_ids).await {
                Ok(schedule) => Some(schedule),
                Err(e) => {
                    warn!(error = %e, trips = lookup_ids.len(), "Timetable lookup failed, dropping time-only updates");
                    None
                }
            }
        };

        let mut snapshot = FeedSnapshot::new(parsed.produced_at);
        for update in parsed.updates {
            if !update.has_data() {
                stats.updates_without_data += 1;
                continue;
            }
            let settled = match (&schedule, update.needs_schedule()) {
                (None, true) => {
                    stats.updates_dropped += 1;
                    continue;
                }
                (Some(schedule), _) => self.settle(&update, schedule),
                (None, false) => self.settle(&update, &HashMap::new()),
            };
            match settled {
                Ok(settled) => {
                    if settled.event.skipped {
                        stats.updates_skipped += 1;
                    } else if settled.from_schedule {
                        stats.updates_from_schedule += 1;
                    } else if settled.event.delay_minutes.is_some() {
                        stats.updates_with_delay += 1;
                    }
                    snapshot.record(
                        &update.trip_id,
                        &settled.stop_id,
                        settled.stop_sequence,
                        settled.event,
                    );
                }
                Err(e) => {
                    debug!(error = %e, "Dropping stop update");
                    stats.updates_dropped += 1;
                }
            }
        }

        debug!(
            keys = snapshot.len(),
            kept = stats.entities_kept,
            dropped_entities = stats.entities_dropped,
            dropped_updates = stats.updates_dropped,
            "Feed decoded"
        );

        Ok(Decoded { snapshot, stats })
    }

    /// Turns one canonical update into a keyed event.
    fn settle(
        &self,
        update: &StopUpdate,
        schedule: &HashMap<String, Vec<ScheduledStopTime>>,
    ) -> Result<Settled, DataIntegrityError> {
        let scheduled = if update.needs_schedule() {
            Some(find_scheduled(update, schedule)?)
        } else {
            None
        };

        let stop_id = match (&update.stop_id, scheduled) {
            (Some(stop_id), _) => stop_id.clone(),
            (None, Some(st)) => st.stop_id.clone(),
            (None, None) => {
                return Err(DataIntegrityError::UnknownStop {
                    trip: update.trip_id.clone(),
                    stop: None,
                    sequence: update.stop_sequence,
                });
            }
        };

        if update.skipped {
            return Ok(Settled {
                stop_id,
                stop_sequence: update.stop_sequence,
                event: StopEvent::skipped(),
                from_schedule: false,
            });
        }

        let mut from_schedule = false;
        let delay_minutes = match update.delay_seconds {
            Some(seconds) => Some(round_minutes(seconds)),
            None => match (scheduled, update.lookup_schedule) {
                (Some(st), true) => {
                    from_schedule = true;
                    self.delay_from_schedule(update, st)?
                }
                _ => None,
            },
        };

        Ok(Settled {
            stop_id,
            stop_sequence: update.stop_sequence.or(scheduled.map(|st| st.stop_sequence)),
            event: StopEvent {
                delay_minutes,
                actual_arrival: update.arrival_time,
                actual_departure: update.departure_time,
                skipped: false,
            },
            from_schedule,
        })
    }

    /// `actual − scheduled` for a time-only update, in rounded minutes.
    ///
    /// A reported time too far from the schedule to subtract is an integrity
    /// error, not a delay.
    fn delay_from_schedule(
        &self,
        update: &StopUpdate,
        scheduled: &ScheduledStopTime,
    ) -> Result<Option<i32>, DataIntegrityError> {
        let (actual, time) = match (update.departure_time, update.arrival_time) {
            (Some(departure), _) => (departure, scheduled.departure),
            (None, Some(arrival)) => (arrival, scheduled.arrival),
            (None, None) => return Ok(None),
        };
        let out_of_range = || DataIntegrityError::TimeOutOfRange {
            trip: update.trip_id.clone(),
            epoch: actual,
        };

        let scheduled_epoch = match update.service_date {
            Some(date) => ServiceDay::new(date, self.tz).epoch_of(time),
            None => disambiguate_service_date(actual, time, self.tz).map(|(_, epoch)| epoch),
        }
        .ok_or_else(out_of_range)?;

        let seconds = actual.checked_sub(scheduled_epoch).ok_or_else(out_of_range)?;
        Ok(Some(round_minutes(seconds)))
    }

    #[tracing::instrument(skip(self, payload), fields(format = ?self.format, bytes = payload.len()))]
    pub fn try_decode_vehicles(&self, payload: &[u8]) -> Result<Vec<VehiclePosition>, DecodeError> {
        let (document, format) = envelope::open(payload, self.format)?;
        let positions = format.transcoder().vehicles(&document)?;
        debug!(positions = positions.len(), "Vehicles decoded");
        Ok(positions)
    }
}

struct Settled {
    stop_id: String,
    stop_sequence: Option<u32>,
    event: StopEvent,
    from_schedule: bool,
}

fn find_scheduled<'a>(
    update: &StopUpdate,
    schedule: &'a HashMap<String, Vec<ScheduledStopTime>>,
) -> Result<&'a ScheduledStopTime, DataIntegrityError> {
    let stops = schedule
        .get(&update.trip_id)
        .ok_or_else(|| DataIntegrityError::UnknownTrip(update.trip_id.clone()))?;

    stops
        .iter()
        .find(|st| {
            let sequence_ok = update.stop_sequence.is_none_or(|seq| seq == st.stop_sequence);
            let stop_ok = update.stop_id.as_deref().is_none_or(|id| id == st.stop_id);
            sequence_ok && stop_ok && (update.stop_sequence.is_some() || update.stop_id.is_some())
        })
        .ok_or_else(|| DataIntegrityError::UnknownStop {
            trip: update.trip_id.clone(),
            stop: update.stop_id.clone(),
            sequence: update.stop_sequence,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{
        FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate,
        trip_update::{StopTimeEvent, StopTimeUpdate, stop_time_update::ScheduleRelationship},
    };
    use crate::snapshot::StopEventKey;
    use crate::store::StaticTimetable;
    use crate::time::GtfsTime;
    use prost::Message;

    fn stop_time_update(seq: u32, stop: &str) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: Some(seq),
            stop_id: Some(stop.to_string()),
            ..Default::default()
        }
    }

    fn feed(entities: Vec<FeedEntity>) -> Vec<u8> {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(1_710_064_800),
                incrementality: None,
                feed_version: None,
            },
            entity: entities,
        }
        .encode_to_vec()
    }

    fn entity(trip_id: &str, route_id: Option<&str>, updates: Vec<StopTimeUpdate>) -> FeedEntity {
        FeedEntity {
            id: format!("e-{trip_id}"),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    route_id: route_id.map(str::to_string),
                    ..Default::default()
                },
                stop_time_update: updates,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn timetable() -> StaticTimetable {
        let stop = |seq: u32, stop: &str, t: GtfsTime| ScheduledStopTime {
            trip_id: "T1".into(),
            stop_id: stop.into(),
            stop_sequence: seq,
            arrival: t,
            departure: t,
        };
        StaticTimetable::new(
            vec![],
            vec![
                stop(1, "A", GtfsTime::from_hms(8, 0, 0)),
                stop(2, "B", GtfsTime::from_hms(24, 5, 0)),
            ],
            vec![],
            vec![],
        )
    }

    fn decoder() -> FeedDecoder {
        FeedDecoder::new(FeedFormat::GtfsRtProtobuf, chrono_tz::UTC)
    }

    #[tokio::test]
    async fn test_skipped_update_marks_both_keys_without_delay() {
        let mut update = stop_time_update(2, "B");
        update.schedule_relationship = Some(ScheduleRelationship::Skipped as i32);
        update.departure = Some(StopTimeEvent {
            delay: Some(300),
            ..Default::default()
        });
        let payload = feed(vec![entity("T1", None, vec![update])]);

        let decoded = decoder().try_decode(&payload, None, &timetable()).await.unwrap();
        let snapshot = decoded.snapshot;
        for key in [StopEventKey::basic("T1", "B"), StopEventKey::sequenced("T1", "B", 2)] {
            let event = snapshot.get(&key).unwrap();
            assert!(event.skipped);
            assert_eq!(event.delay_minutes, None);
            assert_eq!(event.actual_time(), None);
        }
        assert_eq!(decoded.stats.updates_skipped, 1);
    }

    #[tokio::test]
    async fn test_explicit_delay_prefers_departure_and_rounds() {
        let mut update = stop_time_update(1, "A");
        update.arrival = Some(StopTimeEvent {
            delay: Some(600),
            ..Default::default()
        });
        update.departure = Some(StopTimeEvent {
            delay: Some(150),
            ..Default::default()
        });
        let payload = feed(vec![entity("T1", Some("R1"), vec![update])]);

        let snapshot = decoder().decode(&payload, Some("R1"), &timetable()).await;
        assert_eq!(snapshot.lookup("T1", "A", 1).unwrap().delay_minutes, Some(3));
    }

    #[tokio::test]
    async fn test_time_only_update_resolves_against_schedule_across_midnight() {
        // B is scheduled 24:05 on 2024-03-10, observed 00:08 on 2024-03-11.
        let actual = ServiceDay::new(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(), chrono_tz::UTC)
            .epoch_of(GtfsTime::from_hms(24, 8, 0))
            .unwrap();
        let mut update = stop_time_update(2, "B");
        update.arrival = Some(StopTimeEvent {
            time: Some(actual),
            ..Default::default()
        });
        let payload = feed(vec![entity("T1", None, vec![update])]);

        let decoded = decoder().try_decode(&payload, None, &timetable()).await.unwrap();
        let event = decoded.snapshot.lookup("T1", "B", 2).unwrap();
        assert_eq!(event.delay_minutes, Some(3));
        assert_eq!(event.actual_arrival, Some(actual));
        assert_eq!(decoded.stats.updates_from_schedule, 1);
    }

    #[tokio::test]
    async fn test_start_date_pins_service_day() {
        let day = ServiceDay::new(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(), chrono_tz::UTC);
        let actual = day.epoch_of(GtfsTime::from_hms(8, 2, 0)).unwrap();
        let mut update = stop_time_update(1, "A");
        update.departure = Some(StopTimeEvent {
            time: Some(actual),
            ..Default::default()
        });
        let mut e = entity("T1", None, vec![update]);
        if let Some(tu) = e.trip_update.as_mut() {
            tu.trip.start_date = Some("20240310".to_string());
        }

        let snapshot = decoder().decode(&feed(vec![e]), None, &timetable()).await;
        assert_eq!(snapshot.lookup("T1", "A", 1).unwrap().delay_minutes, Some(2));
    }

    #[tokio::test]
    async fn test_unrepresentable_time_drops_update_without_panicking() {
        let mut extreme = stop_time_update(1, "A");
        extreme.departure = Some(StopTimeEvent {
            time: Some(i64::MIN),
            ..Default::default()
        });
        let mut pinned = entity("T1", None, vec![extreme.clone()]);
        if let Some(tu) = pinned.trip_update.as_mut() {
            tu.trip.start_date = Some("20240310".to_string());
        }
        let mut unpinned = entity("T1", None, vec![extreme]);
        unpinned.id = "e-T1-unpinned".to_string();

        for e in [pinned, unpinned] {
            let decoded = decoder()
                .try_decode(&feed(vec![e]), None, &timetable())
                .await
                .unwrap();
            assert!(decoded.snapshot.is_empty());
            assert_eq!(decoded.stats.updates_dropped, 1);
        }
    }

    #[tokio::test]
    async fn test_missing_stop_id_filled_from_sequence() {
        let update = StopTimeUpdate {
            stop_sequence: Some(1),
            departure: Some(StopTimeEvent {
                delay: Some(60),
                ..Default::default()
            }),
            ..Default::default()
        };
        let payload = feed(vec![entity("T1", None, vec![update])]);
        let snapshot = decoder().decode(&payload, None, &timetable()).await;
        assert_eq!(snapshot.lookup("T1", "A", 1).unwrap().delay_minutes, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_stop_drops_only_that_update() {
        let mut unknown = stop_time_update(9, "Z");
        unknown.arrival = Some(StopTimeEvent {
            time: Some(1_710_064_800),
            ..Default::default()
        });
        let mut known = stop_time_update(1, "A");
        known.arrival = Some(StopTimeEvent {
            delay: Some(0),
            ..Default::default()
        });
        let mut unknown_trip = stop_time_update(1, "A");
        unknown_trip.arrival = Some(StopTimeEvent {
            time: Some(1_710_064_800),
            ..Default::default()
        });
        let payload = feed(vec![
            entity("T1", None, vec![unknown, known]),
            entity("GHOST", None, vec![unknown_trip]),
        ]);

        let decoded = decoder().try_decode(&payload, None, &timetable()).await.unwrap();
        assert_eq!(decoded.stats.updates_dropped, 2);
        assert_eq!(decoded.snapshot.len(), 2);
        assert_eq!(decoded.snapshot.lookup("T1", "A", 1).unwrap().delay_minutes, Some(0));
    }

    #[tokio::test]
    async fn test_line_filter_drops_other_routes_but_keeps_unrouted() {
        let delayed = |seq, stop| {
            let mut u = stop_time_update(seq, stop);
            u.arrival = Some(StopTimeEvent {
                delay: Some(60),
                ..Default::default()
            });
            u
        };
        let payload = feed(vec![
            entity("T1", Some("R1"), vec![delayed(1, "A")]),
            entity("T2", Some("R2"), vec![delayed(1, "A")]),
            entity("T3", None, vec![delayed(1, "A")]),
        ]);

        let decoded = decoder().try_decode(&payload, Some("R1"), &timetable()).await.unwrap();
        assert!(decoded.snapshot.lookup("T1", "A", 1).is_some());
        assert!(decoded.snapshot.lookup("T2", "A", 1).is_none());
        assert!(decoded.snapshot.lookup("T3", "A", 1).is_some());
        assert_eq!(decoded.stats.entities_dropped, 1);
    }

    #[tokio::test]
    async fn test_zip_wrapped_payload_decodes_identically() {
        let mut update = stop_time_update(1, "A");
        update.arrival = Some(StopTimeEvent {
            delay: Some(240),
            ..Default::default()
        });
        let payload = feed(vec![entity("T1", None, vec![update])]);
        let zipped = envelope::tests::zip_with(&[("notes.txt", b"x"), ("trip_updates.pb", &payload)]);

        let plain = decoder().decode(&payload, None, &timetable()).await;
        let wrapped = decoder().decode(&zipped, None, &timetable()).await;
        assert!(!plain.is_empty());
        assert_eq!(plain, wrapped);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_empty_snapshot_or_error() {
        let garbage = [0xFF, 0xFE, 0x00, 0x01];
        assert!(decoder().decode(&garbage, None, &timetable()).await.is_empty());
        assert!(decoder().try_decode(&garbage, None, &timetable()).await.is_err());
    }

    #[test]
    fn test_refine_by_extension() {
        assert_eq!(FeedFormat::SiriXml.refine(".json"), FeedFormat::SiriJson);
        assert_eq!(FeedFormat::GtfsRtJson.refine(".pb"), FeedFormat::GtfsRtProtobuf);
        assert_eq!(FeedFormat::GtfsRtJson.refine(".xml"), FeedFormat::GtfsRtJson);
    }
}
