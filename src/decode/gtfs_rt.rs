//! GTFS Realtime transcoders: protobuf and the `{data:{trips,vehicles}}`
//! JSON mirror. The mirror is first mapped onto the protobuf types so both
//! share one extraction path.

use prost::Message;
use serde::Deserialize;
use tracing::debug;

use super::{FeedTranscoder, StopUpdate, TripUpdates};
use crate::error::DecodeError;
use crate::gtfs_rt::{
    FeedEntity, FeedHeader, FeedMessage, Position, TripDescriptor, TripUpdate, VehicleDescriptor,
    trip_update::{StopTimeEvent, StopTimeUpdate, stop_time_update::ScheduleRelationship},
};
use crate::model::VehiclePosition;
use crate::time::parse_service_date;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, DecodeError> {
    Ok(FeedMessage::decode(bytes)?)
}

pub struct ProtobufTranscoder;

impl FeedTranscoder for ProtobufTranscoder {
    fn trip_updates(&self, document: &[u8], line: Option<&str>) -> Result<TripUpdates, DecodeError> {
        Ok(collect_trip_updates(&parse_feed(document)?, line))
    }

    fn vehicles(&self, document: &[u8]) -> Result<Vec<VehiclePosition>, DecodeError> {
        Ok(collect_vehicles(&parse_feed(document)?))
    }
}

pub struct GtfsRtJsonTranscoder;

impl FeedTranscoder for GtfsRtJsonTranscoder {
    fn trip_updates(&self, document: &[u8], line: Option<&str>) -> Result<TripUpdates, DecodeError> {
        Ok(collect_trip_updates(&parse_json_mirror(document)?, line))
    }

    fn vehicles(&self, document: &[u8]) -> Result<Vec<VehiclePosition>, DecodeError> {
        Ok(collect_vehicles(&parse_json_mirror(document)?))
    }
}

fn collect_trip_updates(feed: &FeedMessage, line: Option<&str>) -> TripUpdates {
    let mut out = TripUpdates {
        produced_at: feed.header.timestamp.map(|t| t as i64).unwrap_or(0),
        ..Default::default()
    };

    for entity in &feed.entity {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        if entity.is_deleted() {
            out.entities_dropped += 1;
            continue;
        }

        let trip = &trip_update.trip;
        // Feeds interleave lines; drop the whole entity. Unrouted entities
        // pass every line filter.
        if let (Some(line), Some(route_id)) = (line, trip.route_id.as_deref()) {
            if route_id != line {
                out.entities_dropped += 1;
                continue;
            }
        }

        let Some(trip_id) = trip.trip_id.as_deref().filter(|id| !id.is_empty()) else {
            debug!(entity_id = %entity.id, "Trip update without trip_id");
            out.entities_dropped += 1;
            continue;
        };

        out.entities_kept += 1;
        let service_date = trip.start_date.as_deref().and_then(parse_service_date);

        for stu in &trip_update.stop_time_update {
            out.updates.push(stop_update(trip_id, service_date, stu));
        }
    }

    out
}

fn stop_update(
    trip_id: &str,
    service_date: Option<chrono::NaiveDate>,
    stu: &StopTimeUpdate,
) -> StopUpdate {
    let mut update = StopUpdate {
        trip_id: trip_id.to_string(),
        stop_id: stu.stop_id.clone().filter(|id| !id.is_empty()),
        stop_sequence: stu.stop_sequence,
        service_date,
        lookup_schedule: true,
        ..Default::default()
    };

    match stu.schedule_relationship() {
        ScheduleRelationship::Skipped => update.skipped = true,
        ScheduleRelationship::NoData => {}
        ScheduleRelationship::Scheduled | ScheduleRelationship::Unscheduled => {
            let arrival = stu.arrival.as_ref();
            let departure = stu.departure.as_ref();
            update.delay_seconds = departure
                .and_then(|e| e.delay)
                .or_else(|| arrival.and_then(|e| e.delay))
                .map(i64::from);
            update.arrival_time = arrival.and_then(|e| e.time);
            update.departure_time = departure.and_then(|e| e.time);
        }
    }

    update
}

fn collect_vehicles(feed: &FeedMessage) -> Vec<VehiclePosition> {
    feed.entity.iter().filter_map(vehicle_position).collect()
}

fn vehicle_position(entity: &FeedEntity) -> Option<VehiclePosition> {
    let vehicle = entity.vehicle.as_ref()?;
    let Some(position) = vehicle.position.as_ref().filter(|p| has_fix(p)) else {
        debug!(entity_id = %entity.id, "Vehicle without coordinates");
        return None;
    };
    let descriptor = vehicle.vehicle.as_ref();

    Some(VehiclePosition {
        vehicle_id: descriptor
            .and_then(|d| d.id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| entity.id.clone()),
        lat: position.latitude as f64,
        lon: position.longitude as f64,
        bearing: position.bearing,
        route_id: vehicle.trip.as_ref().and_then(|t| t.route_id.clone()),
        trip_id: vehicle.trip.as_ref().and_then(|t| t.trip_id.clone()),
        timestamp: vehicle
            .timestamp
            .and_then(|t| i64::try_from(t).ok())
            .unwrap_or(0),
        label: descriptor.and_then(|d| d.label.clone()),
    })
}

/// `0,0` is what most encoders emit when no GPS fix exists.
fn has_fix(position: &Position) -> bool {
    position.latitude.is_finite()
        && position.longitude.is_finite()
        && !(position.latitude == 0.0 && position.longitude == 0.0)
}

// JSON mirror. Keys may be snake_case or camelCase; 64-bit integers may be
// quoted, as in the protobuf JSON mapping.

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Lenient {
    Number(i64),
    Text(String),
}

impl Lenient {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Lenient::Number(n) => Some(*n),
            Lenient::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonFeed {
    #[serde(default)]
    header: Option<JsonHeader>,
    data: JsonData,
}

#[derive(Debug, Deserialize)]
struct JsonHeader {
    timestamp: Option<Lenient>,
}

#[derive(Debug, Default, Deserialize)]
struct JsonData {
    #[serde(default)]
    trips: Vec<JsonTripUpdate>,
    #[serde(default)]
    vehicles: Vec<JsonVehicle>,
}

#[derive(Debug, Deserialize)]
struct JsonTripUpdate {
    id: Option<String>,
    trip: JsonTrip,
    #[serde(default, alias = "stopTimeUpdate", alias = "stopTimeUpdates")]
    stop_time_update: Vec<JsonStopTimeUpdate>,
}

#[derive(Debug, Default, Deserialize)]
struct JsonTrip {
    #[serde(alias = "tripId")]
    trip_id: Option<String>,
    #[serde(alias = "routeId")]
    route_id: Option<String>,
    #[serde(alias = "directionId")]
    direction_id: Option<u32>,
    #[serde(alias = "startTime")]
    start_time: Option<String>,
    #[serde(alias = "startDate")]
    start_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonStopTimeUpdate {
    #[serde(alias = "stopSequence")]
    stop_sequence: Option<u32>,
    #[serde(alias = "stopId")]
    stop_id: Option<String>,
    arrival: Option<JsonStopTimeEvent>,
    departure: Option<JsonStopTimeEvent>,
    #[serde(alias = "scheduleRelationship")]
    schedule_relationship: Option<Lenient>,
}

#[derive(Debug, Deserialize)]
struct JsonStopTimeEvent {
    delay: Option<i32>,
    time: Option<Lenient>,
}

#[derive(Debug, Deserialize)]
struct JsonVehicle {
    id: Option<String>,
    vehicle: Option<JsonVehicleDescriptor>,
    trip: Option<JsonTrip>,
    position: Option<JsonPosition>,
    timestamp: Option<Lenient>,
}

#[derive(Debug, Deserialize)]
struct JsonVehicleDescriptor {
    id: Option<String>,
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonPosition {
    #[serde(alias = "lat")]
    latitude: f32,
    #[serde(alias = "lon", alias = "lng")]
    longitude: f32,
    bearing: Option<f32>,
}

impl From<JsonTrip> for TripDescriptor {
    fn from(trip: JsonTrip) -> Self {
        TripDescriptor {
            trip_id: trip.trip_id,
            route_id: trip.route_id,
            direction_id: trip.direction_id,
            start_time: trip.start_time,
            start_date: trip.start_date,
            schedule_relationship: None,
        }
    }
}

impl From<JsonStopTimeEvent> for StopTimeEvent {
    fn from(event: JsonStopTimeEvent) -> Self {
        StopTimeEvent {
            delay: event.delay,
            time: event.time.as_ref().and_then(Lenient::as_i64),
            uncertainty: None,
        }
    }
}

fn relationship_code(raw: &Lenient) -> Option<i32> {
    match raw {
        Lenient::Number(n) => i32::try_from(*n).ok(),
        Lenient::Text(name) => ScheduleRelationship::from_str_name(&name.trim().to_ascii_uppercase())
            .map(|r| r as i32)
            .or_else(|| name.trim().parse().ok()),
    }
}

fn parse_json_mirror(document: &[u8]) -> Result<FeedMessage, DecodeError> {
    let feed: JsonFeed = serde_json::from_slice(document)?;

    let header = FeedHeader {
        gtfs_realtime_version: "2.0".to_string(),
        timestamp: feed
            .header
            .and_then(|h| h.timestamp)
            .and_then(|t| t.as_i64())
            .and_then(|t| u64::try_from(t).ok()),
        ..Default::default()
    };

    let mut entity = Vec::with_capacity(feed.data.trips.len() + feed.data.vehicles.len());

    for (i, trip) in feed.data.trips.into_iter().enumerate() {
        let id = trip.id.unwrap_or_else(|| format!("trip-{i}"));
        entity.push(FeedEntity {
            id,
            trip_update: Some(TripUpdate {
                trip: trip.trip.into(),
                stop_time_update: trip
                    .stop_time_update
                    .into_iter()
                    .map(|stu| StopTimeUpdate {
                        stop_sequence: stu.stop_sequence,
                        stop_id: stu.stop_id,
                        schedule_relationship: stu.schedule_relationship.as_ref().and_then(relationship_code),
                        arrival: stu.arrival.map(Into::into),
                        departure: stu.departure.map(Into::into),
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    for (i, v) in feed.data.vehicles.into_iter().enumerate() {
        let id = v.id.clone().unwrap_or_else(|| format!("vehicle-{i}"));
        entity.push(FeedEntity {
            id,
            vehicle: Some(crate::gtfs_rt::VehiclePosition {
                trip: v.trip.map(Into::into),
                vehicle: v.vehicle.map(|d| VehicleDescriptor {
                    id: d.id,
                    label: d.label,
                    license_plate: None,
                }),
                position: v.position.map(|p| Position {
                    latitude: p.latitude,
                    longitude: p.longitude,
                    bearing: p.bearing,
                    ..Default::default()
                }),
                timestamp: v
                    .timestamp
                    .as_ref()
                    .and_then(Lenient::as_i64)
                    .and_then(|t| u64::try_from(t).ok()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    Ok(FeedMessage { header, entity })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_bytes_returns_default_feed() {
        // An empty byte array is a valid, empty FeedMessage.
        let feed = parse_feed(&[]).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "");
        assert!(feed.entity.is_empty());
    }

    #[test]
    fn test_parse_invalid_bytes() {
        let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
        assert!(matches!(parse_feed(&invalid_bytes), Err(DecodeError::Protobuf(_))));
    }

    #[test]
    fn test_protobuf_vehicle_defaults() {
        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                ..Default::default()
            },
            entity: vec![
                FeedEntity {
                    id: "entity-7".to_string(),
                    vehicle: Some(crate::gtfs_rt::VehiclePosition {
                        trip: Some(TripDescriptor {
                            trip_id: Some("T1".to_string()),
                            ..Default::default()
                        }),
                        position: Some(Position {
                            latitude: 44.84,
                            longitude: -0.58,
                            bearing: Some(90.0),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                FeedEntity {
                    id: "no-fix".to_string(),
                    vehicle: Some(crate::gtfs_rt::VehiclePosition::default()),
                    ..Default::default()
                },
            ],
        };

        let positions = ProtobufTranscoder.vehicles(&feed.encode_to_vec()).unwrap();
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.vehicle_id, "entity-7");
        assert_eq!(p.timestamp, 0);
        assert_eq!(p.trip_id.as_deref(), Some("T1"));
        assert_eq!(p.bearing, Some(90.0));
    }

    #[test]
    fn test_protobuf_vehicle_timestamp_beyond_i64_is_unknown() {
        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                ..Default::default()
            },
            entity: vec![FeedEntity {
                id: "v".to_string(),
                vehicle: Some(crate::gtfs_rt::VehiclePosition {
                    timestamp: Some(1 << 63),
                    position: Some(Position {
                        latitude: 44.84,
                        longitude: -0.58,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        };

        let positions = ProtobufTranscoder.vehicles(&feed.encode_to_vec()).unwrap();
        assert_eq!(positions[0].timestamp, 0);
    }

    #[test]
    fn test_json_mirror_trip_updates_accept_camel_case_and_quoted_times() {
        let doc = br#"{
            "header": {"timestamp": "1710064800"},
            "data": {
                "trips": [
                    {
                        "trip": {"tripId": "T1", "routeId": "R1", "startDate": "20240310"},
                        "stopTimeUpdate": [
                            {"stopSequence": 1, "stopId": "A", "departure": {"delay": 120}},
                            {"stopSequence": 2, "stopId": "B", "arrival": {"time": "1710065100"}},
                            {"stopSequence": 3, "stopId": "C", "scheduleRelationship": "SKIPPED"}
                        ]
                    },
                    {
                        "trip": {"trip_id": "T2", "route_id": "R2"},
                        "stop_time_update": [{"stop_sequence": 1, "stop_id": "A", "arrival": {"delay": 60}}]
                    }
                ]
            }
        }"#;

        let parsed = GtfsRtJsonTranscoder.trip_updates(doc, Some("R1")).unwrap();
        assert_eq!(parsed.produced_at, 1_710_064_800);
        assert_eq!(parsed.entities_kept, 1);
        assert_eq!(parsed.entities_dropped, 1);
        assert_eq!(parsed.updates.len(), 3);

        assert_eq!(parsed.updates[0].delay_seconds, Some(120));
        assert_eq!(parsed.updates[1].arrival_time, Some(1_710_065_100));
        assert_eq!(
            parsed.updates[1].service_date,
            chrono::NaiveDate::from_ymd_opt(2024, 3, 10)
        );
        assert!(parsed.updates[2].skipped);
    }

    #[test]
    fn test_json_mirror_vehicles() {
        let doc = br#"{"data": {"vehicles": [
            {"vehicle": {"id": "V1", "label": "Tram 12"}, "trip": {"tripId": "T1"},
             "position": {"lat": 44.8, "lon": -0.5}, "timestamp": 1710064800},
            {"vehicle": {"id": "V2"}, "trip": {"tripId": "T2"}}
        ]}}"#;
        let positions = GtfsRtJsonTranscoder.vehicles(doc).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].vehicle_id, "V1");
        assert_eq!(positions[0].label.as_deref(), Some("Tram 12"));
        assert_eq!(positions[0].timestamp, 1_710_064_800);
    }

    #[test]
    fn test_json_mirror_without_data_is_error() {
        assert!(matches!(
            GtfsRtJsonTranscoder.trip_updates(br#"{"entity": []}"#, None),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_no_data_relationship_carries_nothing() {
        let stu = StopTimeUpdate {
            stop_sequence: Some(1),
            stop_id: Some("A".to_string()),
            schedule_relationship: Some(ScheduleRelationship::NoData as i32),
            arrival: Some(StopTimeEvent {
                delay: Some(60),
                ..Default::default()
            }),
            ..Default::default()
        };
        let update = stop_update("T1", None, &stu);
        assert_eq!(update.delay_seconds, None);
        assert!(!update.skipped);
    }
}
