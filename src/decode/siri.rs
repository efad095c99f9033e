//! SIRI StopMonitoring / VehicleMonitoring in XML and in the SIRI-Lite JSON
//! mirror. Both documents are walked through [`SiriNode`], so the
//! extraction rules exist once.

use chrono::DateTime;
use serde_json::Value;
use tracing::debug;

use super::{FeedTranscoder, StopUpdate, TripUpdates};
use crate::error::DecodeError;
use crate::model::VehiclePosition;
use crate::time::{parse_iso_duration, parse_service_date};

/// Trailing non-empty segment of a colon-delimited SIRI reference.
///
/// `STIF:StopPoint:Q:473921:` becomes `473921`.
pub fn short_ref(raw: &str) -> &str {
    let raw = raw.trim();
    raw.rsplit(':').find(|s| !s.is_empty()).unwrap_or(raw)
}

/// Read access shared by XML elements and JSON values.
trait SiriNode: Copy {
    fn child_named(self, name: &str) -> Option<Self>;
    /// Every descendant element called `name`.
    fn find_all(self, name: &str) -> Vec<Self>;
    fn text_value(self) -> Option<String>;

    fn path(self, names: &[&str]) -> Option<Self> {
        names.iter().try_fold(self, |node, name| node.child_named(name))
    }

    fn text_at(self, names: &[&str]) -> Option<String> {
        self.path(names)?.text_value()
    }
}

impl<'a, 'input> SiriNode for roxmltree::Node<'a, 'input> {
    fn child_named(self, name: &str) -> Option<Self> {
        self.children()
            .find(|n| n.is_element() && n.tag_name().name() == name)
    }

    fn find_all(self, name: &str) -> Vec<Self> {
        self.descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == name)
            .collect()
    }

    fn text_value(self) -> Option<String> {
        self.text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

impl<'a> SiriNode for &'a Value {
    fn child_named(self, name: &str) -> Option<Self> {
        match self.get(name)? {
            Value::Null => None,
            Value::Array(items) => items.first(),
            value => Some(value),
        }
    }

    fn find_all(self, name: &str) -> Vec<Self> {
        let mut found = Vec::new();
        collect_named(self, name, &mut found);
        found
    }

    /// Strings, numbers and booleans, or a `{ "value": ... }` wrapper.
    fn text_value(self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Object(map) => map.get("value")?.text_value(),
            Value::Array(items) => items.first()?.text_value(),
            Value::Null => None,
        }
    }
}

fn collect_named<'a>(value: &'a Value, name: &str, found: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == name {
                    match child {
                        Value::Array(items) => found.extend(items.iter()),
                        Value::Null => {}
                        other => found.push(other),
                    }
                } else {
                    collect_named(child, name, found);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_named(item, name, found);
            }
        }
        _ => {}
    }
}

fn epoch(raw: Option<String>) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw?.trim()).ok().map(|t| t.timestamp())
}

fn journey_ref<N: SiriNode>(journey: N) -> Option<String> {
    journey
        .text_at(&["FramedVehicleJourneyRef", "DatedVehicleJourneyRef"])
        .or_else(|| journey.text_at(&["DatedVehicleJourneyRef"]))
        .or_else(|| journey.text_at(&["VehicleJourneyRef"]))
        .map(|r| short_ref(&r).to_string())
}

fn on_line<N: SiriNode>(journey: N, line: Option<&str>) -> bool {
    match (line, journey.text_at(&["LineRef"])) {
        (Some(line), Some(line_ref)) => short_ref(&line_ref) == short_ref(line),
        _ => true,
    }
}

fn is_cancelled<N: SiriNode>(journey: N, call: N) -> bool {
    let flagged = journey
        .text_at(&["Cancellation"])
        .is_some_and(|c| c.eq_ignore_ascii_case("true"));
    let status_cancelled = ["ArrivalStatus", "DepartureStatus"].iter().any(|field| {
        call.text_at(&[*field])
            .is_some_and(|s| s.eq_ignore_ascii_case("cancelled"))
    });
    flagged || status_cancelled
}

/// `Expected − Aimed`, departure preferred.
fn expected_minus_aimed<N: SiriNode>(call: N) -> Option<i64> {
    let diff = |kind: &str| {
        let expected = format!("Expected{kind}Time");
        let aimed = format!("Aimed{kind}Time");
        let expected = epoch(call.text_at(&[expected.as_str()]))?;
        let aimed = epoch(call.text_at(&[aimed.as_str()]))?;
        Some(expected - aimed)
    };
    diff("Departure").or_else(|| diff("Arrival"))
}

enum Visit {
    Kept(StopUpdate),
    Dropped(&'static str),
}

fn monitored_stop_visit<N: SiriNode>(visit: N, line: Option<&str>) -> Visit {
    let Some(journey) = visit.child_named("MonitoredVehicleJourney") else {
        return Visit::Dropped("no journey");
    };
    if !on_line(journey, line) {
        return Visit::Dropped("other line");
    }
    let Some(call) = journey.child_named("MonitoredCall") else {
        return Visit::Dropped("no monitored call");
    };
    if is_cancelled(journey, call) {
        return Visit::Dropped("cancelled");
    }
    let Some(trip_id) = journey_ref(journey) else {
        return Visit::Dropped("no journey ref");
    };
    let Some(stop_id) = call
        .text_at(&["StopPointRef"])
        .or_else(|| visit.text_at(&["MonitoringRef"]))
    else {
        return Visit::Dropped("no stop ref");
    };

    let delay_seconds = call
        .text_at(&["Delay"])
        .or_else(|| journey.text_at(&["Delay"]))
        .and_then(|d| parse_iso_duration(&d))
        .or_else(|| expected_minus_aimed(call));

    Visit::Kept(StopUpdate {
        trip_id,
        stop_id: Some(short_ref(&stop_id).to_string()),
        stop_sequence: call.text_at(&["Order"]).and_then(|o| o.parse().ok()),
        skipped: false,
        delay_seconds,
        arrival_time: epoch(call.text_at(&["ExpectedArrivalTime"])),
        departure_time: epoch(call.text_at(&["ExpectedDepartureTime"])),
        service_date: journey
            .text_at(&["FramedVehicleJourneyRef", "DataFrameRef"])
            .and_then(|d| parse_service_date(&d)),
        lookup_schedule: false,
    })
}

fn collect_visits<N: SiriNode>(root: N, line: Option<&str>) -> TripUpdates {
    let mut out = TripUpdates {
        produced_at: root
            .find_all("ResponseTimestamp")
            .into_iter()
            .next()
            .and_then(|n| epoch(n.text_value()))
            .unwrap_or(0),
        ..Default::default()
    };

    for visit in root.find_all("MonitoredStopVisit") {
        match monitored_stop_visit(visit, line) {
            Visit::Kept(update) => {
                out.entities_kept += 1;
                out.updates.push(update);
            }
            Visit::Dropped(reason) => {
                debug!(reason, "Dropping stop visit");
                out.entities_dropped += 1;
            }
        }
    }

    out
}

fn vehicle_activity<N: SiriNode>(activity: N) -> Option<VehiclePosition> {
    let journey = activity.child_named("MonitoredVehicleJourney")?;
    let location = journey.child_named("VehicleLocation")?;
    let lat: f64 = location.text_at(&["Latitude"])?.parse().ok()?;
    let lon: f64 = location.text_at(&["Longitude"])?.parse().ok()?;

    let vehicle_id = journey
        .text_at(&["VehicleRef"])
        .or_else(|| activity.text_at(&["VehicleMonitoringRef"]))?;

    Some(VehiclePosition {
        vehicle_id: short_ref(&vehicle_id).to_string(),
        lat,
        lon,
        bearing: journey.text_at(&["Bearing"]).and_then(|b| b.parse().ok()),
        route_id: journey
            .text_at(&["LineRef"])
            .map(|l| short_ref(&l).to_string()),
        trip_id: journey_ref(journey),
        timestamp: epoch(activity.text_at(&["RecordedAtTime"])).unwrap_or(0),
        label: journey.text_at(&["VehicleName"]),
    })
}

fn collect_vehicles<N: SiriNode>(root: N) -> Vec<VehiclePosition> {
    root.find_all("VehicleActivity")
        .into_iter()
        .filter_map(vehicle_activity)
        .collect()
}

fn parse_json(document: &[u8]) -> Result<Value, DecodeError> {
    let value: Value = serde_json::from_slice(document)?;
    if !value.is_object() {
        return Err(DecodeError::Shape("SIRI JSON root is not an object".into()));
    }
    Ok(value)
}

pub struct SiriXmlTranscoder;

impl FeedTranscoder for SiriXmlTranscoder {
    fn trip_updates(&self, document: &[u8], line: Option<&str>) -> Result<TripUpdates, DecodeError> {
        let text = std::str::from_utf8(document)?;
        let doc = roxmltree::Document::parse(text)?;
        Ok(collect_visits(doc.root_element(), line))
    }

    fn vehicles(&self, document: &[u8]) -> Result<Vec<VehiclePosition>, DecodeError> {
        let text = std::str::from_utf8(document)?;
        let doc = roxmltree::Document::parse(text)?;
        Ok(collect_vehicles(doc.root_element()))
    }
}

pub struct SiriJsonTranscoder;

impl FeedTranscoder for SiriJsonTranscoder {
    fn trip_updates(&self, document: &[u8], line: Option<&str>) -> Result<TripUpdates, DecodeError> {
        let value = parse_json(document)?;
        Ok(collect_visits(&value, line))
    }

    fn vehicles(&self, document: &[u8]) -> Result<Vec<VehiclePosition>, DecodeError> {
        let value = parse_json(document)?;
        Ok(collect_vehicles(&value))
    }
}
