//! Matching live vehicle positions to the displayed trip.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::VehiclePosition;

/// Positions older than this are discarded.
pub const FRESHNESS_WINDOW_SECS: i64 = 120;

pub const PLACEHOLDER_LABEL: &str = "Vehicle";

/// `timestamp == 0` means the agency clock is unreliable; keep it.
pub fn is_fresh(position: &VehiclePosition, now: i64) -> bool {
    position.timestamp == 0
        || now
            .checked_sub(position.timestamp)
            .is_some_and(|age| age < FRESHNESS_WINDOW_SECS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Exact,
    CaseInsensitive,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleMatch {
    pub vehicle_id: String,
    pub label: String,
    pub lat: f64,
    pub lon: f64,
    pub bearing: Option<f32>,
    pub timestamp: i64,
    pub rule: MatchRule,
}

#[derive(Debug, Deserialize)]
struct FleetRow {
    network_id: String,
    vehicle_id: String,
    brand: String,
    model: String,
}

/// Fleet metadata keyed by `(network_id, vehicle_id)`.
#[derive(Debug, Default, Clone)]
pub struct FleetCatalog {
    labels: HashMap<(String, String), String>,
}

impl FleetCatalog {
    /// Reads a `network_id,vehicle_id,brand,model` CSV file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        let mut catalog = Self::default();
        for result in rdr.deserialize() {
            let row: FleetRow = result?;
            catalog.insert(&row.network_id, &row.vehicle_id, &row.brand, &row.model);
        }
        info!(vehicles = catalog.labels.len(), "Fleet catalog loaded");
        Ok(catalog)
    }

    pub fn insert(&mut self, network_id: &str, vehicle_id: &str, brand: &str, model: &str) {
        let label = format!("{brand} {model}").trim().to_string();
        self.labels
            .insert((network_id.to_string(), vehicle_id.to_string()), label);
    }

    pub fn label_for(&self, network_id: &str, vehicle_id: &str) -> Option<&str> {
        self.labels
            .get(&(network_id.to_string(), vehicle_id.to_string()))
            .map(String::as_str)
            .filter(|l| !l.is_empty())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub struct VehicleMatcher {
    network_id: String,
    catalog: FleetCatalog,
}

impl VehicleMatcher {
    pub fn new(network_id: impl Into<String>, catalog: FleetCatalog) -> Self {
        Self {
            network_id: network_id.into(),
            catalog,
        }
    }

    /// Finds the vehicle running `trip_id` among fresh positions.
    ///
    /// Rules are tried in order across the whole fleet, so an exact match
    /// anywhere beats a looser match earlier in the list.
    pub fn match_trip(
        &self,
        trip_id: &str,
        positions: &[VehiclePosition],
        now: i64,
    ) -> Option<VehicleMatch> {
        let fresh: Vec<&VehiclePosition> = positions.iter().filter(|p| is_fresh(p, now)).collect();
        debug!(
            total = positions.len(),
            fresh = fresh.len(),
            trip_id,
            "Matching vehicles"
        );

        let candidates = || {
            fresh
                .iter()
                .copied()
                .filter_map(|p| p.trip_id.as_deref().filter(|t| !t.is_empty()).map(|t| (p, t)))
        };

        let rules: [(MatchRule, &dyn Fn(&str) -> bool); 3] = [
            (MatchRule::Exact, &|t: &str| t == trip_id),
            (MatchRule::CaseInsensitive, &|t: &str| t.eq_ignore_ascii_case(trip_id)),
            (MatchRule::Substring, &|t: &str| {
                !trip_id.is_empty() && (t.contains(trip_id) || trip_id.contains(t))
            }),
        ];

        rules.iter().find_map(|(rule, matches)| {
            candidates()
                .find(|(_, t)| matches(*t))
                .map(|(p, _)| self.to_match(p, *rule))
        })
    }

    fn to_match(&self, position: &VehiclePosition, rule: MatchRule) -> VehicleMatch {
        let label = self
            .catalog
            .label_for(&self.network_id, &position.vehicle_id)
            .map(str::to_string)
            .or_else(|| position.label.clone().filter(|l| !l.is_empty()))
            .unwrap_or_else(|| PLACEHOLDER_LABEL.to_string());

        VehicleMatch {
            vehicle_id: position.vehicle_id.clone(),
            label,
            lat: position.lat,
            lon: position.lon,
            bearing: position.bearing,
            timestamp: position.timestamp,
            rule,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_710_000_000;

    fn position(vehicle_id: &str, trip_id: &str, timestamp: i64) -> VehiclePosition {
        VehiclePosition {
            vehicle_id: vehicle_id.into(),
            lat: 44.84,
            lon: -0.58,
            bearing: None,
            route_id: None,
            trip_id: Some(trip_id.into()),
            timestamp,
            label: None,
        }
    }

    fn matcher() -> VehicleMatcher {
        VehicleMatcher::new("net", FleetCatalog::default())
    }

    #[test]
    fn test_substring_rule_matches_suffixed_trip_id() {
        let found = matcher()
            .match_trip("A", &[position("V1", "12345_A", NOW)], NOW)
            .unwrap();
        assert_eq!(found.vehicle_id, "V1");
        assert_eq!(found.rule, MatchRule::Substring);
    }

    #[test]
    fn test_exact_match_anywhere_beats_earlier_loose_match() {
        let positions = vec![
            position("loose", "x_T1_y", NOW),
            position("caseless", "t1", NOW),
            position("exact", "T1", NOW),
        ];
        let found = matcher().match_trip("T1", &positions, NOW).unwrap();
        assert_eq!(found.vehicle_id, "exact");
        assert_eq!(found.rule, MatchRule::Exact);

        let found = matcher().match_trip("T1", &positions[..2], NOW).unwrap();
        assert_eq!(found.rule, MatchRule::CaseInsensitive);
    }

    #[test]
    fn test_freshness_window() {
        assert!(is_fresh(&position("V", "T", 0), NOW));
        assert!(is_fresh(&position("V", "T", NOW - 119), NOW));
        assert!(!is_fresh(&position("V", "T", NOW - 200), NOW));

        assert!(matcher().match_trip("T", &[position("V", "T", NOW - 200)], NOW).is_none());
        assert!(matcher().match_trip("T", &[position("V", "T", 0)], NOW).is_some());
    }

    #[test]
    fn test_extreme_timestamps_do_not_panic() {
        assert!(!is_fresh(&position("V", "T", i64::MIN), NOW));
        assert!(is_fresh(&position("V", "T", i64::MAX), NOW));
        assert!(!is_fresh(&position("V", "T", 1), i64::MIN));

        let positions = [position("V", "T", i64::MIN)];
        assert!(matcher().match_trip("T", &positions, NOW).is_none());
    }

    #[test]
    fn test_label_preference() {
        let mut catalog = FleetCatalog::default();
        catalog.insert("net", "V1", "Alstom", "Citadis 402");
        let matcher = VehicleMatcher::new("net", catalog);

        let catalogued = matcher.match_trip("T", &[position("V1", "T", NOW)], NOW).unwrap();
        assert_eq!(catalogued.label, "Alstom Citadis 402");

        let mut labelled = position("V2", "T", NOW);
        labelled.label = Some("Bus 42".into());
        assert_eq!(matcher.match_trip("T", &[labelled], NOW).unwrap().label, "Bus 42");

        let bare = matcher.match_trip("T", &[position("V3", "T", NOW)], NOW).unwrap();
        assert_eq!(bare.label, PLACEHOLDER_LABEL);
    }

    #[test]
    fn test_fleet_catalog_load_csv() {
        let path = std::env::temp_dir().join("gtfs_rt_reconciler_fleet.csv");
        std::fs::write(
            &path,
            "network_id,vehicle_id,brand,model\nnet,V1,Heuliez,GX 337\nother,V1,Iveco,Urbanway\n",
        )
        .unwrap();
        let catalog = FleetCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.label_for("net", "V1"), Some("Heuliez GX 337"));
        assert_eq!(catalog.label_for("net", "V9"), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_positions_without_trip_never_match() {
        let mut p = position("V", "", NOW);
        assert!(matcher().match_trip("T", &[p.clone()], NOW).is_none());
        p.trip_id = None;
        assert!(matcher().match_trip("T", &[p], NOW).is_none());
    }
}
