use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::OverrideStore;
use crate::error::StoreError;
use crate::model::{CancelledTrip, DelayedTrip};

#[derive(Debug, Default, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    cancelled: Vec<CancelledRecord>,
    #[serde(default)]
    delayed: Vec<DelayedRecord>,
}

#[derive(Debug, Deserialize)]
struct CancelledRecord {
    network_id: String,
    #[serde(flatten)]
    trip: CancelledTrip,
}

#[derive(Debug, Deserialize)]
struct DelayedRecord {
    network_id: String,
    #[serde(flatten)]
    trip: DelayedTrip,
}

/// Dispatcher tables kept in a JSON file, re-read on every call so edits
/// show up on the next poll.
///
/// ```json
/// {
///   "cancelled": [{ "network_id": "bdx", "trip_id": "T1", "date": "2024-03-10", "reason": "strike" }],
///   "delayed":   [{ "network_id": "bdx", "trip_id": "T2", "date": "2024-03-10", "delay_minutes": 12, "reason": null }]
/// }
/// ```
///
/// A missing file means no overrides have been entered yet.
pub struct JsonOverrideStore {
    path: PathBuf,
}

impl JsonOverrideStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<OverrideFile, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(OverrideFile::default()),
            Err(source) => Err(StoreError::Io {
                path: self.path.display().to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl OverrideStore for JsonOverrideStore {
    async fn cancelled_trips(
        &self,
        network_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CancelledTrip>, StoreError> {
        Ok(self
            .read()
            .await?
            .cancelled
            .into_iter()
            .filter(|r| r.network_id == network_id && r.trip.date == date)
            .map(|r| r.trip)
            .collect())
    }

    async fn delayed_trips(
        &self,
        network_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DelayedTrip>, StoreError> {
        Ok(self
            .read()
            .await?
            .delayed
            .into_iter()
            .filter(|r| r.network_id == network_id && r.trip.date == date)
            .map(|r| r.trip)
            .collect())
    }
}

/// Fixed override records for a single network.
#[derive(Debug, Default, Clone)]
pub struct StaticOverrides {
    pub cancelled: Vec<CancelledTrip>,
    pub delayed: Vec<DelayedTrip>,
}

#[async_trait]
impl OverrideStore for StaticOverrides {
    async fn cancelled_trips(
        &self,
        _network_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CancelledTrip>, StoreError> {
        Ok(self.cancelled.iter().filter(|c| c.date == date).cloned().collect())
    }

    async fn delayed_trips(
        &self,
        _network_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DelayedTrip>, StoreError> {
        Ok(self.delayed.iter().filter(|d| d.date == date).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::load_override_maps;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(name)
    }

    #[tokio::test]
    async fn test_json_store_filters_by_network_and_date() {
        let path = temp_path("gtfs_rt_reconciler_overrides.json");
        fs::write(
            &path,
            r#"{
                "cancelled": [
                    {"network_id": "bdx", "trip_id": "T1", "date": "2024-03-10", "reason": "strike"},
                    {"network_id": "other", "trip_id": "T9", "date": "2024-03-10", "reason": null}
                ],
                "delayed": [
                    {"network_id": "bdx", "trip_id": "T2", "date": "2024-03-10", "delay_minutes": 12, "reason": null},
                    {"network_id": "bdx", "trip_id": "T3", "date": "2024-03-11", "delay_minutes": 4, "reason": null}
                ]
            }"#,
        )
        .unwrap();

        let store = JsonOverrideStore::new(&path);
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let maps = load_override_maps(&store, "bdx", date).await.unwrap();

        assert_eq!(maps.cancelled.len(), 1);
        assert!(maps.cancelled.contains_key("T1"));
        assert_eq!(maps.delayed.len(), 1);
        assert_eq!(maps.delayed["T2"].delay_minutes, 12);

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let store = JsonOverrideStore::new(temp_path("gtfs_rt_reconciler_no_such_overrides.json"));
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert!(store.cancelled_trips("bdx", date).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_malformed_file_is_error() {
        let path = temp_path("gtfs_rt_reconciler_bad_overrides.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonOverrideStore::new(&path);
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert!(store.delayed_trips("bdx", date).await.is_err());
        fs::remove_file(&path).unwrap();
    }
}
