//! Output formatting and persistence for reconciled rows and statistics.
//!
//! Supports pretty-printing, JSON serialization, and CSV append.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::model::{DelaySource, DisplayStopRow};
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// Flat CSV form of a [`DisplayStopRow`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRecord {
    pub observed_at: i64,
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub scheduled: String,
    pub effective: String,
    pub delay_minutes: Option<i32>,
    pub source: DelaySource,
    pub skipped: bool,
    pub has_realtime: bool,
    pub is_manually_cancelled: bool,
    pub is_manually_delayed: bool,
    pub reason: Option<String>,
}

impl RowRecord {
    pub fn from_row(row: &DisplayStopRow, observed_at: i64) -> Self {
        Self {
            observed_at,
            trip_id: row.trip_id.clone(),
            stop_id: row.stop_id.clone(),
            stop_sequence: row.stop_sequence,
            scheduled: row.scheduled.to_string(),
            effective: row.effective.to_string(),
            delay_minutes: row.delay_minutes,
            source: row.source,
            skipped: row.skipped,
            has_realtime: row.has_realtime,
            is_manually_cancelled: row.manual.is_manually_cancelled,
            is_manually_delayed: row.manual.is_manually_delayed,
            reason: row
                .manual
                .cancellation_reason
                .clone()
                .or_else(|| row.manual.delay_info.as_ref().and_then(|d| d.reason.clone())),
        }
    }
}

/// Logs a value using Rust's debug pretty-print format.
pub fn print_pretty<T: std::fmt::Debug>(value: &T) {
    debug!("{:#?}", value);
}

/// Logs a value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Appends records as rows of a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_records<T: Serialize>(path: &str, records: &[T]) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, rows = records.len(), "Appending CSV records");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}

/// Appends one CSV row per displayed stop.
pub fn append_rows(path: &str, rows: &[DisplayStopRow], observed_at: i64) -> Result<()> {
    let records: Vec<RowRecord> = rows
        .iter()
        .map(|row| RowRecord::from_row(row, observed_at))
        .collect();
    append_records(path, &records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ManualDelay, TripOverrideFlags};
    use crate::stats::SnapshotStats;
    use crate::time::GtfsTime;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    fn row(seq: u32) -> DisplayStopRow {
        DisplayStopRow {
            trip_id: "T1".into(),
            stop_id: format!("S{seq}"),
            stop_sequence: seq,
            scheduled: GtfsTime::from_hms(24, 5, 0),
            effective: GtfsTime::from_hms(24, 17, 0),
            delay_minutes: Some(12),
            source: DelaySource::Manual,
            skipped: false,
            has_realtime: true,
            manual: TripOverrideFlags {
                is_manually_delayed: true,
                delay_info: Some(ManualDelay {
                    minutes: 12,
                    reason: Some("signal failure".into()),
                }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_print_pretty_does_not_panic() {
        print_pretty(&SnapshotStats::default());
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&vec![row(1)]).unwrap();
    }

    #[test]
    fn test_append_rows_writes_header_once() {
        let path = temp_path("gtfs_rt_reconciler_test_header.csv");
        let _ = fs::remove_file(&path); // clean up any prior run

        append_rows(&path, &[row(1), row(2)], 100).unwrap();
        append_rows(&path, &[row(3)], 130).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        // 1 header + 3 data rows
        assert_eq!(lines.len(), 4);
        assert_eq!(lines.iter().filter(|l| l.starts_with("observed_at")).count(), 1);
        assert!(lines[1].contains("24:17:00"));
        assert!(lines[1].contains("signal failure"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_records_stats() {
        let path = temp_path("gtfs_rt_reconciler_test_stats.csv");
        let _ = fs::remove_file(&path);

        append_records(&path, &[SnapshotStats::from_error("fetch_error", "timeout")]).unwrap();
        assert!(Path::new(&path).exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("fetch_error"));

        fs::remove_file(&path).unwrap();
    }
}
