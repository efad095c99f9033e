use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::snapshot::{FeedSnapshot, StopEventKey};

/// Per-poll decode counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    // entities (GTFS-RT trip updates, SIRI stop visits)
    pub entities_kept: usize,
    pub entities_dropped: usize,

    // stop updates
    pub updates_skipped: usize,
    pub updates_with_delay: usize,
    pub updates_from_schedule: usize,
    pub updates_without_data: usize,
    pub updates_dropped: usize,
}

impl DecodeStats {
    pub fn recorded(&self) -> usize {
        self.updates_skipped + self.updates_with_delay + self.updates_from_schedule
    }

    pub fn absorb(&mut self, other: &DecodeStats) {
        self.entities_kept += other.entities_kept;
        self.entities_dropped += other.entities_dropped;
        self.updates_skipped += other.updates_skipped;
        self.updates_with_delay += other.updates_with_delay;
        self.updates_from_schedule += other.updates_from_schedule;
        self.updates_without_data += other.updates_without_data;
        self.updates_dropped += other.updates_dropped;
    }
}

/// Summary of one published snapshot. Counts stop events by their basic key
/// so each stop is counted once.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotStats {
    pub timestamp: DateTime<Utc>,
    pub produced_at: i64,
    pub keys: usize,
    pub stops: usize,
    pub skipped: usize,
    pub with_delay: usize,
    pub with_absolute_time: usize,
    pub on_time: usize,
    pub late: usize,
    pub early: usize,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl SnapshotStats {
    pub fn from_snapshot(snapshot: &FeedSnapshot) -> Self {
        let mut s = SnapshotStats {
            timestamp: Utc::now(),
            produced_at: snapshot.produced_at(),
            keys: snapshot.len(),
            ..Default::default()
        };

        for (key, event) in snapshot.iter() {
            if !matches!(key, StopEventKey::Basic { .. }) {
                continue;
            }
            s.stops += 1;

            if event.skipped {
                s.skipped += 1;
                continue;
            }

            if event.actual_time().is_some() {
                s.with_absolute_time += 1;
            }

            if let Some(delay) = event.delay_minutes {
                s.with_delay += 1;
                match delay {
                    0 => s.on_time += 1,
                    d if d > 0 => s.late += 1,
                    _ => s.early += 1,
                }
            }
        }

        s
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of stops with a delay that are exactly on time.
    pub fn on_time_pct(&self) -> f64 {
        Self::pct(self.on_time, self.with_delay)
    }

    /// Create an error record with timestamp and error information
    pub fn from_error(error_type: &str, error_message: &str) -> Self {
        SnapshotStats {
            timestamp: Utc::now(),
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }
}
