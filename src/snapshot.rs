//! The canonical real-time view produced by every feed family.

use serde::Serialize;
use std::collections::HashMap;

/// Identifies one stop event of one trip.
///
/// The sequenced form disambiguates loop routes that call at a stop twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StopEventKey {
    Basic {
        trip_id: String,
        stop_id: String,
    },
    Sequenced {
        trip_id: String,
        stop_id: String,
        stop_sequence: u32,
    },
}

impl StopEventKey {
    pub fn basic(trip_id: &str, stop_id: &str) -> Self {
        Self::Basic {
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
        }
    }

    pub fn sequenced(trip_id: &str, stop_id: &str, stop_sequence: u32) -> Self {
        Self::Sequenced {
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
            stop_sequence,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopEvent {
    pub delay_minutes: Option<i32>,
    pub actual_arrival: Option<i64>,
    pub actual_departure: Option<i64>,
    pub skipped: bool,
}

impl StopEvent {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    /// Absolute updated time, departure preferred.
    pub fn actual_time(&self) -> Option<i64> {
        self.actual_departure.or(self.actual_arrival)
    }
}

/// Flattened snapshot entry for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: Option<u32>,
    #[serde(flatten)]
    pub event: StopEvent,
}

/// Map of stop events for one poll. Always replaced whole, never patched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    events: HashMap<StopEventKey, StopEvent>,
    produced_at: i64,
}

impl FeedSnapshot {
    pub fn new(produced_at: i64) -> Self {
        Self {
            events: HashMap::new(),
            produced_at,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn produced_at(&self) -> i64 {
        self.produced_at
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Stores `event` under the basic key and, when known, the sequenced key.
    pub fn record(
        &mut self,
        trip_id: &str,
        stop_id: &str,
        stop_sequence: Option<u32>,
        event: StopEvent,
    ) {
        if let Some(seq) = stop_sequence {
            self.events
                .insert(StopEventKey::sequenced(trip_id, stop_id, seq), event.clone());
        }
        self.events.insert(StopEventKey::basic(trip_id, stop_id), event);
    }

    pub fn get(&self, key: &StopEventKey) -> Option<&StopEvent> {
        self.events.get(key)
    }

    /// Sequenced key first, then the basic key.
    pub fn lookup(&self, trip_id: &str, stop_id: &str, stop_sequence: u32) -> Option<&StopEvent> {
        self.events
            .get(&StopEventKey::sequenced(trip_id, stop_id, stop_sequence))
            .or_else(|| self.events.get(&StopEventKey::basic(trip_id, stop_id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StopEventKey, &StopEvent)> {
        self.events.iter()
    }

    /// Absorbs another snapshot from the same poll (e.g. another route).
    pub fn absorb(&mut self, other: FeedSnapshot) {
        self.produced_at = self.produced_at.max(other.produced_at);
        self.events.extend(other.events);
    }

    /// Entries sorted by key, for stable output.
    pub fn to_entries(&self) -> Vec<SnapshotEntry> {
        let mut keys: Vec<&StopEventKey> = self.events.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                let (trip_id, stop_id, stop_sequence) = match key {
                    StopEventKey::Basic { trip_id, stop_id } => (trip_id, stop_id, None),
                    StopEventKey::Sequenced {
                        trip_id,
                        stop_id,
                        stop_sequence,
                    } => (trip_id, stop_id, Some(*stop_sequence)),
                };
                SnapshotEntry {
                    trip_id: trip_id.clone(),
                    stop_id: stop_id.clone(),
                    stop_sequence,
                    event: self.events[key].clone(),
                }
            })
            .collect()
    }
}
