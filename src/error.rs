//! Error types for the reconciliation engine.
//!
//! Real-time errors ([`TransportError`], [`DecodeError`],
//! [`DataIntegrityError`]) are never surfaced to riders; callers log them and
//! keep rendering scheduled times. [`StoreError`] from the timetable is the
//! only error a view is expected to show.

use thiserror::Error;

/// Network or HTTP failure while fetching a feed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid feed url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("feed returned HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("failed to read local feed file: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed payload at any stage of decoding.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("xml decode failed: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("zip archive unreadable: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("payload read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("zip archive has no entry with extension {expected:?}")]
    NoMatchingEntry { expected: &'static [&'static str] },
    #[error("unexpected document shape: {0}")]
    Shape(String),
}

/// A feed update references something the timetable does not know.
///
/// Only the offending stop update is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataIntegrityError {
    #[error("trip '{0}' not found in timetable")]
    UnknownTrip(String),
    #[error("stop {stop:?} (sequence {sequence:?}) not found on trip '{trip}'")]
    UnknownStop {
        trip: String,
        stop: Option<String>,
        sequence: Option<u32>,
    },
    #[error("reported time {epoch} on trip '{trip}' is out of range")]
    TimeOutOfRange { trip: String, epoch: i64 },
}

/// Failure of the timetable or override store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("csv read failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("json read failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid time '{0}'")]
    InvalidTime(String),
    #[error("invalid date '{0}'")]
    InvalidDate(String),
}

/// Invalid or incomplete configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown timezone '{0}'")]
    Timezone(String),
    #[error("environment variable {0} is not set")]
    MissingSecret(String),
    #[error("endpoint auth requires key_env")]
    MissingKeyEnv,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Everything that can go wrong during one poll of a feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("poll task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
