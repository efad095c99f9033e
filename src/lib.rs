//! Real-time arrival reconciliation for transit timetables.
//!
//! Live trip updates (GTFS-Realtime or SIRI) are decoded into a
//! [`snapshot::FeedSnapshot`], combined with the static timetable and the
//! dispatcher overrides, and rendered as one row per stop of the selected trip.

pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod live;
pub mod merger;
pub mod model;
pub mod output;
pub mod resolver;
pub mod selector;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod time;
pub mod vehicles;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
