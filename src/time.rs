//! Service-day time arithmetic.
//!
//! GTFS times are offsets from the start of a service day and may run past
//! 24:00 for post-midnight service. Everything here keeps the raw value for
//! ordering; only [`GtfsTime::display`] folds hours back into 0–23.

use chrono::{DateTime, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SECONDS_PER_DAY: u32 = 86_400;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid GTFS time '{0}'")]
pub struct ParseTimeError(pub String);

/// Seconds since the start of a GTFS service day (unfolded, may exceed a day).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GtfsTime(u32);

impl GtfsTime {
    pub const fn from_seconds(seconds: u32) -> Self {
        Self(seconds)
    }

    pub const fn from_hms(hours: u32, minutes: u32, seconds: u32) -> Self {
        Self(hours * 3600 + minutes * 60 + seconds)
    }

    pub fn seconds(self) -> u32 {
        self.0
    }

    /// Raw minutes since the service-day start; 24:05 is 1445.
    pub fn minutes(self) -> u32 {
        self.0 / 60
    }

    /// Shifts by a signed number of seconds, saturating at the day start.
    pub fn offset_by(self, delta_seconds: i64) -> Self {
        let shifted = (self.0 as i64)
            .saturating_add(delta_seconds)
            .clamp(0, u32::MAX as i64);
        Self(shifted as u32)
    }

    /// Rider-facing `HH:MM` with hours folded into 0–23.
    pub fn display(self) -> String {
        let folded = self.0 % SECONDS_PER_DAY;
        format!("{:02}:{:02}", folded / 3600, (folded % 3600) / 60)
    }
}

impl FromStr for GtfsTime {
    type Err = ParseTimeError;

    /// Accepts `H:MM:SS`, `HH:MM:SS` and `HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let mut parts = s.trim().split(':');

        let hours: u32 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let minutes: u32 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let seconds: u32 = match parts.next() {
            Some(sec) => sec.parse().map_err(|_| err())?,
            None => 0,
        };

        if parts.next().is_some() || minutes >= 60 || seconds >= 60 || hours > 99 {
            return Err(err());
        }

        Ok(Self::from_hms(hours, minutes, seconds))
    }
}

impl fmt::Display for GtfsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.0 / 3600,
            (self.0 % 3600) / 60,
            self.0 % 60
        )
    }
}

impl Serialize for GtfsTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GtfsTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A calendar date interpreted in the agency timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDay {
    pub date: NaiveDate,
    pub tz: Tz,
}

impl ServiceDay {
    pub fn new(date: NaiveDate, tz: Tz) -> Self {
        Self { date, tz }
    }

    /// Epoch seconds of `time` on this service day.
    pub fn epoch_of(&self, time: GtfsTime) -> Option<i64> {
        Some(service_day_origin(self.date, self.tz)? + time.seconds() as i64)
    }
}

/// Epoch of a service day's origin: noon local time minus twelve hours.
///
/// Differs from local midnight on DST transition days.
pub fn service_day_origin(date: NaiveDate, tz: Tz) -> Option<i64> {
    let noon = date.and_hms_opt(12, 0, 0)?;
    let local_noon = tz.from_local_datetime(&noon).earliest()?;
    Some(local_noon.timestamp() - 12 * 3600)
}

/// Picks the service date for `time` whose epoch lands closest to
/// `actual_epoch`, among yesterday/today/tomorrow of the actual wall-clock
/// date. Approximate when the feed carries no service date.
pub fn disambiguate_service_date(
    actual_epoch: i64,
    time: GtfsTime,
    tz: Tz,
) -> Option<(NaiveDate, i64)> {
    let wall_date = DateTime::from_timestamp(actual_epoch, 0)?
        .with_timezone(&tz)
        .date_naive();

    [wall_date.pred_opt(), Some(wall_date), wall_date.succ_opt()]
        .into_iter()
        .flatten()
        .filter_map(|date| {
            let epoch = service_day_origin(date, tz)? + time.seconds() as i64;
            Some((date, epoch))
        })
        .min_by_key(|(_, epoch)| (epoch - actual_epoch).abs())
}

/// Parses GTFS `YYYYMMDD` dates, also accepting ISO `YYYY-MM-DD`.
pub fn parse_service_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

/// Seconds to whole minutes, rounding halves up (-90s is -1, 90s is 2).
pub fn round_minutes(seconds: i64) -> i32 {
    (seconds as f64 / 60.0 + 0.5).floor() as i32
}

/// Parses an ISO-8601 duration such as `PT120S`, `PT1M30S` or `-PT60S`.
pub fn parse_iso_duration(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (negative, rest) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let rest = rest.strip_prefix('P')?;

    let mut total = 0.0_f64;
    let mut number = String::new();
    let mut in_time = false;
    let mut saw_component = false;

    for c in rest.chars() {
        let unit = match c {
            'T' if number.is_empty() && !in_time => {
                in_time = true;
                continue;
            }
            '0'..='9' | '.' => {
                number.push(c);
                continue;
            }
            'D' if !in_time => 86_400.0,
            'H' if in_time => 3_600.0,
            'M' if in_time => 60.0,
            'S' if in_time => 1.0,
            _ => return None,
        };
        total += number.parse::<f64>().ok()? * unit;
        number.clear();
        saw_component = true;
    }

    if !number.is_empty() || !saw_component {
        return None;
    }

    let seconds = total.round() as i64;
    Some(if negative { -seconds } else { seconds })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_parse_post_midnight_time_sorts_after_evening() {
        let late: GtfsTime = "25:10:00".parse().unwrap();
        let evening: GtfsTime = "23:50:00".parse().unwrap();
        assert!(late > evening);
        assert_eq!(late.minutes(), 25 * 60 + 10);
    }

    #[test]
    fn test_parse_accepts_single_digit_hour_and_hh_mm() {
        assert_eq!("7:05:09".parse::<GtfsTime>().unwrap(), GtfsTime::from_hms(7, 5, 9));
        assert_eq!("23:55".parse::<GtfsTime>().unwrap(), GtfsTime::from_hms(23, 55, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("12:60:00".parse::<GtfsTime>().is_err());
        assert!("noon".parse::<GtfsTime>().is_err());
        assert!("1:2:3:4".parse::<GtfsTime>().is_err());
        assert!("".parse::<GtfsTime>().is_err());
    }

    #[test]
    fn test_display_folds_hours_but_to_string_does_not() {
        let t = GtfsTime::from_hms(25, 10, 0);
        assert_eq!(t.display(), "01:10");
        assert_eq!(t.to_string(), "25:10:00");
    }

    #[test]
    fn test_offset_by_saturates_at_zero() {
        let t = GtfsTime::from_hms(0, 1, 0);
        assert_eq!(t.offset_by(-120), GtfsTime::from_seconds(0));
        assert_eq!(t.offset_by(300), GtfsTime::from_hms(0, 6, 0));
    }

    #[test]
    fn test_service_day_origin_on_dst_change_is_noon_minus_twelve() {
        // 2024-03-31: Paris switches to CEST; noon local is 10:00 UTC.
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let origin = service_day_origin(date, chrono_tz::Europe::Paris).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 30, 22, 0, 0).unwrap().timestamp();
        assert_eq!(origin, expected);
    }

    #[test]
    fn test_disambiguate_picks_previous_day_for_post_midnight_time() {
        let actual = Utc.with_ymd_and_hms(2024, 3, 11, 0, 10, 0).unwrap().timestamp();
        let (date, epoch) =
            disambiguate_service_date(actual, GtfsTime::from_hms(24, 5, 0), chrono_tz::UTC)
                .unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(actual - epoch, 300);
    }

    #[test]
    fn test_disambiguate_picks_same_day_for_daytime() {
        let actual = Utc.with_ymd_and_hms(2024, 3, 11, 8, 2, 0).unwrap().timestamp();
        let (date, _) =
            disambiguate_service_date(actual, GtfsTime::from_hms(8, 0, 0), chrono_tz::UTC)
                .unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
    }

    #[test]
    fn test_parse_service_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 10);
        assert_eq!(parse_service_date("20240310"), expected);
        assert_eq!(parse_service_date("2024-03-10"), expected);
        assert_eq!(parse_service_date("10/03/2024"), None);
    }

    #[test]
    fn test_round_minutes_rounds_half_up() {
        assert_eq!(round_minutes(0), 0);
        assert_eq!(round_minutes(29), 0);
        assert_eq!(round_minutes(30), 1);
        assert_eq!(round_minutes(90), 2);
        assert_eq!(round_minutes(-90), -1);
        assert_eq!(round_minutes(300), 5);
    }

    #[test]
    fn test_parse_iso_duration_variants() {
        assert_eq!(parse_iso_duration("PT120S"), Some(120));
        assert_eq!(parse_iso_duration("PT1M30S"), Some(90));
        assert_eq!(parse_iso_duration("-PT60S"), Some(-60));
        assert_eq!(parse_iso_duration("PT1H"), Some(3600));
        assert_eq!(parse_iso_duration("P1DT1S"), Some(86_401));
        assert_eq!(parse_iso_duration("PT"), None);
        assert_eq!(parse_iso_duration("120"), None);
        assert_eq!(parse_iso_duration("PT5X"), None);
    }
}
