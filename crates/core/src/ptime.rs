//! Timestamp parsing and precision-aware comparison.
//!
//! Mirrors report modification times at wildly different resolutions: some
//! keep nanoseconds, some truncate to whole seconds, FTP-era storage rounds
//! to two-second boundaries. [`Precision`] records the resolution detected
//! during the last successful scan so that selection can compare source and
//! mirror timestamps with exactly that much slack.

use serde::Serialize;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use time::macros::format_description;

/// Time resolution of a mirror's reported modification times, in nanoseconds.
///
/// Serialized as an integer nanosecond count in the KV store. The zero value
/// means "unknown" and is normalized to one second before use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Precision(pub u64);

impl Precision {
    pub const SECOND: Precision = Precision(1_000_000_000);

    /// Parse from the stored decimal nanosecond representation.
    pub fn from_store(value: &str) -> Precision {
        Precision(value.parse().unwrap_or(0))
    }

    /// The stored decimal representation.
    pub fn to_store(self) -> String {
        self.0.to_string()
    }

    /// Normalize the unknown value to one second.
    pub fn or_second(self) -> Precision {
        if self.0 == 0 { Self::SECOND } else { self }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.or_second().0)
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::SECOND
    }
}

/// Truncate a timestamp down to a multiple of the given precision.
pub fn truncate(t: OffsetDateTime, precision: Precision) -> OffsetDateTime {
    let step = precision.or_second().0 as i128;
    let nanos = t.unix_timestamp_nanos();
    OffsetDateTime::from_unix_timestamp_nanos(nanos - nanos.rem_euclid(step))
        .expect("truncated timestamp in range")
}

/// Parse an RFC 1123 date as found in `Last-Modified` headers.
///
/// Returns `None` on any parse failure; callers treat that as "no usable
/// modification time", never as an error.
pub fn parse_rfc1123(value: &str) -> Option<OffsetDateTime> {
    let sys = httpdate::parse_http_date(value).ok()?;
    Some(OffsetDateTime::from(sys))
}

/// Format a timestamp in the RFC 1123 form used for KV storage.
pub fn format_rfc1123(t: OffsetDateTime) -> String {
    let sys: SystemTime = t.into();
    httpdate::fmt_http_date(sys)
}

/// Parse a manifest timestamp (`YYYY-MM-DD HH:MM:SS`, UTC assumed).
///
/// The manifest writes dates with slashes; the scanner rewrites them to
/// dashes before calling this.
pub fn parse_manifest(value: &str) -> Option<OffsetDateTime> {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    time::PrimitiveDateTime::parse(value.trim(), &fmt)
        .ok()
        .map(|p| p.assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn truncate_to_seconds_drops_subsecond() {
        let t = datetime!(2024-08-08 11:01:29.5 UTC);
        assert_eq!(truncate(t, Precision::SECOND), datetime!(2024-08-08 11:01:29 UTC));
    }

    #[test]
    fn truncate_to_two_seconds() {
        let p = Precision(2_000_000_000);
        let t = datetime!(2024-08-08 11:01:29 UTC);
        assert_eq!(truncate(t, p), datetime!(2024-08-08 11:01:28 UTC));
    }

    #[test]
    fn zero_precision_behaves_as_one_second() {
        let t = datetime!(2024-08-08 11:01:29.9 UTC);
        assert_eq!(truncate(t, Precision(0)), datetime!(2024-08-08 11:01:29 UTC));
    }

    #[test]
    fn rfc1123_round_trip() {
        let t = datetime!(2024-08-08 11:01:29 UTC);
        let s = format_rfc1123(t);
        assert_eq!(parse_rfc1123(&s), Some(t));
    }

    #[test]
    fn rfc1123_garbage_is_none() {
        assert_eq!(parse_rfc1123("not a date"), None);
        assert_eq!(parse_rfc1123(""), None);
    }

    #[test]
    fn manifest_timestamp_parses() {
        assert_eq!(
            parse_manifest("2024-08-08 11:01:29"),
            Some(datetime!(2024-08-08 11:01:29 UTC))
        );
    }
}
