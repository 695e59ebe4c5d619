//! Tag vocabulary and value parsing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeDelta, Utc};

use crate::cloud::Tags;

/// Tag holding the point in time after which a group may be deleted.
pub const EXPIRES_BY: &str = "ExpiresBy";

/// Tag holding the local part of the last administrative caller.
pub const LAST_MODIFIED_BY: &str = "LastModifiedBy";

/// Presence-only tags that exempt a group from expiry handling.
pub const EXEMPTION_MARKERS: [&str; 3] = ["ManualSetup", "LongHaul", "DoNotDelete"];

/// Activity log category that counts as usage.
pub const ADMINISTRATIVE: &str = "Administrative";

/// The first exemption marker present on the group, if any.
pub fn exemption_marker(tags: &Tags) -> Option<&'static str> {
    EXEMPTION_MARKERS
        .into_iter()
        .find(|marker| tags.contains_key(*marker))
}

/// The group's `ExpiresBy` value, or `None` when absent or unparseable.
pub fn read_expiry(tags: &Tags) -> Option<DateTime<Utc>> {
    tags.get(EXPIRES_BY).and_then(|value| parse_expiry(value))
}

/// Parse an `ExpiresBy` value.
///
/// Accepts RFC 3339 with any fractional precision, naive date-times with a `T`
/// or space separator (read as UTC), and bare dates (midnight UTC).
pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

/// Render an expiry as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_expiry(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Midnight UTC of the same calendar day.
pub fn truncate_to_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// The latest expiry that still formats with a four-digit year and therefore
/// parses back on the next pass: `9999-12-31T00:00:00Z`.
pub fn latest_expiry() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at` plus whole days, clamped to [`latest_expiry`].
pub fn add_days(at: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let latest = latest_expiry();
    at.checked_add_signed(TimeDelta::days(i64::from(days)))
        .map_or(latest, |later| later.min(latest))
}

/// `at` minus whole days, saturating at the smallest representable instant.
pub fn sub_days(at: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    at.checked_sub_signed(TimeDelta::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Owner derived from an activity caller: the part before the first `@`.
pub fn owner_from_caller(caller: &str) -> Option<&str> {
    caller.split_once('@').map(|(local, _)| local)
}
