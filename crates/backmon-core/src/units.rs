// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Parsers for the duration and byte-size syntaxes used by manifests and the
//! service configuration, plus environment-variable interpolation of string
//! values.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// One second.
pub const SECOND: Duration = Duration::from_secs(1);
/// One minute.
pub const MINUTE: Duration = Duration::from_secs(60);
/// One hour.
pub const HOUR: Duration = Duration::from_secs(60 * 60);
/// One day.
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);
/// One week.
pub const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// One month, counted as 30 days.
pub const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// One year, counted as 365 days.
pub const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

static DURATION_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^
        (?:(?P<year>[0-9]+)Y)?\s*
        (?:(?P<month>[0-9]+)M)?\s*
        (?:(?P<week>[0-9]+)[wW])?\s*
        (?:(?P<day>[0-9]+)[dD])?\s*
        (?:(?P<hour>[0-9]+)h)?\s*
        (?:(?P<minute>[0-9]+)m)?\s*
        (?:(?P<second>[0-9]+)s)?$",
    )
    .expect("duration expression is valid")
});

static ENV_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^__\$\{([A-Za-z_][A-Za-z0-9_]*)\}__$").expect("env reference regex is valid")
});

/// Errors from the unit parsers.
#[derive(Debug, thiserror::Error)]
pub enum UnitsError {
    /// The value does not follow the `<n>Y<n>M<n>w<n>d<n>h<n>m<n>s` syntax.
    #[error("invalid duration '{0}'")]
    Duration(String),

    /// The value is neither a plain byte count nor a recognised byte size.
    #[error("invalid byte size '{0}'")]
    Bytes(String),
}

/// A duration as it appears in YAML: either a bare integer (interpreted as
/// days) or a string in the duration syntax.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDuration {
    /// A bare integer, interpreted as a number of days.
    Days(u64),
    /// A string in the `<n>Y<n>M<n>w<n>d<n>h<n>m<n>s` syntax.
    Text(String),
}

impl RawDuration {
    /// Resolves the raw value into a concrete [`Duration`].
    pub fn resolve(&self) -> Result<Duration, UnitsError> {
        match self {
            Self::Days(days) => Ok(DAY.saturating_mul(clamp_u32(*days))),
            Self::Text(text) => parse_duration(text),
        }
    }
}

/// Parses a duration string such as `"1w"`, `"2h30m"`, or `"1Y6M"`.
///
/// Any combination of components is allowed, in the listed order only. The
/// empty string parses to a zero duration.
pub fn parse_duration(value: &str) -> Result<Duration, UnitsError> {
    let captures = DURATION_EXPR
        .captures(value)
        .ok_or_else(|| UnitsError::Duration(value.to_owned()))?;

    let mut duration = Duration::ZERO;
    for (group, unit) in [
        ("year", YEAR),
        ("month", MONTH),
        ("week", WEEK),
        ("day", DAY),
        ("hour", HOUR),
        ("minute", MINUTE),
        ("second", SECOND),
    ] {
        if let Some(found) = captures.name(group) {
            let count: u64 = found
                .as_str()
                .parse()
                .map_err(|_| UnitsError::Duration(value.to_owned()))?;
            duration = duration.saturating_add(unit.saturating_mul(clamp_u32(count)));
        }
    }

    Ok(duration)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Parses a byte size: a bare integer, or a value with an IEC/SI suffix
/// (`KiB`, `MiB`, `GB`, …), case-insensitively and ignoring inner spaces.
pub fn parse_bytes(value: &str) -> Result<u64, UnitsError> {
    let trimmed = value.trim();
    if let Ok(plain) = trimmed.parse::<u64>() {
        return Ok(plain);
    }

    let condensed: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    condensed
        .parse::<bytesize::ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|_| UnitsError::Bytes(value.to_owned()))
}

/// Replaces a string of exactly the form `__${NAME}__` with the value of the
/// `NAME` environment variable (empty when unset); other strings pass
/// through unchanged.
pub fn interpolate_env(value: &str) -> String {
    match ENV_REF.captures(value) {
        Some(captures) => std::env::var(&captures[1]).unwrap_or_default(),
        None => value.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use backmon_test_utils::param_test;

    use super::*;

    param_test! {
        parses_duration: [
            empty: ("", Duration::ZERO),
            seconds: ("30s", Duration::from_secs(30)),
            minutes: ("5m", Duration::from_secs(300)),
            hours_minutes: ("2h30m", Duration::from_secs(9000)),
            days: ("3d", Duration::from_secs(3 * 86_400)),
            weeks: ("1w", WEEK),
            months: ("2M", Duration::from_secs(2 * 30 * 86_400)),
            years: ("1Y", YEAR),
            all_components: ("1Y1M1w1d1h1m1s", Duration::from_secs(
                365 * 86_400 + 30 * 86_400 + 7 * 86_400 + 86_400 + 3600 + 60 + 1
            )),
            uppercase_day: ("2D", Duration::from_secs(2 * 86_400)),
        ]
    }
    fn parses_duration(input: &str, expected: Duration) {
        assert_eq!(parse_duration(input).expect("duration is valid"), expected);
    }

    param_test! {
        rejects_duration: [
            garbage: ("abc"),
            wrong_order: ("1m1h"),
            trailing: ("1h!"),
        ]
    }
    fn rejects_duration(input: &str) {
        assert!(parse_duration(input).is_err());
    }

    param_test! {
        parses_bytes: [
            plain: ("1024", 1024),
            kib: ("1KiB", 1024),
            gib: ("2GiB", 2 * 1024 * 1024 * 1024),
            lowercase: ("2gib", 2 * 1024 * 1024 * 1024),
            with_space: ("2 GiB", 2 * 1024 * 1024 * 1024),
            megabytes_si: ("5MB", 5_000_000),
        ]
    }
    fn parses_bytes(input: &str, expected: u64) {
        assert_eq!(parse_bytes(input).expect("byte size is valid"), expected);
    }

    #[test]
    fn rejects_malformed_bytes() {
        assert!(parse_bytes("lots").is_err());
    }

    #[test]
    fn raw_duration_integer_counts_days() {
        let raw = RawDuration::Days(7);
        assert_eq!(raw.resolve().expect("days resolve"), WEEK);
    }

    #[test]
    fn interpolates_environment_references() {
        std::env::set_var("BACKMON_UNITS_TEST_VALUE", "resolved");
        assert_eq!(interpolate_env("__${BACKMON_UNITS_TEST_VALUE}__"), "resolved");
        assert_eq!(interpolate_env("__${BACKMON_UNITS_TEST_UNSET}__"), "");
        assert_eq!(interpolate_env("plain"), "plain");
        assert_eq!(interpolate_env("${NOT_THE_FORM}"), "${NOT_THE_FORM}");
    }
}
