// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Assembly of timestamps from pattern captures.
//!
//! Path and file-name patterns may capture individual time fields (`%Y`,
//! `%M`, …). A [`Timestamp`] accumulates whichever fields were captured and
//! materialises a concrete [`DateTime`] by filling the absent fields from a
//! caller-supplied default instant.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

const YEAR_FLAG: u8 = 1 << 0;
const MONTH_FLAG: u8 = 1 << 1;
const DAY_FLAG: u8 = 1 << 2;
const HOUR_FLAG: u8 = 1 << 3;
const MINUTE_FLAG: u8 = 1 << 4;
const SECOND_FLAG: u8 = 1 << 5;

/// A partially known instant: six time fields plus a presence flag per field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    flags: u8,
}

impl Timestamp {
    /// Returns true iff no field has been set.
    pub fn is_empty(&self) -> bool {
        self.flags == 0
    }

    /// Materialises the timestamp, taking absent fields from `defaults`.
    ///
    /// The result is interpreted in UTC. If the assembled fields do not form
    /// a valid date (e.g. a captured day of 31 in a defaulted February), the
    /// default instant is returned unchanged.
    pub fn with_defaults(&self, defaults: DateTime<Utc>) -> DateTime<Utc> {
        let year = if self.flags & YEAR_FLAG != 0 {
            i32::from(self.year)
        } else {
            defaults.year()
        };
        let month = if self.flags & MONTH_FLAG != 0 {
            u32::from(self.month)
        } else {
            defaults.month()
        };
        let day = if self.flags & DAY_FLAG != 0 {
            u32::from(self.day)
        } else {
            defaults.day()
        };
        let hour = if self.flags & HOUR_FLAG != 0 {
            u32::from(self.hour)
        } else {
            defaults.hour()
        };
        let minute = if self.flags & MINUTE_FLAG != 0 {
            u32::from(self.minute)
        } else {
            defaults.minute()
        };
        let second = if self.flags & SECOND_FLAG != 0 {
            u32::from(self.second)
        } else {
            defaults.second()
        };

        Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
            .unwrap_or(defaults)
    }
}

/// A single field of a [`Timestamp`], used to record pattern captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    /// The year (four or two digit captures).
    Year,
    /// The month, 01-12.
    Month,
    /// The day of month, 01-31.
    Day,
    /// The hour, 00-23.
    Hour,
    /// The minute, 00-59.
    Minute,
    /// The second, 00-59.
    Second,
}

impl TimeField {
    /// Resolves a capture-group name (`"year"`, `"month"`, …) to a field.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "year" => Some(Self::Year),
            "month" => Some(Self::Month),
            "day" => Some(Self::Day),
            "hour" => Some(Self::Hour),
            "minute" => Some(Self::Minute),
            "second" => Some(Self::Second),
            _ => None,
        }
    }

    /// The capture-group name carrying this field.
    pub fn group_name(&self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }

    /// Records the captured digits into `timestamp` and marks the field as
    /// present. The pattern compiler guarantees `capture` is all digits.
    pub fn apply(&self, capture: &str, timestamp: &mut Timestamp) {
        match self {
            Self::Year => {
                timestamp.year = capture.parse().unwrap_or(0);
                timestamp.flags |= YEAR_FLAG;
            }
            Self::Month => {
                timestamp.month = capture.parse().unwrap_or(0);
                timestamp.flags |= MONTH_FLAG;
            }
            Self::Day => {
                timestamp.day = capture.parse().unwrap_or(0);
                timestamp.flags |= DAY_FLAG;
            }
            Self::Hour => {
                timestamp.hour = capture.parse().unwrap_or(0);
                timestamp.flags |= HOUR_FLAG;
            }
            Self::Minute => {
                timestamp.minute = capture.parse().unwrap_or(0);
                timestamp.flags |= MINUTE_FLAG;
            }
            Self::Second => {
                timestamp.second = capture.parse().unwrap_or(0);
                timestamp.flags |= SECOND_FLAG;
            }
        }
    }
}
