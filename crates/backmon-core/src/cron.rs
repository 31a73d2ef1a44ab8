// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Cron schedules and the previous-fire computation.
//!
//! The underlying library only iterates schedules forward. The previous fire
//! of a schedule is therefore found by probing: establish an upper bound via
//! the next fire after `now`, expand a lower bound geometrically into the
//! past until it contains at least one fire, and bisect the window until it
//! narrows below one minute.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    inner: cron::Schedule,
    source: String,
}

/// Error produced when a cron expression cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression '{expression}': {source}")]
pub struct ScheduleError {
    expression: String,
    #[source]
    source: cron::error::Error,
}

impl Schedule {
    /// Parses a cron expression.
    ///
    /// Standard five-field expressions are accepted and normalised by
    /// prepending a zero seconds column; six- and seven-field expressions
    /// pass through unchanged.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_owned()
        };

        let inner = cron::Schedule::from_str(&normalized).map_err(|source| ScheduleError {
            expression: expression.to_owned(),
            source,
        })?;

        Ok(Self {
            inner,
            source: expression.to_owned(),
        })
    }

    /// The expression this schedule was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The first fire strictly after `moment`, if the schedule is not
    /// exhausted by then.
    pub fn next(&self, moment: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&moment).next()
    }

    /// The latest fire at or before `moment`, or `None` when no fire
    /// precedes it within 200 years.
    pub fn previous_fire(&self, moment: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let high = self
            .next(moment)
            .unwrap_or_else(|| moment + Duration::seconds(1));

        let mut window = Duration::days(-2);
        let mut low = moment + window;
        let mut mid = self.next(low);

        while !mid.is_some_and(|m| m < high) {
            window = window * 2;
            low = moment + window;
            mid = self.next(low);
            if !mid.is_some_and(|m| m < high) && window < Duration::days(-200 * 365) {
                return None;
            }
        }

        let mid = mid.expect("loop above established a fire below the bound");
        Some(self.previous_in_range(mid, moment, high))
    }

    /// Bisects `[low, high]` for the latest fire before `next_fire`, where
    /// `low` is a known fire and `next_fire` is the first fire above the
    /// window.
    fn previous_in_range(
        &self,
        mut low: DateTime<Utc>,
        mut high: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> DateTime<Utc> {
        loop {
            let diff = high - low;
            let median = low + diff / 2;
            let Some(next_after_median) = self.next(median) else {
                // The schedule is exhausted past the median; the best known
                // fire is the lower bound.
                return low;
            };

            if next_after_median < next_fire {
                if diff < Duration::minutes(1) {
                    return next_after_median;
                }
                low = next_after_median;
            } else {
                if diff < Duration::minutes(1) {
                    return low;
                }
                high = median;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use backmon_test_utils::utc;

    use super::*;

    #[test]
    fn finds_previous_daily_fire() {
        let schedule = Schedule::parse("30 23 * * *").expect("expression is valid");
        let now = utc(2019, 4, 25, 8, 42, 55);

        assert_eq!(
            schedule.previous_fire(now),
            Some(utc(2019, 4, 24, 23, 30, 0))
        );
    }

    #[test]
    fn finds_previous_fire_across_weekday_restriction() {
        let schedule = Schedule::parse("30 23 * * MON-FRI").expect("expression is valid");
        // Monday morning; the last weekday fire was Friday night.
        let now = utc(2019, 4, 29, 8, 42, 55);

        assert_eq!(
            schedule.previous_fire(now),
            Some(utc(2019, 4, 26, 23, 30, 0))
        );
    }

    #[test]
    fn previous_fire_of_an_exact_fire_instant_is_in_the_past() {
        let schedule = Schedule::parse("0 2 * * *").expect("expression is valid");
        let now = utc(2024, 1, 2, 2, 0, 0);

        // `now` itself is a fire; it is at or before `now`, so it wins.
        assert_eq!(schedule.previous_fire(now), Some(now));
    }

    #[test]
    fn previous_fire_is_consistent_with_forward_iteration() {
        let schedule = Schedule::parse("15 4 * * MON").expect("expression is valid");
        let now = utc(2023, 7, 19, 12, 0, 0);

        let previous = schedule.previous_fire(now).expect("a previous fire exists");
        assert!(previous <= now);
        assert_eq!(
            schedule.next(previous - Duration::seconds(1)),
            Some(previous)
        );
        // No fire between `previous` and `now`.
        assert!(schedule.next(previous).map_or(true, |next| next > now));
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let schedule = Schedule::parse("0 30 23 * * *").expect("expression is valid");
        let now = utc(2019, 4, 25, 8, 42, 55);

        assert_eq!(
            schedule.previous_fire(now),
            Some(utc(2019, 4, 24, 23, 30, 0))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(Schedule::parse("not a cron").is_err());
        assert!(Schedule::parse("61 24 * * *").is_err());
    }
}
