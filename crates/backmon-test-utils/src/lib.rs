// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the backmon crates.

use chrono::{DateTime, TimeZone, Utc};

/// A result type useful in tests, that wraps any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Returns a fixed UTC instant for use in tests.
pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .expect("test dates must be valid")
}

/// Macro for creating parametrized tests.
///
/// The `param_test!` macro accepts the name of an existing function, followed by a list of case
/// names and their arguments. It expands to a module with a `#[test]` function for each of the
/// cases. Each test case calls the existing, named function with their provided arguments.
///
/// # Examples
///
/// Calling a simple test function can be done as follows:
///
/// ```
/// # use backmon_test_utils::param_test;
/// #
/// param_test! {
///     test_sum: [
///         positive_sums: (10, 7, 17),
///         negative_sums: (-5, -3, -8)
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
///
/// Additionally, test functions can also have return types, such as a [`Result`]:
///
/// ```
/// # use std::error::Error;
/// # use backmon_test_utils::param_test;
/// #
/// param_test! {
///     test_parses -> Result<(), Box<dyn Error>>: [
///         positive: ("21", 21),
///         negative: ("-17", -17),
///     ]
/// }
/// fn test_parses(to_parse: &str, expected: i32) -> Result<(), Box<dyn Error>> {
///     assert_eq!(expected, to_parse.parse::<i32>()?);
///     Ok(())
/// }
/// ```
///
/// Finally, attributes such as `#[ignore]` may be added to individual tests:
///
/// ```
/// # use backmon_test_utils::param_test;
/// #
/// param_test! {
///     test_sum: [
///         #[ignore] positive_sums: (10, 7, 17),
///         negative_sums: (-5, -3, -8)
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$outer])*
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> ():
            [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

#[cfg(test)]
mod tests {
    param_test! {
        checks_sum: [
            positive: (1, 2, 3),
            negative: (-1, -2, -3),
        ]
    }
    fn checks_sum(lhs: i64, rhs: i64, sum: i64) {
        assert_eq!(lhs + rhs, sum);
    }

    param_test! {
        parses -> crate::Result: [
            decimal: ("42", 42),
            zero: ("0", 0),
        ]
    }
    fn parses(input: &str, expected: u64) -> crate::Result {
        assert_eq!(input.parse::<u64>()?, expected);
        Ok(())
    }
}
