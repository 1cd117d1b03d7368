//! Shared primitive types used across the billing and funding engines.

use crate::error::{BillingError, BillingResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable key identifying a student (sanitized email in upstream systems).
pub type StudentKey = String;

/// Numeric course identifier from the course catalog.
pub type CourseId = u32;

/// Canonical student-type key, e.g. `homeEducation`.
pub type TypeKey = String;

/// A school year in `YY/YY` form, e.g. `25/26`.
///
/// The second half must be the year after the first. `start_year()` is the
/// calendar year in which the school year begins (2025 for `25/26`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchoolYear {
    start: i32,
}

impl SchoolYear {
    pub fn parse(raw: &str) -> BillingResult<Self> {
        let raw = raw.trim();
        let (first, second) = raw
            .split_once('/')
            .ok_or_else(|| BillingError::invalid("school_year", format!("expected YY/YY, got '{raw}'")))?;

        let parse_half = |half: &str| -> BillingResult<i32> {
            if half.len() != 2 || !half.chars().all(|c| c.is_ascii_digit()) {
                return Err(BillingError::invalid(
                    "school_year",
                    format!("expected YY/YY, got '{raw}'"),
                ));
            }
            half.parse::<i32>()
                .map_err(|e| BillingError::invalid("school_year", e.to_string()))
        };

        let a = parse_half(first)?;
        let b = parse_half(second)?;
        if (a + 1) % 100 != b {
            return Err(BillingError::invalid(
                "school_year",
                format!("'{raw}' does not span consecutive years"),
            ));
        }
        Ok(Self { start: 2000 + a })
    }

    /// School year beginning in September of `start_year`.
    pub const fn starting(start_year: i32) -> Self {
        Self { start: start_year }
    }

    /// Calendar year of September 1 for this school year.
    pub fn start_year(&self) -> i32 {
        self.start
    }

    pub fn following(&self) -> Self {
        Self { start: self.start + 1 }
    }
}

impl fmt::Display for SchoolYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}/{:02}",
            self.start.rem_euclid(100),
            (self.start + 1).rem_euclid(100)
        )
    }
}

impl TryFrom<String> for SchoolYear {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SchoolYear::parse(&value)
    }
}

impl From<SchoolYear> for String {
    fn from(value: SchoolYear) -> Self {
        value.to_string()
    }
}

impl std::str::FromStr for SchoolYear {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchoolYear::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_round_trip() {
        let year = SchoolYear::parse("25/26").unwrap();
        assert_eq!(year.start_year(), 2025);
        assert_eq!(year.to_string(), "25/26");
        assert_eq!(year.following().to_string(), "26/27");
    }

    #[test]
    fn century_rollover_is_consecutive() {
        let year = SchoolYear::parse("99/00").unwrap();
        assert_eq!(year.to_string(), "99/00");
    }

    #[test]
    fn rejects_malformed_years() {
        for raw in ["2025/26", "25-26", "25/27", "", "ab/cd"] {
            assert!(SchoolYear::parse(raw).is_err(), "{raw} should be rejected");
        }
    }
}
