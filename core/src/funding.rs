//! Funding eligibility — age-based category and full funding amount for a
//! student in a school year.
//!
//! Ages are measured on September 1 of the school year's start calendar
//! year; December 31 only shapes the guidance text. Birthdays are calendar dates
//! in the regional timezone; timestamps are converted before comparison.
//!
//! ESCAPE HATCH: a missing birthday or school year yields category
//! `unknown`, eligible, $0. Registration must not be blocked by missing
//! data, so this is surfaced (defaulted = true, warn log) and never treated
//! as an error.

use crate::{
    clock::regional_date,
    error::{BillingError, BillingResult},
    proration::Allocation,
    types::{SchoolYear, StudentKey},
};
use chrono::{DateTime, Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 4 years 8 months.
pub const KINDERGARTEN_MIN_MONTHS: i32 = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeCategory {
    Kindergarten,
    #[serde(rename = "grades_1_12")]
    Grades1To12,
    TooYoung,
    TooOld,
    Unknown,
}

impl AgeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeCategory::Kindergarten => "kindergarten",
            AgeCategory::Grades1To12 => "grades_1_12",
            AgeCategory::TooYoung => "too_young",
            AgeCategory::TooOld => "too_old",
            AgeCategory::Unknown => "unknown",
        }
    }
}

impl FromStr for AgeCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "kindergarten" => AgeCategory::Kindergarten,
            "grades_1_12" => AgeCategory::Grades1To12,
            "too_young" => AgeCategory::TooYoung,
            "too_old" => AgeCategory::TooOld,
            "unknown" => AgeCategory::Unknown,
            other => return Err(format!("unknown age category '{other}'")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingEligibility {
    pub age_category: AgeCategory,
    /// Full entitled amount before proration.
    pub funding_amount: Decimal,
    pub funding_eligible: bool,
    pub age_on_sept1: Option<i32>,
    pub months_on_sept1: Option<i32>,
    /// Staff-facing explanation, set whenever the amount is $0.
    pub message: Option<String>,
    /// True when the permissive unknown default was applied.
    pub defaulted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingRates {
    pub kindergarten: Decimal,
    pub grades_1_12: Decimal,
}

/// Funding entry written per (student, school year). The family-level
/// aggregator only ever reads this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingEntry {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    pub eligibility: FundingEligibility,
    pub allocation: Allocation,
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_birthday(raw: &str) -> BillingResult<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| regional_date(ts.to_utc()))
        .map_err(|_| BillingError::invalid("birthday", format!("unrecognized date '{raw}'")))
}

/// Completed years between `birthday` and `on`. Negative if born after.
pub fn age_in_years(birthday: NaiveDate, on: NaiveDate) -> i32 {
    let mut years = on.year() - birthday.year();
    if (on.month(), on.day()) < (birthday.month(), birthday.day()) {
        years -= 1;
    }
    years
}

/// Completed months between `birthday` and `on`.
pub fn age_in_months(birthday: NaiveDate, on: NaiveDate) -> i32 {
    let mut months = (on.year() - birthday.year()) * 12 + on.month() as i32 - birthday.month() as i32;
    if on.day() < birthday.day() {
        months -= 1;
    }
    months
}

fn reference_date(year: i32, month: u32, day: u32) -> BillingResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| BillingError::invalid("school_year", format!("no {month}/{day} in {year}")))
}

pub fn evaluate(
    birthday: Option<NaiveDate>,
    school_year: Option<SchoolYear>,
    rates: &FundingRates,
) -> BillingResult<FundingEligibility> {
    let (birthday, school_year) = match (birthday, school_year) {
        (Some(b), Some(y)) => (b, y),
        (b, _) => {
            let missing = if b.is_none() { "birthday" } else { "school year" };
            log::warn!("funding: {missing} missing, defaulting to eligible with $0 (category unknown)");
            return Ok(FundingEligibility {
                age_category: AgeCategory::Unknown,
                funding_amount: Decimal::ZERO,
                funding_eligible: true,
                age_on_sept1: None,
                months_on_sept1: None,
                message: Some(format!(
                    "No {missing} on file: funding defaults to $0 until it is recorded"
                )),
                defaulted: true,
            });
        }
    };

    let start = school_year.start_year();
    let sept1 = reference_date(start, 9, 1)?;
    let dec31 = reference_date(start, 12, 31)?;
    let next_sept1 = reference_date(start + 1, 9, 1)?;

    let years = age_in_years(birthday, sept1);
    let months = age_in_months(birthday, sept1);

    let (category, amount, message) = if years < 6 && months >= KINDERGARTEN_MIN_MONTHS {
        (AgeCategory::Kindergarten, rates.kindergarten, None)
    } else if years > 6 && years < 20 {
        (AgeCategory::Grades1To12, rates.grades_1_12, None)
    } else if years >= 20 {
        (
            AgeCategory::TooOld,
            Decimal::ZERO,
            Some(format!(
                "Student is {years} on September 1, {start}; students 20 or older on September 1 are not eligible for funding"
            )),
        )
    } else if years == 6 {
        (
            AgeCategory::TooYoung,
            Decimal::ZERO,
            Some(format!(
                "Student is 6 on September 1, {start}; grades 1-12 funding starts at age 7 on September 1"
            )),
        )
    } else if age_in_years(birthday, next_sept1) >= 5 {
        // Turns 5 during the school year, but after December 31.
        (
            AgeCategory::TooYoung,
            Decimal::ZERO,
            Some(format!(
                "Student must turn 5 by December 31, {start} to be eligible for kindergarten funding (turns 5 after {dec31})"
            )),
        )
    } else {
        (
            AgeCategory::TooYoung,
            Decimal::ZERO,
            Some(format!(
                "Student must be at least 4 years 8 months old on September 1, {start} to be eligible for kindergarten funding (is {} years {} months)",
                months.max(0) / 12,
                months.max(0) % 12
            )),
        )
    };

    Ok(FundingEligibility {
        funding_eligible: matches!(category, AgeCategory::Kindergarten | AgeCategory::Grades1To12),
        age_category: category,
        funding_amount: amount,
        age_on_sept1: Some(years),
        months_on_sept1: Some(months),
        message,
        defaulted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates() -> FundingRates {
        FundingRates {
            kindergarten: Decimal::new(45050, 2),
            grades_1_12: Decimal::new(90100, 2),
        }
    }

    fn category(birthday: (i32, u32, u32)) -> AgeCategory {
        let b = NaiveDate::from_ymd_opt(birthday.0, birthday.1, birthday.2).unwrap();
        evaluate(Some(b), Some(SchoolYear::starting(2025)), &rates())
            .unwrap()
            .age_category
    }

    #[test]
    fn kindergarten_needs_56_months_on_sept_1() {
        // 56 months exactly on 2025-09-01.
        assert_eq!(category((2021, 1, 1)), AgeCategory::Kindergarten);
        // 55 months.
        assert_eq!(category((2021, 2, 1)), AgeCategory::TooYoung);
    }

    #[test]
    fn grades_boundaries() {
        assert_eq!(category((2019, 9, 1)), AgeCategory::TooYoung); // exactly 6
        assert_eq!(category((2018, 9, 1)), AgeCategory::Grades1To12); // exactly 7
        assert_eq!(category((2006, 9, 1)), AgeCategory::Grades1To12); // exactly 19
        assert_eq!(category((2005, 9, 1)), AgeCategory::TooOld); // exactly 20
    }

    #[test]
    fn too_young_messages_distinguish_the_two_rules() {
        let year = Some(SchoolYear::starting(2025));
        // Turns 5 on 2026-02-01: not 5 by Dec 31.
        let late = evaluate(NaiveDate::from_ymd_opt(2021, 2, 1), year, &rates()).unwrap();
        assert!(late.message.unwrap().contains("turn 5 by December 31"));

        // Turns 5 in 2027: not close, so the months rule is quoted.
        let far = evaluate(NaiveDate::from_ymd_opt(2022, 3, 1), year, &rates()).unwrap();
        assert_eq!(far.age_category, AgeCategory::TooYoung);
        assert!(far.message.unwrap().contains("4 years 8 months"));
    }

    #[test]
    fn missing_birthday_defaults_to_unknown_zero_eligible() {
        let out = evaluate(None, Some(SchoolYear::starting(2025)), &rates()).unwrap();
        assert_eq!(out.age_category, AgeCategory::Unknown);
        assert!(out.funding_eligible);
        assert!(out.defaulted);
        assert_eq!(out.funding_amount, Decimal::ZERO);
    }

    #[test]
    fn timestamps_are_read_as_regional_dates() {
        // 03:00 UTC on Sept 2 is still Sept 1 in Edmonton.
        let b = parse_birthday("2018-09-02T03:00:00Z").unwrap();
        assert_eq!(b, NaiveDate::from_ymd_opt(2018, 9, 1).unwrap());
        assert!(parse_birthday("09/01/2018").is_err());
    }
}
