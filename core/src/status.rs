//! Status vocabulary of the enrollment payment projection.
//!
//! Coarse `PaymentStatus` is what dashboards filter on; `DetailedStatus`
//! explains which rule produced it. Both serialize to stable snake_case
//! strings that are persisted, so variants are never renamed.

use crate::{
    processor::PaymentHandle,
    types::{CourseId, SchoolYear, StudentKey, TypeKey},
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Free,
    Paid,
    Partial,
    RequiresPayment,
    Override,
    CarriedOver,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Free => "free",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Partial => "partial",
            PaymentStatus::RequiresPayment => "requires_payment",
            PaymentStatus::Override => "override",
            PaymentStatus::CarriedOver => "carried_over",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "free" => PaymentStatus::Free,
            "paid" => PaymentStatus::Paid,
            "partial" => PaymentStatus::Partial,
            "requires_payment" => PaymentStatus::RequiresPayment,
            "override" => PaymentStatus::Override,
            "carried_over" => PaymentStatus::CarriedOver,
            other => return Err(format!("unknown payment status '{other}'")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DetailedStatus {
    // ── Credit-based ───────────────────────────────
    Exempt,
    CreditFree,
    CreditPartial,
    CreditPaid,
    CreditRequiresPayment,
    CreditOverride,

    // ── Per-course ─────────────────────────────────
    ManualOverride,
    CarriedOver,
    Paid,
    Active,
    PastDue,
    /// Subscription canceled after N succeeded charges.
    CanceledPartial(u32),
    Incomplete,
    NoPayment,
    TrialPeriod,
    UnpaidBeforeStartDate,
    Unpaid,
}

impl DetailedStatus {
    /// Trial-window codes survive a rerun that cannot re-evaluate timing.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            DetailedStatus::TrialPeriod | DetailedStatus::UnpaidBeforeStartDate
        )
    }
}

impl fmt::Display for DetailedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetailedStatus::Exempt => "exempt",
            DetailedStatus::CreditFree => "credit_free",
            DetailedStatus::CreditPartial => "credit_partial",
            DetailedStatus::CreditPaid => "credit_paid",
            DetailedStatus::CreditRequiresPayment => "credit_requires_payment",
            DetailedStatus::CreditOverride => "credit_override",
            DetailedStatus::ManualOverride => "manual_override",
            DetailedStatus::CarriedOver => "carried_over",
            DetailedStatus::Paid => "paid",
            DetailedStatus::Active => "active",
            DetailedStatus::PastDue => "past_due",
            DetailedStatus::CanceledPartial(n) => return write!(f, "canceled_partial_{n}"),
            DetailedStatus::Incomplete => "incomplete",
            DetailedStatus::NoPayment => "no_payment",
            DetailedStatus::TrialPeriod => "trial_period",
            DetailedStatus::UnpaidBeforeStartDate => "unpaid_before_start_date",
            DetailedStatus::Unpaid => "unpaid",
        };
        f.write_str(s)
    }
}

impl FromStr for DetailedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(n) = s.strip_prefix("canceled_partial_") {
            return n
                .parse()
                .map(DetailedStatus::CanceledPartial)
                .map_err(|_| format!("bad charge count in '{s}'"));
        }
        Ok(match s {
            "exempt" => DetailedStatus::Exempt,
            "credit_free" => DetailedStatus::CreditFree,
            "credit_partial" => DetailedStatus::CreditPartial,
            "credit_paid" => DetailedStatus::CreditPaid,
            "credit_requires_payment" => DetailedStatus::CreditRequiresPayment,
            "credit_override" => DetailedStatus::CreditOverride,
            "manual_override" => DetailedStatus::ManualOverride,
            "carried_over" => DetailedStatus::CarriedOver,
            "paid" => DetailedStatus::Paid,
            "active" => DetailedStatus::Active,
            "past_due" => DetailedStatus::PastDue,
            "incomplete" => DetailedStatus::Incomplete,
            "no_payment" => DetailedStatus::NoPayment,
            "trial_period" => DetailedStatus::TrialPeriod,
            "unpaid_before_start_date" => DetailedStatus::UnpaidBeforeStartDate,
            "unpaid" => DetailedStatus::Unpaid,
            other => return Err(format!("unknown detailed status '{other}'")),
        })
    }
}

impl TryFrom<String> for DetailedStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DetailedStatus> for String {
    fn from(value: DetailedStatus) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Subscription,
    OneTime,
    Manual,
    Carryover,
    Credits,
}

// ── Details ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDetails {
    pub credits: u32,
    pub exempt: bool,
    pub requires_payment: bool,
    pub credits_required_to_unlock: u32,
    pub base_free_credits_used: u32,
    pub override_credits_used: u32,
    pub paid_credits_used: u32,
    pub free_credits_limit: Option<u32>,
    pub additional_free_credits: u32,
    pub paid_credits_balance: u32,
    pub cost_per_credit: Decimal,
    pub amount_due: Decimal,
    pub override_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCourseDetails {
    pub payment_handle: Option<PaymentHandle>,
    /// Raw processor classification before trial rules were applied.
    pub processor_status: Option<DetailedStatus>,
    pub succeeded_charges: Option<u32>,
    pub required_charges: u32,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub scheduled_start: Option<NaiveDate>,
    /// False when the enrollment had no creation time to evaluate the trial.
    pub timing_available: bool,
    pub override_reason: Option<String>,
    pub carried_over_from: Option<SchoolYear>,
    /// Processor was unreachable; the last persisted state was used.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum StatusDetails {
    CreditBased(CreditDetails),
    PerCourse(PerCourseDetails),
}

/// The projection row owned by this system, one per enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentPaymentStatus {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    pub course_id: CourseId,
    pub student_type: TypeKey,
    pub is_paid: bool,
    pub status: PaymentStatus,
    pub detailed_status: DetailedStatus,
    pub payment_type: Option<PaymentType>,
    pub last_updated: Option<DateTime<Utc>>,
    pub details: StatusDetails,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detailed_status_strings_are_stable() {
        for s in [
            "credit_free",
            "credit_requires_payment",
            "manual_override",
            "canceled_partial_2",
            "unpaid_before_start_date",
        ] {
            let parsed: DetailedStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("canceled_partial_x".parse::<DetailedStatus>().is_err());
    }

    #[test]
    fn only_trial_codes_are_sticky() {
        assert!(DetailedStatus::TrialPeriod.is_sticky());
        assert!(DetailedStatus::UnpaidBeforeStartDate.is_sticky());
        assert!(!DetailedStatus::Unpaid.is_sticky());
    }
}
