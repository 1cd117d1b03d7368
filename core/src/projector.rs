//! Payment status projector — turns engine/resolver output into the
//! persisted `EnrollmentPaymentStatus` and applies trial stickiness.
//!
//! Both functions here are pure: same inputs, byte-identical output.

use crate::{
    course_payment::PerCourseResult,
    entitlement::CreditDecision,
    status::{
        CreditDetails, DetailedStatus, EnrollmentPaymentStatus, PaymentStatus, PaymentType,
        StatusDetails,
    },
    types::{CourseId, SchoolYear, StudentKey, TypeKey},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Staff decision attached to a credit-based enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualOverride {
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditBasedResult {
    pub decision: CreditDecision,
    pub free_credits_limit: Option<u32>,
    pub additional_free_credits: u32,
    pub paid_credits_balance: u32,
    pub cost_per_credit: Decimal,
    /// Reason recorded on the credit-limit override, if one is active.
    pub credit_override_reason: Option<String>,
    pub credit_override_at: Option<DateTime<Utc>>,
    /// Paid course override. Such enrollments bypass the allowance.
    pub manual_override: Option<ManualOverride>,
}

/// One enrollment's computed outcome. Selected once per student type by
/// its billing model and never mixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentResult {
    CreditBased(CreditBasedResult),
    PerCourse(PerCourseResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionKey {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    pub course_id: CourseId,
    pub student_type: TypeKey,
}

pub fn project(key: &ProjectionKey, result: &EnrollmentResult) -> EnrollmentPaymentStatus {
    let (is_paid, status, detailed_status, payment_type, last_updated, details) = match result {
        EnrollmentResult::CreditBased(r) => project_credit(r),
        EnrollmentResult::PerCourse(r) => (
            r.is_paid,
            r.status,
            r.detailed_status,
            r.payment_type,
            r.last_updated,
            StatusDetails::PerCourse(r.details.clone()),
        ),
    };

    EnrollmentPaymentStatus {
        student_key: key.student_key.clone(),
        school_year: key.school_year,
        course_id: key.course_id,
        student_type: key.student_type.clone(),
        is_paid,
        status,
        detailed_status,
        payment_type,
        last_updated,
        details,
    }
}

type Projected = (
    bool,
    PaymentStatus,
    DetailedStatus,
    Option<PaymentType>,
    Option<DateTime<Utc>>,
    StatusDetails,
);

fn project_credit(r: &CreditBasedResult) -> Projected {
    let d = &r.decision;
    let unpaid = d.credits_required_to_unlock;

    let (status, detailed, payment_type, last_updated) = if d.exempt {
        (PaymentStatus::Free, DetailedStatus::Exempt, None, None)
    } else if let Some(o) = &r.manual_override {
        (
            PaymentStatus::Override,
            DetailedStatus::ManualOverride,
            Some(PaymentType::Manual),
            Some(o.created_at),
        )
    } else if unpaid > 0 && d.paid_credits_used > 0 {
        (
            PaymentStatus::Partial,
            DetailedStatus::CreditPartial,
            Some(PaymentType::Credits),
            None,
        )
    } else if unpaid > 0 {
        (
            PaymentStatus::RequiresPayment,
            DetailedStatus::CreditRequiresPayment,
            Some(PaymentType::Credits),
            None,
        )
    } else if d.paid_credits_used > 0 {
        (
            PaymentStatus::Paid,
            DetailedStatus::CreditPaid,
            Some(PaymentType::Credits),
            None,
        )
    } else if d.override_credits_used > 0 {
        (
            PaymentStatus::Override,
            DetailedStatus::CreditOverride,
            None,
            r.credit_override_at,
        )
    } else {
        (PaymentStatus::Free, DetailedStatus::CreditFree, None, None)
    };

    let override_reason = match detailed {
        DetailedStatus::ManualOverride => r.manual_override.as_ref().map(|o| o.reason.clone()),
        DetailedStatus::CreditOverride => r.credit_override_reason.clone(),
        _ => None,
    };

    let details = CreditDetails {
        credits: d.credits,
        exempt: d.exempt,
        requires_payment: d.requires_payment,
        credits_required_to_unlock: unpaid,
        base_free_credits_used: d.base_free_credits_used,
        override_credits_used: d.override_credits_used,
        paid_credits_used: d.paid_credits_used,
        free_credits_limit: r.free_credits_limit,
        additional_free_credits: r.additional_free_credits,
        paid_credits_balance: r.paid_credits_balance,
        cost_per_credit: r.cost_per_credit,
        amount_due: r.cost_per_credit * Decimal::from(unpaid),
        override_reason,
    };

    (
        !d.requires_payment,
        status,
        detailed,
        payment_type,
        last_updated,
        StatusDetails::CreditBased(details),
    )
}

/// Combine the previously persisted projection with a fresh computation.
///
/// A previous trial code (`trial_period`, `unpaid_before_start_date`) is kept
/// when the fresh result is a bare `unpaid` produced without enrollment
/// timing. Anything more specific replaces it.
pub fn merge(
    previous: Option<&EnrollmentPaymentStatus>,
    computed: EnrollmentPaymentStatus,
) -> EnrollmentPaymentStatus {
    let Some(prev) = previous else {
        return computed;
    };

    let bare_unpaid = computed.detailed_status == DetailedStatus::Unpaid
        && matches!(&computed.details, StatusDetails::PerCourse(d) if !d.timing_available);

    if bare_unpaid && prev.detailed_status.is_sticky() && prev.course_id == computed.course_id {
        log::debug!(
            "student={} year={} course={} projector: keeping {} over bare unpaid",
            computed.student_key, computed.school_year, computed.course_id, prev.detailed_status
        );
        // Only the trial code and its end date carry over. The rest of the
        // details reflect this pass.
        let mut details = computed.details;
        if let (StatusDetails::PerCourse(fresh), StatusDetails::PerCourse(old)) =
            (&mut details, &prev.details)
        {
            fresh.trial_ends_at = old.trial_ends_at;
        }
        return EnrollmentPaymentStatus {
            detailed_status: prev.detailed_status,
            last_updated: prev.last_updated,
            details,
            ..computed
        };
    }

    computed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::PaymentHandle;
    use crate::status::PerCourseDetails;
    use chrono::TimeZone;

    fn key() -> ProjectionKey {
        ProjectionKey {
            student_key: "s1".into(),
            school_year: SchoolYear::starting(2025),
            course_id: 2,
            student_type: "adultStudent".into(),
        }
    }

    fn per_course(detailed: DetailedStatus, timing_available: bool) -> EnrollmentPaymentStatus {
        let result = PerCourseResult {
            is_paid: false,
            status: PaymentStatus::RequiresPayment,
            detailed_status: detailed,
            payment_type: None,
            last_updated: None,
            details: PerCourseDetails {
                payment_handle: None,
                processor_status: Some(DetailedStatus::NoPayment),
                succeeded_charges: None,
                required_charges: 3,
                trial_ends_at: None,
                scheduled_start: None,
                timing_available,
                override_reason: None,
                carried_over_from: None,
                degraded: false,
            },
        };
        project(&key(), &EnrollmentResult::PerCourse(result))
    }

    fn credit(decision: CreditDecision) -> EnrollmentPaymentStatus {
        project(
            &key(),
            &EnrollmentResult::CreditBased(CreditBasedResult {
                decision,
                free_credits_limit: Some(10),
                additional_free_credits: 0,
                paid_credits_balance: 0,
                cost_per_credit: Decimal::new(10000, 2),
                credit_override_reason: None,
                credit_override_at: None,
                manual_override: None,
            }),
        )
    }

    fn decision(unlock: u32, paid: u32, over: u32) -> CreditDecision {
        CreditDecision {
            course_id: 2,
            credits: 5,
            exempt: false,
            requires_payment: unlock > 0,
            credits_required_to_unlock: unlock,
            base_free_credits_used: 5 - unlock - paid - over,
            override_credits_used: over,
            paid_credits_used: paid,
        }
    }

    #[test]
    fn credit_statuses_follow_the_credit_split() {
        assert_eq!(credit(decision(0, 0, 0)).detailed_status, DetailedStatus::CreditFree);
        assert_eq!(credit(decision(2, 3, 0)).detailed_status, DetailedStatus::CreditPartial);
        assert_eq!(
            credit(decision(5, 0, 0)).detailed_status,
            DetailedStatus::CreditRequiresPayment
        );
        assert_eq!(credit(decision(0, 5, 0)).detailed_status, DetailedStatus::CreditPaid);
        assert_eq!(credit(decision(0, 0, 2)).detailed_status, DetailedStatus::CreditOverride);
    }

    #[test]
    fn amount_due_is_unpaid_credits_times_cost() {
        let projected = credit(decision(3, 0, 0));
        match projected.details {
            StatusDetails::CreditBased(d) => assert_eq!(d.amount_due, Decimal::new(30000, 2)),
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn exempt_is_always_free() {
        let mut d = decision(0, 0, 0);
        d.exempt = true;
        let projected = credit(d);
        assert_eq!(projected.status, PaymentStatus::Free);
        assert_eq!(projected.detailed_status, DetailedStatus::Exempt);
    }

    #[test]
    fn sticky_trial_survives_a_rerun_without_timing() {
        let previous = per_course(DetailedStatus::TrialPeriod, true);
        let merged = merge(Some(&previous), per_course(DetailedStatus::Unpaid, false));
        assert_eq!(merged.detailed_status, DetailedStatus::TrialPeriod);

        // Merging again with the merged output is a fixed point.
        let again = merge(Some(&merged), per_course(DetailedStatus::Unpaid, false));
        assert_eq!(
            serde_json::to_string(&again).unwrap(),
            serde_json::to_string(&merged).unwrap()
        );
    }

    #[test]
    fn sticky_trial_keeps_fresh_processor_details() {
        let mut previous = per_course(DetailedStatus::TrialPeriod, true);
        let trial_end = chrono::Utc.with_ymd_and_hms(2025, 9, 15, 0, 0, 0).unwrap();
        if let StatusDetails::PerCourse(d) = &mut previous.details {
            d.trial_ends_at = Some(trial_end);
        }
        let mut computed = per_course(DetailedStatus::Unpaid, false);
        if let StatusDetails::PerCourse(d) = &mut computed.details {
            d.degraded = true;
            d.processor_status = Some(DetailedStatus::Unpaid);
            d.payment_handle = Some(PaymentHandle::Subscription("sub_new".into()));
        }

        let merged = merge(Some(&previous), computed);
        assert_eq!(merged.detailed_status, DetailedStatus::TrialPeriod);
        match merged.details {
            StatusDetails::PerCourse(d) => {
                assert!(d.degraded);
                assert_eq!(d.processor_status, Some(DetailedStatus::Unpaid));
                assert_eq!(d.payment_handle, Some(PaymentHandle::Subscription("sub_new".into())));
                assert_eq!(d.trial_ends_at, Some(trial_end));
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn timed_unpaid_replaces_a_trial_code() {
        let previous = per_course(DetailedStatus::UnpaidBeforeStartDate, true);
        let merged = merge(Some(&previous), per_course(DetailedStatus::Unpaid, true));
        assert_eq!(merged.detailed_status, DetailedStatus::Unpaid);
    }

    #[test]
    fn authoritative_results_replace_a_trial_code() {
        let previous = per_course(DetailedStatus::TrialPeriod, true);
        let mut paid = per_course(DetailedStatus::Paid, false);
        paid.status = PaymentStatus::Paid;
        let merged = merge(Some(&previous), paid);
        assert_eq!(merged.detailed_status, DetailedStatus::Paid);
    }
}
