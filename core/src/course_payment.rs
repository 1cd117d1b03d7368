//! Per-course payment resolver — paid/unpaid decision for student types
//! billed per enrollment (adult, international).
//!
//! Resolution order, first match wins:
//!   1. Manual course override marked paid
//!   2. Cross-year carryover of a processor-confirmed payment
//!   3. External processor state for the enrollment's payment handle
//!   4. Trial window (only when nothing has been charged)
//!
//! The resolver never fails. A processor outage degrades to the last
//! persisted state for the enrollment and is flagged in the details.

use crate::{
    clock::regional_date,
    processor::{LifecycleState, PaymentHandle, PaymentProcessor, ProcessorState},
    status::{DetailedStatus, PaymentStatus, PaymentType, PerCourseDetails},
    store::{CourseOverrideRow, EnrollmentRow, PriorPaymentRow},
    types::{CourseId, SchoolYear, StudentKey},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCourseResult {
    pub is_paid: bool,
    pub status: PaymentStatus,
    pub detailed_status: DetailedStatus,
    pub payment_type: Option<PaymentType>,
    pub last_updated: Option<DateTime<Utc>>,
    pub details: PerCourseDetails,
}

/// Append `carried_year` to the carryover list of the original payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarryoverAppend {
    pub student_key: StudentKey,
    pub course_id: CourseId,
    pub original_year: SchoolYear,
    pub carried_year: SchoolYear,
}

/// What the processor said, in projection shape, so the write phase can
/// persist it without querying again. Also the "last known" fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStateUpdate {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    pub course_id: CourseId,
    pub is_paid: bool,
    pub status: PaymentStatus,
    pub detailed_status: DetailedStatus,
    pub payment_type: Option<PaymentType>,
    pub succeeded_charges: Option<u32>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseResolution {
    pub result: PerCourseResult,
    pub carryover: Option<CarryoverAppend>,
    pub state_update: Option<ProcessorStateUpdate>,
}

pub struct CourseInput<'a> {
    pub enrollment: &'a EnrollmentRow,
    /// Active override for this course, if any.
    pub course_override: Option<&'a CourseOverrideRow>,
    /// Earliest other school year with a confirmed payment for this course.
    pub prior_payment: Option<&'a PriorPaymentRow>,
    /// Last persisted processor state for this enrollment.
    pub last_known: Option<&'a ProcessorStateUpdate>,
}

/// Processor classification before trial rules.
struct ProcessorVerdict {
    is_paid: bool,
    status: PaymentStatus,
    detailed: DetailedStatus,
    payment_type: Option<PaymentType>,
    succeeded_charges: Option<u32>,
    last_updated: Option<DateTime<Utc>>,
}

impl ProcessorVerdict {
    fn no_payment(payment_type: Option<PaymentType>) -> Self {
        Self {
            is_paid: false,
            status: PaymentStatus::RequiresPayment,
            detailed: DetailedStatus::NoPayment,
            payment_type,
            succeeded_charges: None,
            last_updated: None,
        }
    }

    /// Nothing has been charged yet, so the trial window applies.
    fn uncharged(&self) -> bool {
        matches!(
            self.detailed,
            DetailedStatus::NoPayment | DetailedStatus::Incomplete
        )
    }
}

pub struct CoursePaymentResolver<'p> {
    processor: &'p dyn PaymentProcessor,
    now: DateTime<Utc>,
    trial_period_days: i64,
    required_charges: u32,
}

impl<'p> CoursePaymentResolver<'p> {
    pub fn new(
        processor: &'p dyn PaymentProcessor,
        now: DateTime<Utc>,
        trial_period_days: i64,
        required_charges: u32,
    ) -> Self {
        Self {
            processor,
            now,
            trial_period_days,
            required_charges,
        }
    }

    pub fn resolve(&self, input: &CourseInput<'_>) -> CourseResolution {
        let e = input.enrollment;
        let mut details = PerCourseDetails {
            payment_handle: e.payment_handle.clone(),
            processor_status: None,
            succeeded_charges: None,
            required_charges: self.required_charges,
            trial_ends_at: None,
            scheduled_start: e.scheduled_start,
            timing_available: e.created_at.is_some(),
            override_reason: None,
            carried_over_from: None,
            degraded: false,
        };

        // 1. Manual override
        if let Some(o) = input.course_override.filter(|o| o.is_paid) {
            details.override_reason = Some(o.reason.clone());
            return CourseResolution {
                result: PerCourseResult {
                    is_paid: true,
                    status: PaymentStatus::Override,
                    detailed_status: DetailedStatus::ManualOverride,
                    payment_type: Some(PaymentType::Manual),
                    last_updated: Some(o.created_at),
                    details,
                },
                carryover: None,
                state_update: None,
            };
        }

        // 2. Cross-year carryover
        if let Some(prior) = input
            .prior_payment
            .filter(|p| p.school_year != e.school_year && p.course_id == e.course_id)
        {
            details.carried_over_from = Some(prior.school_year);
            return CourseResolution {
                result: PerCourseResult {
                    is_paid: true,
                    status: PaymentStatus::CarriedOver,
                    detailed_status: DetailedStatus::CarriedOver,
                    payment_type: Some(PaymentType::Carryover),
                    last_updated: prior.last_updated,
                    details,
                },
                carryover: Some(CarryoverAppend {
                    student_key: e.student_key.clone(),
                    course_id: e.course_id,
                    original_year: prior.school_year,
                    carried_year: e.school_year,
                }),
                state_update: None,
            };
        }

        // 3. External processor
        let (verdict, state_update) = match &e.payment_handle {
            None => (ProcessorVerdict::no_payment(None), None),
            Some(handle) => match self.processor.payment_state(handle) {
                Ok(state) => {
                    let verdict = self.classify(handle, state.as_ref());
                    let update = ProcessorStateUpdate {
                        student_key: e.student_key.clone(),
                        school_year: e.school_year,
                        course_id: e.course_id,
                        is_paid: verdict.is_paid,
                        status: verdict.status,
                        detailed_status: verdict.detailed,
                        payment_type: verdict.payment_type,
                        succeeded_charges: verdict.succeeded_charges,
                        last_updated: verdict.last_updated,
                    };
                    (verdict, Some(update))
                }
                Err(err) => {
                    log::warn!(
                        "student={} year={} course={} resolver: processor unavailable, using last known state: {err}",
                        e.student_key, e.school_year, e.course_id
                    );
                    details.degraded = true;
                    let verdict = match input.last_known {
                        Some(known) => ProcessorVerdict {
                            is_paid: known.is_paid,
                            status: known.status,
                            detailed: known.detailed_status,
                            payment_type: known.payment_type,
                            succeeded_charges: known.succeeded_charges,
                            last_updated: known.last_updated,
                        },
                        None => ProcessorVerdict::no_payment(Some(payment_type_of(handle))),
                    };
                    (verdict, None)
                }
            },
        };

        details.processor_status = Some(verdict.detailed);
        details.succeeded_charges = verdict.succeeded_charges;

        if !verdict.uncharged() {
            return CourseResolution {
                result: PerCourseResult {
                    is_paid: verdict.is_paid,
                    status: verdict.status,
                    detailed_status: verdict.detailed,
                    payment_type: verdict.payment_type,
                    last_updated: verdict.last_updated,
                    details,
                },
                carryover: None,
                state_update,
            };
        }

        // 4. Trial window
        let detailed = match e.created_at {
            Some(created_at) => {
                let trial_end = created_at + Duration::days(self.trial_period_days);
                details.trial_ends_at = Some(trial_end);
                if self.now <= trial_end {
                    DetailedStatus::TrialPeriod
                } else if e
                    .scheduled_start
                    .is_some_and(|start| regional_date(self.now) < start)
                {
                    DetailedStatus::UnpaidBeforeStartDate
                } else {
                    DetailedStatus::Unpaid
                }
            }
            None => DetailedStatus::Unpaid,
        };

        CourseResolution {
            result: PerCourseResult {
                is_paid: false,
                status: PaymentStatus::RequiresPayment,
                detailed_status: detailed,
                payment_type: verdict.payment_type,
                last_updated: verdict.last_updated,
                details,
            },
            carryover: None,
            state_update,
        }
    }

    fn classify(&self, handle: &PaymentHandle, state: Option<&ProcessorState>) -> ProcessorVerdict {
        let payment_type = Some(payment_type_of(handle));
        let Some(state) = state else {
            return ProcessorVerdict::no_payment(payment_type);
        };
        let last_updated = state.latest_charge();

        match state {
            ProcessorState::Subscription {
                succeeded_charge_count: n,
                lifecycle_state,
                ..
            } => {
                let n = *n;
                if n >= self.required_charges {
                    ProcessorVerdict {
                        is_paid: true,
                        status: PaymentStatus::Paid,
                        detailed: DetailedStatus::Paid,
                        payment_type,
                        succeeded_charges: Some(n),
                        last_updated,
                    }
                } else if n == 0 {
                    let detailed = match lifecycle_state {
                        LifecycleState::Incomplete | LifecycleState::IncompleteExpired => {
                            DetailedStatus::Incomplete
                        }
                        _ => DetailedStatus::NoPayment,
                    };
                    ProcessorVerdict {
                        detailed,
                        succeeded_charges: Some(0),
                        last_updated,
                        ..ProcessorVerdict::no_payment(payment_type)
                    }
                } else {
                    let detailed = match lifecycle_state {
                        LifecycleState::Active | LifecycleState::Trialing => DetailedStatus::Active,
                        LifecycleState::Canceled | LifecycleState::IncompleteExpired => {
                            DetailedStatus::CanceledPartial(n)
                        }
                        LifecycleState::PastDue
                        | LifecycleState::Unpaid
                        | LifecycleState::Incomplete => DetailedStatus::PastDue,
                    };
                    ProcessorVerdict {
                        is_paid: false,
                        status: PaymentStatus::Partial,
                        detailed,
                        payment_type,
                        succeeded_charges: Some(n),
                        last_updated,
                    }
                }
            }
            ProcessorState::OneTime { succeeded: true, .. } => ProcessorVerdict {
                is_paid: true,
                status: PaymentStatus::Paid,
                detailed: DetailedStatus::Paid,
                payment_type,
                succeeded_charges: Some(1),
                last_updated,
            },
            ProcessorState::OneTime { succeeded: false, .. } => ProcessorVerdict {
                succeeded_charges: Some(0),
                last_updated,
                ..ProcessorVerdict::no_payment(payment_type)
            },
        }
    }
}

fn payment_type_of(handle: &PaymentHandle) -> PaymentType {
    match handle {
        PaymentHandle::Subscription(_) => PaymentType::Subscription,
        PaymentHandle::OneTime(_) => PaymentType::OneTime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{NoProcessor, RecordedProcessor};
    use chrono::{NaiveDate, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 20, 18, 0, 0).unwrap()
    }

    fn enrollment(handle: Option<PaymentHandle>) -> EnrollmentRow {
        EnrollmentRow {
            student_key: "kyle,example,com".into(),
            course_id: 2,
            school_year: SchoolYear::starting(2025),
            student_type: "Adult Student".into(),
            created_at: Some(now() - Duration::days(5)),
            scheduled_start: NaiveDate::from_ymd_opt(2025, 10, 10),
            payment_handle: handle,
        }
    }

    fn input(e: &EnrollmentRow) -> CourseInput<'_> {
        CourseInput {
            enrollment: e,
            course_override: None,
            prior_payment: None,
            last_known: None,
        }
    }

    fn subscription(n: u32, lifecycle: LifecycleState) -> ProcessorState {
        ProcessorState::Subscription {
            succeeded_charge_count: n,
            lifecycle_state: lifecycle,
            last_charge_timestamps: vec![],
        }
    }

    #[test]
    fn manual_override_wins_over_everything() {
        let e = enrollment(Some(PaymentHandle::Subscription("sub_1".into())));
        let o = CourseOverrideRow {
            student_key: e.student_key.clone(),
            school_year: e.school_year,
            student_type: "adultStudent".into(),
            course_id: 2,
            is_paid: true,
            reason: "bursary".into(),
            created_by: "registrar".into(),
            created_at: now() - Duration::days(1),
        };
        let resolver = CoursePaymentResolver::new(&NoProcessor, now(), 10, 3);
        let out = resolver.resolve(&CourseInput {
            course_override: Some(&o),
            ..input(&e)
        });
        assert_eq!(out.result.detailed_status, DetailedStatus::ManualOverride);
        assert!(out.result.is_paid);
        assert!(out.state_update.is_none());
    }

    #[test]
    fn subscription_needs_all_charges() {
        let processor = RecordedProcessor::new();
        let e = enrollment(Some(PaymentHandle::Subscription("sub_1".into())));
        let resolver = CoursePaymentResolver::new(&processor, now(), 10, 3);

        processor.record("sub_1", subscription(3, LifecycleState::Active));
        assert_eq!(resolver.resolve(&input(&e)).result.detailed_status, DetailedStatus::Paid);

        processor.record("sub_1", subscription(2, LifecycleState::Active));
        let out = resolver.resolve(&input(&e));
        assert_eq!(out.result.status, PaymentStatus::Partial);
        assert_eq!(out.result.detailed_status, DetailedStatus::Active);

        processor.record("sub_1", subscription(1, LifecycleState::PastDue));
        assert_eq!(resolver.resolve(&input(&e)).result.detailed_status, DetailedStatus::PastDue);

        processor.record("sub_1", subscription(2, LifecycleState::Canceled));
        assert_eq!(
            resolver.resolve(&input(&e)).result.detailed_status,
            DetailedStatus::CanceledPartial(2)
        );
    }

    #[test]
    fn uncharged_subscription_falls_into_trial_rules() {
        let processor = RecordedProcessor::new();
        processor.record("sub_1", subscription(0, LifecycleState::Incomplete));
        let e = enrollment(Some(PaymentHandle::Subscription("sub_1".into())));
        let out = CoursePaymentResolver::new(&processor, now(), 10, 3).resolve(&input(&e));

        assert_eq!(out.result.detailed_status, DetailedStatus::TrialPeriod);
        assert_eq!(out.result.details.processor_status, Some(DetailedStatus::Incomplete));
        assert_eq!(
            out.state_update.map(|u| u.detailed_status),
            Some(DetailedStatus::Incomplete)
        );
    }

    #[test]
    fn one_time_charge_is_paid_iff_succeeded() {
        let processor = RecordedProcessor::new();
        let e = enrollment(Some(PaymentHandle::OneTime("pi_1".into())));
        let resolver = CoursePaymentResolver::new(&processor, now(), 10, 3);

        processor.record("pi_1", ProcessorState::OneTime { succeeded: true, charged_at: None });
        assert!(resolver.resolve(&input(&e)).result.is_paid);

        processor.record("pi_1", ProcessorState::OneTime { succeeded: false, charged_at: None });
        assert!(!resolver.resolve(&input(&e)).result.is_paid);
    }

    #[test]
    fn unknown_handle_is_no_payment_not_an_error() {
        let processor = RecordedProcessor::new();
        let e = enrollment(Some(PaymentHandle::OneTime("pi_missing".into())));
        let out = CoursePaymentResolver::new(&processor, now(), 10, 3).resolve(&input(&e));
        assert_eq!(out.result.details.processor_status, Some(DetailedStatus::NoPayment));
        assert!(!out.result.details.degraded);
    }

    #[test]
    fn trial_then_before_start_then_unpaid() {
        let e = enrollment(None);
        let created = e.created_at.unwrap();

        let at = |days: i64| {
            CoursePaymentResolver::new(&NoProcessor, created + Duration::days(days), 10, 3)
                .resolve(&input(&e))
                .result
                .detailed_status
        };
        assert_eq!(at(5), DetailedStatus::TrialPeriod);
        assert_eq!(at(10), DetailedStatus::TrialPeriod);
        assert_eq!(at(12), DetailedStatus::UnpaidBeforeStartDate);
        assert_eq!(at(40), DetailedStatus::Unpaid);
    }

    #[test]
    fn outage_falls_back_to_last_known_state() {
        let processor = RecordedProcessor::new();
        processor.set_offline(true);
        let e = enrollment(Some(PaymentHandle::Subscription("sub_1".into())));
        let known = ProcessorStateUpdate {
            student_key: e.student_key.clone(),
            school_year: e.school_year,
            course_id: e.course_id,
            is_paid: true,
            status: PaymentStatus::Paid,
            detailed_status: DetailedStatus::Paid,
            payment_type: Some(PaymentType::Subscription),
            succeeded_charges: Some(3),
            last_updated: None,
        };
        let out = CoursePaymentResolver::new(&processor, now(), 10, 3).resolve(&CourseInput {
            last_known: Some(&known),
            ..input(&e)
        });
        assert!(out.result.is_paid);
        assert!(out.result.details.degraded);
        assert!(out.state_update.is_none());
    }
}
