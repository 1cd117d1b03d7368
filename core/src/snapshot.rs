//! Input snapshot — every fact one recalculation reads, taken in a single
//! read transaction before anything is computed.
//!
//! Concurrent writers may land between two invocations, never inside one.

use crate::{
    course_payment::ProcessorStateUpdate,
    error::BillingResult,
    policy::ActiveOverrides,
    status::EnrollmentPaymentStatus,
    store::{BillingStore, EnrollmentRow, PriorPaymentRow},
    types::{CourseId, SchoolYear, StudentKey, TypeKey},
};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct InputSnapshot {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    /// All enrollments of the student in the year, by course id.
    pub enrollments: Vec<EnrollmentRow>,
    pub overrides: ActiveOverrides,
    pub paid_balances: HashMap<TypeKey, u32>,
    /// Currently persisted projections, the `previous` side of the merge.
    pub previous: HashMap<CourseId, EnrollmentPaymentStatus>,
    /// Earliest confirmed payment per course in an earlier year.
    pub prior_payments: HashMap<CourseId, PriorPaymentRow>,
    pub last_known: HashMap<CourseId, ProcessorStateUpdate>,
}

impl InputSnapshot {
    pub fn read(
        store: &BillingStore,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Self> {
        store.in_transaction(|s| {
            let enrollments = s.enrollments_for(student_key, school_year)?;
            let overrides = ActiveOverrides::from_rows(
                s.active_credit_limit_overrides(student_key, school_year)?,
                s.active_course_overrides(student_key, school_year)?,
            );
            let paid_balances = s.paid_credit_balances(student_key, school_year)?;
            let previous = s
                .projections_for(student_key, school_year)?
                .into_iter()
                .map(|p| (p.course_id, p))
                .collect();

            // Rows arrive earliest year first; keep the first per course.
            // Payments only carry forward.
            let mut prior_payments = HashMap::new();
            for p in s
                .prior_payments(student_key, school_year)?
                .into_iter()
                .filter(|p| p.school_year < school_year)
            {
                prior_payments.entry(p.course_id).or_insert(p);
            }

            let last_known = s
                .cached_processor_states(student_key, school_year)?
                .into_iter()
                .map(|u| (u.course_id, u))
                .collect();

            Ok(Self {
                student_key: student_key.to_string(),
                school_year,
                enrollments,
                overrides,
                paid_balances,
                previous,
                prior_payments,
                last_known,
            })
        })
    }

    pub fn paid_balance(&self, type_key: &str) -> u32 {
        self.paid_balances.get(type_key).copied().unwrap_or(0)
    }
}
