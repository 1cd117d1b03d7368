//! Seed file loading — upstream facts for demo and replay runs.
//!
//! The runner owns this: in production these rows are written by the
//! registration and payment systems, never by the engine.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use enrollment_billing_core::{
    config::BillingConfig,
    policy::PolicyContext,
    processor::PaymentHandle,
    store::{
        BillingStore, CourseOverrideRow, CreditLimitOverrideRow, EnrollmentRow, RegistrationRow,
        StudentRow,
    },
    types::{CourseId, SchoolYear},
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SeedFile {
    students: Vec<SeedStudent>,
    registrations: Vec<SeedRegistration>,
    enrollments: Vec<SeedEnrollment>,
    credit_limit_overrides: Vec<SeedCreditLimitOverride>,
    course_overrides: Vec<SeedCourseOverride>,
    paid_credits: Vec<SeedPaidCredits>,
}

#[derive(Debug, Deserialize)]
struct SeedStudent {
    student_key: String,
    #[serde(default)]
    birthday: Option<String>,
    #[serde(default)]
    family_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeedRegistration {
    student_key: String,
    school_year: SchoolYear,
    #[serde(default)]
    registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SeedEnrollment {
    student_key: String,
    school_year: SchoolYear,
    course_id: CourseId,
    student_type: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    scheduled_start: Option<NaiveDate>,
    #[serde(default)]
    payment_handle: Option<PaymentHandle>,
}

#[derive(Debug, Deserialize)]
struct SeedCreditLimitOverride {
    student_key: String,
    school_year: SchoolYear,
    student_type: String,
    additional_free_credits: u32,
    #[serde(default)]
    reason: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SeedCourseOverride {
    student_key: String,
    school_year: SchoolYear,
    student_type: String,
    course_id: CourseId,
    is_paid: bool,
    reason: String,
    created_by: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SeedPaidCredits {
    student_key: String,
    school_year: SchoolYear,
    student_type: String,
    credits: u32,
    payment_ref: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SeedCounts {
    pub students: usize,
    pub enrollments: usize,
    pub overrides: usize,
}

/// Load a seed file into the store in one transaction.
pub fn load(store: &BillingStore, config: &BillingConfig, path: &str) -> Result<SeedCounts> {
    let content =
        std::fs::read_to_string(path).map_err(|e| anyhow!("Cannot read {path}: {e}"))?;
    let seed: SeedFile =
        serde_json::from_str(&content).map_err(|e| anyhow!("Cannot parse {path}: {e}"))?;

    // Overrides and paid credits are keyed by canonical type key.
    let mut ctx = PolicyContext::new(config);

    let counts = store.in_transaction(|s| {
        for st in &seed.students {
            s.upsert_student(&StudentRow {
                student_key: st.student_key.clone(),
                birthday: st.birthday.clone(),
                family_id: st.family_id.clone(),
            })?;
        }
        for r in &seed.registrations {
            s.upsert_registration(&RegistrationRow {
                student_key: r.student_key.clone(),
                school_year: r.school_year,
                registered_at: r.registered_at,
            })?;
        }
        for e in &seed.enrollments {
            s.upsert_enrollment(&EnrollmentRow {
                student_key: e.student_key.clone(),
                course_id: e.course_id,
                school_year: e.school_year,
                student_type: e.student_type.clone(),
                created_at: e.created_at,
                scheduled_start: e.scheduled_start,
                payment_handle: e.payment_handle.clone(),
            })?;
        }
        for o in &seed.credit_limit_overrides {
            s.set_credit_limit_override(&CreditLimitOverrideRow {
                student_key: o.student_key.clone(),
                school_year: o.school_year,
                student_type: ctx.resolve(&o.student_type).key,
                additional_free_credits: o.additional_free_credits,
                reason: o.reason.clone(),
                created_by: o.created_by.clone(),
                created_at: o.created_at,
            })?;
        }
        for o in &seed.course_overrides {
            s.set_course_override(&CourseOverrideRow {
                student_key: o.student_key.clone(),
                school_year: o.school_year,
                student_type: ctx.resolve(&o.student_type).key,
                course_id: o.course_id,
                is_paid: o.is_paid,
                reason: o.reason.clone(),
                created_by: o.created_by.clone(),
                created_at: o.created_at,
            })?;
        }
        for p in &seed.paid_credits {
            s.add_paid_credits(
                &p.student_key,
                p.school_year,
                &ctx.resolve(&p.student_type).key,
                p.credits,
                &p.payment_ref,
                p.created_at,
            )?;
        }
        Ok(SeedCounts {
            students: seed.students.len(),
            enrollments: seed.enrollments.len(),
            overrides: seed.credit_limit_overrides.len() + seed.course_overrides.len(),
        })
    })?;

    log::info!(
        "seed: loaded {} students, {} enrollments, {} overrides from {path}",
        counts.students,
        counts.enrollments,
        counts.overrides
    );
    Ok(counts)
}
