//! Failure handling: timeouts, invalid input and rollback.
//!
//! Test list:
//!   1. A slow processor times the invocation out and nothing is written
//!   2. The failure is audited outside the rolled-back transaction
//!   3. Malformed trigger input fails before the engine runs
//!   4. Unparseable birthday is invalid input and leaves the entry alone
//!   5. A failed rerun keeps the previous projections intact

use chrono::{DateTime, TimeZone, Utc};
use enrollment_billing_core::{
    clock::FixedClock,
    command::RecalcCommand,
    config::BillingConfig,
    engine::{RecalcEngine, RecalcKey},
    error::{BillingError, BillingResult},
    processor::{PaymentHandle, PaymentProcessor, ProcessorState},
    status::DetailedStatus,
    store::{BillingStore, EnrollmentRow, RegistrationRow, StudentRow},
    types::SchoolYear,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Test helpers ────────────────────────────────────────────────────────────

const STUDENT: &str = "kyle,example,com";

/// Answers "no record" after a configurable delay.
#[derive(Default)]
struct SlowProcessor {
    delay_ms: AtomicU64,
}

impl PaymentProcessor for SlowProcessor {
    fn payment_state(&self, _handle: &PaymentHandle) -> BillingResult<Option<ProcessorState>> {
        std::thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
        Ok(None)
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 5, 18, 0, 0).unwrap()
}

fn year() -> SchoolYear {
    SchoolYear::starting(2025)
}

fn build(processor: Arc<SlowProcessor>, timeout_ms: u64) -> RecalcEngine {
    let mut config = BillingConfig::default_test();
    config.recalc.timeout_ms = timeout_ms;
    let store = BillingStore::in_memory().unwrap();
    store.migrate().unwrap();
    let engine = RecalcEngine::new(config, store, processor, Arc::new(FixedClock(now()))).unwrap();

    engine
        .store()
        .upsert_enrollment(&EnrollmentRow {
            student_key: STUDENT.into(),
            course_id: 2,
            school_year: year(),
            student_type: "Adult Student".into(),
            created_at: Some(Utc.with_ymd_and_hms(2025, 9, 1, 16, 0, 0).unwrap()),
            scheduled_start: None,
            payment_handle: Some(PaymentHandle::Subscription("sub_slow".into())),
        })
        .unwrap();
    engine
}

fn key() -> RecalcKey {
    RecalcKey::new(STUDENT, year(), None).unwrap()
}

// ── Test 1 ──────────────────────────────────────────────────────────────────

#[test]
fn slow_processor_times_out_and_writes_nothing() {
    let processor = Arc::new(SlowProcessor::default());
    processor.delay_ms.store(200, Ordering::SeqCst);
    let engine = build(Arc::clone(&processor), 50);

    let err = engine.recalculate(&key()).unwrap_err();
    assert!(
        matches!(err, BillingError::Timeout { phase: "computing", .. }),
        "expected a computing-phase timeout, got {err:?}"
    );
    assert!(engine.projections(STUDENT, year()).unwrap().is_empty());
    assert!(engine
        .store()
        .cached_processor_states(STUDENT, year())
        .unwrap()
        .is_empty());
}

// ── Test 2 ──────────────────────────────────────────────────────────────────

#[test]
fn failure_is_audited_outside_the_rollback() {
    let processor = Arc::new(SlowProcessor::default());
    processor.delay_ms.store(200, Ordering::SeqCst);
    let engine = build(Arc::clone(&processor), 50);

    engine.recalculate(&key()).unwrap_err();

    let log = engine.store().recalc_log_for(&key().to_string()).unwrap();
    let types: Vec<&str> = log.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["invocation_failed"]);
    assert!(log[0].payload.contains("\"computing\""));
}

// ── Test 3 ──────────────────────────────────────────────────────────────────

#[test]
fn malformed_trigger_input_fails_fast() {
    assert!(matches!(
        RecalcKey::parse(STUDENT, "2025-2026", None),
        Err(BillingError::InvalidInput { field: "school_year", .. })
    ));
    assert!(matches!(
        RecalcKey::parse("   ", "25/26", None),
        Err(BillingError::InvalidInput { field: "student_key", .. })
    ));

    let engine = build(Arc::new(SlowProcessor::default()), 5_000);
    let err = RecalcCommand::Recalculate {
        student_key: STUDENT.into(),
        school_year: "25-26".into(),
        student_type: None,
    }
    .execute(&engine)
    .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput { .. }));
    assert!(engine.projections(STUDENT, year()).unwrap().is_empty());
}

// ── Test 4 ──────────────────────────────────────────────────────────────────

#[test]
fn unparseable_birthday_is_invalid_input() {
    let engine = build(Arc::new(SlowProcessor::default()), 5_000);
    engine
        .store()
        .upsert_student(&StudentRow {
            student_key: STUDENT.into(),
            birthday: Some("03/14/2009".into()),
            family_id: None,
        })
        .unwrap();
    engine
        .store()
        .upsert_registration(&RegistrationRow {
            student_key: STUDENT.into(),
            school_year: year(),
            registered_at: Some(now()),
        })
        .unwrap();

    let err = engine.recalculate_funding(STUDENT, year()).unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput { field: "birthday", .. }));
    assert!(engine.funding_entry(STUDENT, year()).unwrap().is_none());
}

// ── Test 5 ──────────────────────────────────────────────────────────────────

#[test]
fn failed_rerun_keeps_previous_projections() {
    let processor = Arc::new(SlowProcessor::default());
    let engine = build(Arc::clone(&processor), 50);
    engine.recalculate(&key()).unwrap();
    let before = engine.projections(STUDENT, year()).unwrap();
    assert_eq!(before[0].detailed_status, DetailedStatus::TrialPeriod);

    processor.delay_ms.store(200, Ordering::SeqCst);
    engine.store().delete_enrollment(STUDENT, year(), 2).unwrap();
    engine
        .store()
        .upsert_enrollment(&EnrollmentRow {
            student_key: STUDENT.into(),
            course_id: 3,
            school_year: year(),
            student_type: "Adult Student".into(),
            created_at: None,
            scheduled_start: None,
            payment_handle: Some(PaymentHandle::Subscription("sub_slow_2".into())),
        })
        .unwrap();
    engine.recalculate(&key()).unwrap_err();

    assert_eq!(engine.projections(STUDENT, year()).unwrap(), before);
}
