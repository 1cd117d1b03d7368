//! The recalculation engine — orchestrates one invocation end to end.
//!
//! STATE MACHINE (per invocation, never reordered):
//!   Gathering → Computing → Writing → Done
//!   Failed is reachable from every state.
//!
//! RULES:
//!   - All inputs come from one read transaction (InputSnapshot).
//!   - All derived writes of an invocation go through one write transaction.
//!   - The deadline is checked at every I/O boundary. A timeout fails the
//!     invocation before anything is committed.
//!   - Paid-credit balances and upstream facts are never written here.
//!   - Reruns always recompute in full; nothing is patched incrementally.

use crate::{
    clock::{regional_date, Clock, SystemClock},
    config::BillingConfig,
    course_payment::{CarryoverAppend, CourseInput, CoursePaymentResolver, ProcessorStateUpdate},
    entitlement::{self, CreditAllowance, CreditDecision, CreditLine, EntitlementSummary},
    error::{BillingError, BillingResult},
    event::{RecalcEvent, RecalcLogEntry},
    funding::{self, parse_birthday, FundingEntry, FundingRates},
    policy::{BillingModel, PolicyContext, ResolvedPolicy},
    processor::PaymentProcessor,
    projector::{merge, project, CreditBasedResult, EnrollmentResult, ManualOverride, ProjectionKey},
    proration::{self, allocate, carry_upgrade, ProrationWindow, UpgradeOutcome},
    snapshot::InputSnapshot,
    status::EnrollmentPaymentStatus,
    store::{BillingStore, EnrollmentRow},
    types::{CourseId, SchoolYear, StudentKey, TypeKey},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalcPhase {
    Gathering,
    Computing,
    Writing,
    Done,
    Failed,
}

impl RecalcPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecalcPhase::Gathering => "gathering",
            RecalcPhase::Computing => "computing",
            RecalcPhase::Writing => "writing",
            RecalcPhase::Done => "done",
            RecalcPhase::Failed => "failed",
        }
    }
}

/// What one `recalculate` call covers: a student in a school year,
/// optionally narrowed to one student type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecalcKey {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    /// Student-type label. `None` recomputes every type the student holds.
    pub student_type: Option<String>,
}

impl RecalcKey {
    pub fn new(
        student_key: &str,
        school_year: SchoolYear,
        student_type: Option<&str>,
    ) -> BillingResult<Self> {
        Ok(Self {
            student_key: validate_student_key(student_key)?,
            school_year,
            student_type: student_type
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from),
        })
    }

    /// Build from raw trigger input, failing fast on a malformed year.
    pub fn parse(student_key: &str, school_year: &str, student_type: Option<&str>) -> BillingResult<Self> {
        Self::new(student_key, SchoolYear::parse(school_year)?, student_type)
    }
}

impl fmt::Display for RecalcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.student_key, self.school_year)?;
        if let Some(t) = &self.student_type {
            write!(f, ":{t}")?;
        }
        Ok(())
    }
}

fn validate_student_key(raw: &str) -> BillingResult<StudentKey> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(BillingError::invalid("student_key", "must not be empty"));
    }
    Ok(key.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct RecalcOutcome {
    pub invocation_id: String,
    pub key: RecalcKey,
    /// Projections as written, by course id.
    pub written: Vec<EnrollmentPaymentStatus>,
    /// Courses whose projection was removed because the enrollment is gone.
    pub removed: Vec<CourseId>,
    pub carryovers_appended: usize,
    /// Courses resolved from the last known processor state.
    pub degraded: Vec<CourseId>,
    /// Credit totals per credit-based student type.
    pub entitlements: BTreeMap<TypeKey, EntitlementSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub student_key: StudentKey,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub school_year: SchoolYear,
    pub students: usize,
    pub succeeded: usize,
    pub projections_written: usize,
    pub funding_written: usize,
    pub failures: Vec<SweepFailure>,
}

// ── Invocation bookkeeping ────────────────────────────────────────

struct Invocation {
    id: String,
    kind: &'static str,
    key: String,
    started: Instant,
    budget: Duration,
    now: DateTime<Utc>,
    phase: RecalcPhase,
    events: Vec<RecalcEvent>,
}

impl Invocation {
    fn enter(&mut self, phase: RecalcPhase) {
        log::debug!("key={} {}: entering {}", self.key, self.kind, phase.as_str());
        self.phase = phase;
        self.events.push(RecalcEvent::PhaseEntered {
            key: self.key.clone(),
            phase,
        });
    }

    fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Deadline check. Called at every I/O boundary.
    fn check(&self) -> BillingResult<()> {
        if self.started.elapsed() >= self.budget {
            return Err(BillingError::Timeout {
                key: self.key.clone(),
                phase: self.phase.as_str(),
                elapsed_ms: self.elapsed_ms(),
            });
        }
        Ok(())
    }

    fn log_entry(&self, event: &RecalcEvent) -> serde_json::Result<RecalcLogEntry> {
        RecalcLogEntry::new(&self.id, self.kind, &self.key, event, self.now)
    }

    /// Persist collected events. Runs inside the write transaction.
    fn commit_log(&mut self, store: &BillingStore, written: usize) -> BillingResult<()> {
        self.enter(RecalcPhase::Done);
        self.events.push(RecalcEvent::InvocationCompleted {
            key: self.key.clone(),
            written,
            elapsed_ms: self.elapsed_ms(),
        });
        for event in &self.events {
            store.append_recalc_log(&self.log_entry(event)?)?;
        }
        Ok(())
    }
}

// ── Computation batch ─────────────────────────────────────────────

#[derive(Default)]
struct ComputedBatch {
    written: Vec<EnrollmentPaymentStatus>,
    removed: Vec<CourseId>,
    carryovers: Vec<CarryoverAppend>,
    state_updates: Vec<ProcessorStateUpdate>,
    degraded: Vec<CourseId>,
    entitlements: BTreeMap<TypeKey, EntitlementSummary>,
}

// ── Engine ────────────────────────────────────────────────────────

pub struct RecalcEngine {
    config: Arc<BillingConfig>,
    store: BillingStore,
    processor: Arc<dyn PaymentProcessor>,
    clock: Arc<dyn Clock>,
    window: ProrationWindow,
}

impl RecalcEngine {
    pub fn new(
        config: BillingConfig,
        store: BillingStore,
        processor: Arc<dyn PaymentProcessor>,
        clock: Arc<dyn Clock>,
    ) -> BillingResult<Self> {
        config.validate()?;
        let window = ProrationWindow::from_config(&config.funding.proration)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            processor,
            clock,
            window,
        })
    }

    /// Build an engine over a migrated store with the system clock.
    pub fn build(
        config: BillingConfig,
        store: BillingStore,
        processor: Arc<dyn PaymentProcessor>,
    ) -> BillingResult<Self> {
        store.migrate()?;
        Self::new(config, store, processor, Arc::new(SystemClock))
    }

    /// In-memory engine with the test config, pinned to `now`.
    pub fn build_test(
        processor: Arc<dyn PaymentProcessor>,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        let store = BillingStore::in_memory()?;
        store.migrate()?;
        Self::new(
            BillingConfig::default_test(),
            store,
            processor,
            Arc::new(crate::clock::FixedClock(now)),
        )
    }

    /// Same engine, different clock. Store and processor are kept.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    pub fn store(&self) -> &BillingStore {
        &self.store
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Engine sharing config, processor and clock, on its own connection.
    fn worker(&self) -> BillingResult<Self> {
        Ok(Self {
            config: Arc::clone(&self.config),
            store: self.store.reopen()?,
            processor: Arc::clone(&self.processor),
            clock: Arc::clone(&self.clock),
            window: self.window,
        })
    }

    fn begin(&self, kind: &'static str, key: String) -> Invocation {
        Invocation {
            id: Uuid::new_v4().to_string(),
            kind,
            key,
            started: Instant::now(),
            budget: Duration::from_millis(self.config.recalc.timeout_ms),
            now: self.clock.now(),
            phase: RecalcPhase::Gathering,
            events: Vec::new(),
        }
    }

    /// Record the failure outside the rolled-back transaction and hand the
    /// error back.
    fn fail(&self, inv: &mut Invocation, err: BillingError) -> BillingError {
        log::error!(
            "key={} {}: failed during {}: {err}",
            inv.key,
            inv.kind,
            inv.phase.as_str()
        );
        let event = RecalcEvent::InvocationFailed {
            key: inv.key.clone(),
            phase: inv.phase,
            reason: err.to_string(),
        };
        inv.phase = RecalcPhase::Failed;
        let logged = inv
            .log_entry(&event)
            .map_err(BillingError::from)
            .and_then(|entry| self.store.append_recalc_log(&entry));
        if let Err(log_err) = logged {
            log::warn!("key={} {}: could not record failure: {log_err}", inv.key, inv.kind);
        }
        err
    }

    // ── Billing ────────────────────────────────────────────────

    /// Recompute and persist payment projections for one key.
    pub fn recalculate(&self, key: &RecalcKey) -> BillingResult<RecalcOutcome> {
        let mut inv = self.begin("recalculate", key.to_string());
        match self.run_recalculate(&mut inv, key) {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(&mut inv, err)),
        }
    }

    fn run_recalculate(&self, inv: &mut Invocation, key: &RecalcKey) -> BillingResult<RecalcOutcome> {
        inv.enter(RecalcPhase::Gathering);
        let snapshot = InputSnapshot::read(&self.store, &key.student_key, key.school_year)?;
        inv.check()?;

        inv.enter(RecalcPhase::Computing);
        let batch = self.compute(inv, key, &snapshot)?;

        inv.enter(RecalcPhase::Writing);
        inv.check()?;
        let carryovers_appended = self.store.in_write_transaction(|s| {
            for course_id in &batch.removed {
                s.delete_projection(&key.student_key, key.school_year, *course_id)?;
                inv.events.push(RecalcEvent::ProjectionRemoved {
                    student_key: key.student_key.clone(),
                    school_year: key.school_year,
                    course_id: *course_id,
                });
            }
            for p in &batch.written {
                s.upsert_projection(p)?;
                inv.events.push(RecalcEvent::ProjectionWritten {
                    student_key: p.student_key.clone(),
                    school_year: p.school_year,
                    course_id: p.course_id,
                    detailed_status: p.detailed_status,
                });
            }
            let mut appended = 0;
            for c in &batch.carryovers {
                if s.append_carryover(c)? {
                    appended += 1;
                    inv.events.push(RecalcEvent::CarryoverAppended {
                        student_key: c.student_key.clone(),
                        course_id: c.course_id,
                        original_year: c.original_year,
                        carried_year: c.carried_year,
                    });
                }
            }
            for u in &batch.state_updates {
                s.upsert_processor_state(u)?;
            }
            for course_id in &batch.degraded {
                inv.events.push(RecalcEvent::ProcessorDegraded {
                    student_key: key.student_key.clone(),
                    school_year: key.school_year,
                    course_id: *course_id,
                });
            }
            // Last boundary before commit.
            inv.check()?;
            inv.commit_log(s, batch.written.len())?;
            Ok(appended)
        })?;

        log::info!(
            "key={key} recalculate: wrote {} projections, removed {}, carryovers {}, degraded {} in {}ms",
            batch.written.len(),
            batch.removed.len(),
            carryovers_appended,
            batch.degraded.len(),
            inv.elapsed_ms()
        );

        Ok(RecalcOutcome {
            invocation_id: inv.id.clone(),
            key: key.clone(),
            written: batch.written,
            removed: batch.removed,
            carryovers_appended,
            degraded: batch.degraded,
            entitlements: batch.entitlements,
        })
    }

    fn compute(
        &self,
        inv: &Invocation,
        key: &RecalcKey,
        snapshot: &InputSnapshot,
    ) -> BillingResult<ComputedBatch> {
        let mut ctx = PolicyContext::new(&self.config);
        let scope: Option<TypeKey> = key.student_type.as_deref().map(|l| ctx.resolve(l).key);

        // Group by canonical type key so each group has one billing model.
        let mut groups: BTreeMap<TypeKey, (ResolvedPolicy, Vec<&EnrollmentRow>)> = BTreeMap::new();
        for e in &snapshot.enrollments {
            let resolved = ctx.resolve(&e.student_type);
            if scope.as_ref().is_some_and(|k| *k != resolved.key) {
                continue;
            }
            groups
                .entry(resolved.key.clone())
                .or_insert_with(|| (resolved, Vec::new()))
                .1
                .push(e);
        }

        let mut batch = ComputedBatch::default();
        for (resolved, enrollments) in groups.values() {
            match resolved.billing_model {
                BillingModel::CreditBased => {
                    self.compute_credit_group(&ctx, snapshot, resolved, enrollments, &mut batch);
                }
                BillingModel::PerCourse => {
                    self.compute_per_course_group(inv, &ctx, snapshot, resolved, enrollments, &mut batch)?;
                }
            }
        }
        batch.written.sort_by_key(|p| p.course_id);

        // Only enrollments that are gone lose their projection. A course that
        // moved to a type outside the scope is still live.
        let live: BTreeSet<CourseId> = snapshot.enrollments.iter().map(|e| e.course_id).collect();
        let mut removed: Vec<CourseId> = snapshot
            .previous
            .values()
            .filter(|p| scope.as_ref().map_or(true, |k| *k == p.student_type))
            .map(|p| p.course_id)
            .filter(|c| !live.contains(c))
            .collect();
        removed.sort_unstable();
        batch.removed = removed;

        Ok(batch)
    }

    fn compute_credit_group(
        &self,
        ctx: &PolicyContext<'_>,
        snapshot: &InputSnapshot,
        resolved: &ResolvedPolicy,
        enrollments: &[&EnrollmentRow],
        batch: &mut ComputedBatch,
    ) {
        let type_key = &resolved.key;
        let overrides = &snapshot.overrides;
        let credit_override = overrides.credit_limit_override(type_key);

        let mut lines = Vec::with_capacity(enrollments.len());
        let mut manual = Vec::new();
        for e in enrollments {
            let credits = ctx.credit_weight(e.course_id);
            let exempt = ctx.is_exempt(e.course_id);
            match overrides.paid_course_override(type_key, e.course_id) {
                // Staff-paid courses sit outside the allowance.
                Some(o) => manual.push((
                    CreditDecision {
                        course_id: e.course_id,
                        credits,
                        exempt,
                        requires_payment: false,
                        credits_required_to_unlock: 0,
                        base_free_credits_used: 0,
                        override_credits_used: 0,
                        paid_credits_used: 0,
                    },
                    ManualOverride {
                        reason: o.reason.clone(),
                        created_at: o.created_at,
                    },
                )),
                None => lines.push(CreditLine {
                    course_id: e.course_id,
                    credits,
                    created_at: e.created_at,
                    exempt,
                }),
            }
        }

        let allowance = CreditAllowance {
            base_free_credits: resolved.policy.free_credits_limit,
            additional_free_credits: overrides.additional_free_credits(type_key),
            paid_credits: snapshot.paid_balance(type_key),
            cost_per_credit: resolved.policy.cost_per_credit,
        };
        let outcome = entitlement::evaluate(&lines, &allowance);
        let summary = &outcome.summary;
        log::info!(
            "student={} year={} type={type_key} entitlement: credits={} limit={:?} effective={:?} paid_used={} requiring_payment={} amount_due={}",
            snapshot.student_key,
            snapshot.school_year,
            summary.total_non_exempt_credits,
            summary.free_credits_limit,
            summary.effective_limit,
            summary.paid_credits_used,
            summary.credits_requiring_payment,
            summary.amount_due
        );

        let projected = outcome
            .decisions
            .into_iter()
            .map(|d| (d, None))
            .chain(manual.into_iter().map(|(d, o)| (d, Some(o))))
            .map(|(decision, manual_override)| {
                let key = ProjectionKey {
                    student_key: snapshot.student_key.clone(),
                    school_year: snapshot.school_year,
                    course_id: decision.course_id,
                    student_type: type_key.clone(),
                };
                let result = CreditBasedResult {
                    decision,
                    free_credits_limit: summary.free_credits_limit,
                    additional_free_credits: allowance.additional_free_credits,
                    paid_credits_balance: allowance.paid_credits,
                    cost_per_credit: resolved.policy.cost_per_credit,
                    credit_override_reason: credit_override.and_then(|o| o.reason.clone()),
                    credit_override_at: credit_override.map(|o| o.created_at),
                    manual_override,
                };
                project(&key, &EnrollmentResult::CreditBased(result))
            });
        batch.written.extend(projected);
        batch.entitlements.insert(type_key.clone(), outcome.summary);
    }

    fn compute_per_course_group(
        &self,
        inv: &Invocation,
        ctx: &PolicyContext<'_>,
        snapshot: &InputSnapshot,
        resolved: &ResolvedPolicy,
        enrollments: &[&EnrollmentRow],
        batch: &mut ComputedBatch,
    ) -> BillingResult<()> {
        let resolver = CoursePaymentResolver::new(
            self.processor.as_ref(),
            inv.now,
            ctx.trial_period_days(),
            ctx.subscription_required_charges(),
        );

        for e in enrollments {
            let input = CourseInput {
                enrollment: e,
                course_override: snapshot.overrides.course_override(&resolved.key, e.course_id),
                prior_payment: snapshot.prior_payments.get(&e.course_id),
                last_known: snapshot.last_known.get(&e.course_id),
            };
            let resolution = resolver.resolve(&input);
            if e.payment_handle.is_some() {
                // Processor round trip.
                inv.check()?;
            }
            if resolution.result.details.degraded {
                batch.degraded.push(e.course_id);
            }

            let key = ProjectionKey {
                student_key: snapshot.student_key.clone(),
                school_year: snapshot.school_year,
                course_id: e.course_id,
                student_type: resolved.key.clone(),
            };
            let computed = project(&key, &EnrollmentResult::PerCourse(resolution.result));
            batch
                .written
                .push(merge(snapshot.previous.get(&e.course_id), computed));
            batch.carryovers.extend(resolution.carryover);
            batch.state_updates.extend(resolution.state_update);
        }
        Ok(())
    }

    // ── Funding ────────────────────────────────────────────────

    /// Recompute and persist the funding entry for a student in a year.
    pub fn recalculate_funding(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<FundingEntry> {
        let student_key = validate_student_key(student_key)?;
        let mut inv = self.begin("funding", format!("{student_key}:{school_year}"));
        match self.run_funding(&mut inv, &student_key, school_year) {
            Ok(entry) => Ok(entry),
            Err(err) => Err(self.fail(&mut inv, err)),
        }
    }

    fn run_funding(
        &self,
        inv: &mut Invocation,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<FundingEntry> {
        inv.enter(RecalcPhase::Gathering);
        let (student, registration, previous) = self.store.in_transaction(|s| {
            Ok((
                s.get_student(student_key)?,
                s.get_registration(student_key, school_year)?,
                s.get_funding_entry(student_key, school_year)?,
            ))
        })?;
        inv.check()?;
        let student = student.ok_or_else(|| BillingError::NotFound {
            entity: "student",
            key: student_key.to_string(),
        })?;

        inv.enter(RecalcPhase::Computing);
        let birthday = student.birthday.as_deref().map(parse_birthday).transpose()?;
        let rates = FundingRates {
            kindergarten: self.config.funding.kindergarten_rate,
            grades_1_12: self.config.funding.grades_1_12_rate,
        };
        let eligibility = funding::evaluate(birthday, Some(school_year), &rates)?;
        let registered_at = registration.and_then(|r| r.registered_at);
        let fresh = allocate(eligibility.funding_amount, school_year, registered_at, &self.window);
        let allocation = carry_upgrade(previous.as_ref().map(|e| &e.allocation), fresh);
        if let Some(reason) = &allocation.error {
            log::warn!("student={student_key} year={school_year} funding: {reason}");
        }

        let entry = FundingEntry {
            student_key: student_key.to_string(),
            school_year,
            eligibility,
            allocation,
        };

        inv.enter(RecalcPhase::Writing);
        inv.check()?;
        self.store.in_write_transaction(|s| {
            s.upsert_funding_entry(&entry)?;
            inv.events.push(RecalcEvent::FundingWritten {
                student_key: entry.student_key.clone(),
                school_year,
                age_category: entry.eligibility.age_category,
                current_allocation: entry.allocation.current_allocation,
                remaining_allocation: entry.allocation.remaining_allocation,
            });
            inv.check()?;
            inv.commit_log(s, 1)
        })?;

        log::info!(
            "student={student_key} year={school_year} funding: category={} amount={} current={} remaining={} phase={}",
            entry.eligibility.age_category.as_str(),
            entry.eligibility.funding_amount,
            entry.allocation.current_allocation,
            entry.allocation.remaining_allocation,
            entry.allocation.registration_phase.as_str()
        );
        Ok(entry)
    }

    /// Move deferred allocations into the current allocation for staff-
    /// confirmed students. One outcome per requested student, in order.
    pub fn upgrade_allocations(
        &self,
        school_year: SchoolYear,
        students: &[StudentKey],
    ) -> BillingResult<Vec<UpgradeOutcome>> {
        let mut inv = self.begin("upgrade", format!("upgrade:{school_year}"));
        match self.run_upgrade(&mut inv, school_year, students) {
            Ok(outcomes) => Ok(outcomes),
            Err(err) => Err(self.fail(&mut inv, err)),
        }
    }

    fn run_upgrade(
        &self,
        inv: &mut Invocation,
        school_year: SchoolYear,
        students: &[StudentKey],
    ) -> BillingResult<Vec<UpgradeOutcome>> {
        let keys = students
            .iter()
            .map(|s| validate_student_key(s))
            .collect::<BillingResult<Vec<_>>>()?;
        let today = regional_date(inv.now);

        inv.enter(RecalcPhase::Writing);
        let outcomes = self.store.in_write_transaction(|s| {
            let mut outcomes = Vec::with_capacity(keys.len());
            for student_key in keys {
                let Some(mut entry) = s.get_funding_entry(&student_key, school_year)? else {
                    outcomes.push(UpgradeOutcome::NotFound { student_key });
                    continue;
                };
                let a = &entry.allocation;
                if a.upgraded_at.is_some() {
                    outcomes.push(UpgradeOutcome::AlreadyUpgraded { student_key });
                    continue;
                }
                if let Some(from) = a.upgrade_eligible_after.filter(|d| today < *d) {
                    outcomes.push(UpgradeOutcome::NotYetEligible {
                        student_key,
                        eligible_from: from,
                    });
                    continue;
                }
                let Some(upgraded) = proration::upgrade(a, inv.now) else {
                    outcomes.push(UpgradeOutcome::NothingToUpgrade { student_key });
                    continue;
                };

                let moved = upgraded.current_allocation - a.current_allocation;
                entry.allocation = upgraded;
                s.upsert_funding_entry(&entry)?;
                inv.events.push(RecalcEvent::AllocationUpgraded {
                    student_key: student_key.clone(),
                    school_year,
                    moved,
                });
                log::info!("student={student_key} year={school_year} upgrade: moved {moved} into current allocation");
                outcomes.push(UpgradeOutcome::Upgraded { student_key, moved });
            }
            inv.check()?;
            let upgraded = outcomes
                .iter()
                .filter(|o| matches!(o, UpgradeOutcome::Upgraded { .. }))
                .count();
            inv.commit_log(s, upgraded)?;
            Ok(outcomes)
        })?;
        Ok(outcomes)
    }

    // ── Sweep ──────────────────────────────────────────────────

    /// Recalculate every student in the year. Per-student failures are
    /// collected; they do not stop the sweep.
    pub fn sweep(&self, school_year: SchoolYear) -> BillingResult<SweepReport> {
        let students = self.store.students_for_year(school_year)?;
        let registered: BTreeSet<StudentKey> =
            self.store.registered_students(school_year)?.into_iter().collect();
        let workers = self.config.recalc.sweep_workers.max(1).min(students.len().max(1));
        log::info!(
            "year={school_year} sweep: {} students, {} workers",
            students.len(),
            if self.store.is_file_backed() { workers } else { 1 }
        );

        let results: Vec<(StudentKey, BillingResult<(usize, bool)>)> =
            if self.store.is_file_backed() && workers > 1 {
                let mut chunks: Vec<Vec<StudentKey>> = vec![Vec::new(); workers];
                for (i, s) in students.iter().enumerate() {
                    chunks[i % workers].push(s.clone());
                }
                let engines = (0..workers)
                    .map(|_| self.worker())
                    .collect::<BillingResult<Vec<_>>>()?;
                let registered = &registered;

                std::thread::scope(|scope| {
                    let handles: Vec<_> = engines
                        .into_iter()
                        .zip(chunks)
                        .map(|(engine, chunk)| {
                            scope.spawn(move || {
                                chunk
                                    .into_iter()
                                    .map(|s| {
                                        let r = engine.sweep_student(&s, school_year, registered.contains(&s));
                                        (s, r)
                                    })
                                    .collect::<Vec<_>>()
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .flat_map(|h| {
                            h.join().unwrap_or_else(|_| {
                                log::error!("year={school_year} sweep: worker panicked");
                                Vec::new()
                            })
                        })
                        .collect()
                })
            } else {
                students
                    .iter()
                    .map(|s| {
                        let r = self.sweep_student(s, school_year, registered.contains(s));
                        (s.clone(), r)
                    })
                    .collect()
            };

        let mut report = SweepReport {
            school_year,
            students: students.len(),
            succeeded: 0,
            projections_written: 0,
            funding_written: 0,
            failures: Vec::new(),
        };
        for (student_key, result) in results {
            match result {
                Ok((written, funded)) => {
                    report.succeeded += 1;
                    report.projections_written += written;
                    report.funding_written += usize::from(funded);
                }
                Err(err) => report.failures.push(SweepFailure {
                    student_key,
                    error: err.to_string(),
                }),
            }
        }
        // A panicked worker loses its results; count them as failures.
        let accounted = report.succeeded + report.failures.len();
        if accounted < report.students {
            report.failures.push(SweepFailure {
                student_key: String::new(),
                error: format!("{} students lost to a panicked worker", report.students - accounted),
            });
        }
        report.failures.sort_by(|a, b| a.student_key.cmp(&b.student_key));

        log::info!(
            "year={school_year} sweep: {} ok, {} failed, {} projections, {} funding entries",
            report.succeeded,
            report.failures.len(),
            report.projections_written,
            report.funding_written
        );
        Ok(report)
    }

    fn sweep_student(
        &self,
        student_key: &str,
        school_year: SchoolYear,
        registered: bool,
    ) -> BillingResult<(usize, bool)> {
        let key = RecalcKey::new(student_key, school_year, None)?;
        let written = self.recalculate(&key)?.written.len();
        if registered {
            self.recalculate_funding(student_key, school_year)?;
        }
        Ok((written, registered))
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn projections(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Vec<EnrollmentPaymentStatus>> {
        self.store.projections_for(student_key, school_year)
    }

    pub fn funding_entry(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Option<FundingEntry>> {
        self.store.get_funding_entry(student_key, school_year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::NoProcessor;
    use chrono::TimeZone;

    #[test]
    fn key_rejects_blank_student_and_bad_year() {
        assert!(RecalcKey::parse("  ", "25/26", None).is_err());
        assert!(RecalcKey::parse("s1", "2025", None).is_err());
        let key = RecalcKey::parse("s1", "25/26", Some("  ")).unwrap();
        assert_eq!(key.student_type, None);
        assert_eq!(key.to_string(), "s1:25/26");
    }

    #[test]
    fn zero_budget_times_out_before_writing() {
        let now = Utc.with_ymd_and_hms(2025, 9, 20, 18, 0, 0).unwrap();
        let mut config = BillingConfig::default_test();
        config.recalc.timeout_ms = 0;
        let store = BillingStore::in_memory().unwrap();
        store.migrate().unwrap();
        let engine = RecalcEngine::new(
            config,
            store,
            Arc::new(NoProcessor),
            Arc::new(crate::clock::FixedClock(now)),
        )
        .unwrap();

        let key = RecalcKey::parse("s1", "25/26", None).unwrap();
        let err = engine.recalculate(&key).unwrap_err();
        assert!(matches!(err, BillingError::Timeout { phase: "gathering", .. }));

        let log = engine.store().recalc_log_for("s1:25/26").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event_type, "invocation_failed");
    }
}
