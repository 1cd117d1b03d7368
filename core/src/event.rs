//! Recalculation events — the audit trail of every invocation.
//!
//! RULE: Every phase transition and every derived write of an invocation is
//! described by an event. Events of a successful invocation are committed
//! in the same transaction as the writes they describe.
//! Variants are only ever added; persisted payloads must stay readable.

use crate::{
    engine::RecalcPhase,
    funding::AgeCategory,
    status::DetailedStatus,
    types::{CourseId, SchoolYear, StudentKey},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecalcEvent {
    // ── Orchestrator ───────────────────────────────
    PhaseEntered {
        key: String,
        phase: RecalcPhase,
    },
    InvocationCompleted {
        key: String,
        written: usize,
        elapsed_ms: u128,
    },
    InvocationFailed {
        key: String,
        phase: RecalcPhase,
        reason: String,
    },

    // ── Billing ────────────────────────────────────
    ProjectionWritten {
        student_key: StudentKey,
        school_year: SchoolYear,
        course_id: CourseId,
        detailed_status: DetailedStatus,
    },
    ProjectionRemoved {
        student_key: StudentKey,
        school_year: SchoolYear,
        course_id: CourseId,
    },
    CarryoverAppended {
        student_key: StudentKey,
        course_id: CourseId,
        original_year: SchoolYear,
        carried_year: SchoolYear,
    },
    ProcessorDegraded {
        student_key: StudentKey,
        school_year: SchoolYear,
        course_id: CourseId,
    },

    // ── Funding ────────────────────────────────────
    FundingWritten {
        student_key: StudentKey,
        school_year: SchoolYear,
        age_category: AgeCategory,
        current_allocation: Decimal,
        remaining_allocation: Decimal,
    },
    AllocationUpgraded {
        student_key: StudentKey,
        school_year: SchoolYear,
        moved: Decimal,
    },
}

impl RecalcEvent {
    /// Stable name for the event_type column.
    pub fn event_type(&self) -> &'static str {
        match self {
            RecalcEvent::PhaseEntered { .. } => "phase_entered",
            RecalcEvent::InvocationCompleted { .. } => "invocation_completed",
            RecalcEvent::InvocationFailed { .. } => "invocation_failed",
            RecalcEvent::ProjectionWritten { .. } => "projection_written",
            RecalcEvent::ProjectionRemoved { .. } => "projection_removed",
            RecalcEvent::CarryoverAppended { .. } => "carryover_appended",
            RecalcEvent::ProcessorDegraded { .. } => "processor_degraded",
            RecalcEvent::FundingWritten { .. } => "funding_written",
            RecalcEvent::AllocationUpgraded { .. } => "allocation_upgraded",
        }
    }
}

/// The recalc log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalcLogEntry {
    pub id: Option<i64>,
    pub invocation_id: String,
    pub invocation: String, // recalculate | funding | upgrade
    pub key: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized RecalcEvent
    pub created_at: DateTime<Utc>,
}

impl RecalcLogEntry {
    pub fn new(
        invocation_id: &str,
        invocation: &str,
        key: &str,
        event: &RecalcEvent,
        created_at: DateTime<Utc>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            id: None,
            invocation_id: invocation_id.to_string(),
            invocation: invocation.to_string(),
            key: key.to_string(),
            event_type: event.event_type().to_string(),
            payload: serde_json::to_string(event)?,
            created_at,
        })
    }

    pub fn event(&self) -> serde_json::Result<RecalcEvent> {
        serde_json::from_str(&self.payload)
    }
}
