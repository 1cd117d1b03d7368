//! External payment-processor boundary.
//!
//! RULE: The processor is read-only from here. Nothing in this crate
//! captures, refunds, or mutates a charge. "Not found" is a valid answer
//! (Ok(None)); only transport failures are errors.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// The payment reference stored on an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentHandle {
    /// Installment plan billed as recurring charges.
    Subscription(String),
    /// Single up-front charge.
    OneTime(String),
}

impl PaymentHandle {
    pub fn id(&self) -> &str {
        match self {
            PaymentHandle::Subscription(id) | PaymentHandle::OneTime(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PaymentHandle::Subscription(_) => "subscription",
            PaymentHandle::OneTime(_) => "one_time",
        }
    }

    pub fn from_parts(kind: &str, id: String) -> BillingResult<Self> {
        match kind {
            "subscription" => Ok(PaymentHandle::Subscription(id)),
            "one_time" => Ok(PaymentHandle::OneTime(id)),
            other => Err(BillingError::invalid(
                "payment_handle",
                format!("unknown handle kind '{other}'"),
            )),
        }
    }
}

/// Subscription lifecycle as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Trialing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorState {
    Subscription {
        succeeded_charge_count: u32,
        lifecycle_state: LifecycleState,
        #[serde(default)]
        last_charge_timestamps: Vec<DateTime<Utc>>,
    },
    OneTime {
        succeeded: bool,
        #[serde(default)]
        charged_at: Option<DateTime<Utc>>,
    },
}

impl ProcessorState {
    /// Most recent charge time the processor reported, if any.
    pub fn latest_charge(&self) -> Option<DateTime<Utc>> {
        match self {
            ProcessorState::Subscription {
                last_charge_timestamps,
                ..
            } => last_charge_timestamps.iter().max().copied(),
            ProcessorState::OneTime { charged_at, .. } => *charged_at,
        }
    }
}

pub trait PaymentProcessor: Send + Sync {
    /// Current state for a handle. `Ok(None)` when the processor has no
    /// record of it.
    fn payment_state(&self, handle: &PaymentHandle) -> BillingResult<Option<ProcessorState>>;
}

/// Processor that never has a record. Used when no processor is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProcessor;

impl PaymentProcessor for NoProcessor {
    fn payment_state(&self, _handle: &PaymentHandle) -> BillingResult<Option<ProcessorState>> {
        Ok(None)
    }
}

/// Processor answering from a recorded export of the processor ledger,
/// keyed by handle id. Can be switched offline to exercise the degraded
/// path.
#[derive(Debug, Default)]
pub struct RecordedProcessor {
    states: RwLock<HashMap<String, ProcessorState>>,
    offline: RwLock<bool>,
}

#[derive(Debug, Deserialize)]
struct RecordedFile {
    states: HashMap<String, ProcessorState>,
}

impl RecordedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let file: RecordedFile = serde_json::from_str(&content)?;
        log::info!("processor: loaded {} recorded states from {path}", file.states.len());
        Ok(Self {
            states: RwLock::new(file.states),
            offline: RwLock::new(false),
        })
    }

    pub fn record(&self, handle_id: &str, state: ProcessorState) {
        if let Ok(mut states) = self.states.write() {
            states.insert(handle_id.to_string(), state);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut flag) = self.offline.write() {
            *flag = offline;
        }
    }
}

impl PaymentProcessor for RecordedProcessor {
    fn payment_state(&self, handle: &PaymentHandle) -> BillingResult<Option<ProcessorState>> {
        let offline = self.offline.read().map(|f| *f).unwrap_or(true);
        if offline {
            return Err(BillingError::ExternalServiceUnavailable {
                service: "payment_processor",
                reason: "processor is offline".into(),
            });
        }
        let states = self.states.read().map_err(|_| BillingError::ExternalServiceUnavailable {
            service: "payment_processor",
            reason: "state lock poisoned".into(),
        })?;
        Ok(states.get(handle.id()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_export_loads() {
        let p = RecordedProcessor::load("../data/processor/recorded_states.json").unwrap();
        let math = p
            .payment_state(&PaymentHandle::Subscription("sub_adult_math".into()))
            .unwrap()
            .unwrap();
        assert!(matches!(
            math,
            ProcessorState::Subscription { succeeded_charge_count: 3, .. }
        ));
        assert!(p
            .payment_state(&PaymentHandle::OneTime("pi_unknown".into()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn offline_processor_is_unavailable() {
        let p = RecordedProcessor::new();
        p.set_offline(true);
        let err = p
            .payment_state(&PaymentHandle::OneTime("pi_1".into()))
            .unwrap_err();
        assert!(matches!(err, BillingError::ExternalServiceUnavailable { .. }));
        p.set_offline(false);
        assert!(p.payment_state(&PaymentHandle::OneTime("pi_1".into())).unwrap().is_none());
    }

    #[test]
    fn handle_parts_round_trip() {
        let h = PaymentHandle::from_parts("one_time", "pi_1".into()).unwrap();
        assert_eq!((h.kind(), h.id()), ("one_time", "pi_1"));
        assert!(PaymentHandle::from_parts("wire", "x".into()).is_err());
    }
}
