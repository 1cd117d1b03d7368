//! Enrollment billing and funding recalculation.
//!
//! Pure rule modules (entitlement, course_payment, projector, funding,
//! proration) compute; the engine gathers inputs, runs them and writes the
//! derived state through the store in one transaction per invocation.

pub mod clock;
pub mod command;
pub mod config;
pub mod course_payment;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod event;
pub mod funding;
pub mod policy;
pub mod processor;
pub mod projector;
pub mod proration;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod types;
