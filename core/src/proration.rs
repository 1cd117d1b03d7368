//! Proration — splits a funding amount into a current allocation and a
//! deferred remainder for registrations landing mid-term.
//!
//! Only the designated school year is prorated. Mid-term registrations get
//! half now (rounded to the cent, half away from zero) and the rest once
//! staff confirm continued enrollment through `upgrade`.
//!
//! RULE: Decimal arithmetic only. current + remaining == full, always.

use crate::{
    clock::regional_instant,
    config::ProrationConfig,
    error::BillingResult,
    types::{SchoolYear, StudentKey},
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const MISSING_REGISTRATION: &str =
    "Cannot determine proration: registration timestamp is missing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPhase {
    Early,
    MidTerm,
    Late,
    NotApplicable,
}

impl RegistrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationPhase::Early => "early",
            RegistrationPhase::MidTerm => "mid_term",
            RegistrationPhase::Late => "late",
            RegistrationPhase::NotApplicable => "not_applicable",
        }
    }
}

impl FromStr for RegistrationPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "early" => RegistrationPhase::Early,
            "mid_term" => RegistrationPhase::MidTerm,
            "late" => RegistrationPhase::Late,
            "not_applicable" => RegistrationPhase::NotApplicable,
            other => return Err(format!("unknown registration phase '{other}'")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub full_amount: Decimal,
    pub current_allocation: Decimal,
    pub remaining_allocation: Decimal,
    pub registration_phase: RegistrationPhase,
    /// First regional date on which the remainder may be upgraded. The date
    /// itself is accepted; earlier dates are refused.
    pub upgrade_eligible_after: Option<NaiveDate>,
    pub upgraded_at: Option<DateTime<Utc>>,
    /// Why no allocation could be made.
    pub error: Option<String>,
}

impl Allocation {
    fn whole(full: Decimal) -> Self {
        Self {
            full_amount: full,
            current_allocation: full,
            remaining_allocation: Decimal::ZERO,
            registration_phase: RegistrationPhase::NotApplicable,
            upgrade_eligible_after: None,
            upgraded_at: None,
            error: None,
        }
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining_allocation > Decimal::ZERO
    }
}

/// Mid-term window resolved to UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProrationWindow {
    pub school_year: SchoolYear,
    pub mid_term_start: DateTime<Utc>,
    pub mid_term_end: DateTime<Utc>,
    /// First regional date upgrades are accepted (inclusive).
    pub upgrade_eligible_after: NaiveDate,
}

impl ProrationWindow {
    pub fn from_config(config: &ProrationConfig) -> BillingResult<Self> {
        Ok(Self {
            school_year: config.school_year,
            mid_term_start: regional_instant(config.mid_term_start)?,
            mid_term_end: regional_instant(config.mid_term_end)?,
            upgrade_eligible_after: config.upgrade_eligible_after,
        })
    }

    /// Both window ends are inclusive.
    pub fn phase(&self, registered_at: DateTime<Utc>) -> RegistrationPhase {
        if registered_at < self.mid_term_start {
            RegistrationPhase::Early
        } else if registered_at <= self.mid_term_end {
            RegistrationPhase::MidTerm
        } else {
            RegistrationPhase::Late
        }
    }
}

pub fn allocate(
    full: Decimal,
    school_year: SchoolYear,
    registered_at: Option<DateTime<Utc>>,
    window: &ProrationWindow,
) -> Allocation {
    if school_year != window.school_year {
        return Allocation::whole(full);
    }

    let Some(registered_at) = registered_at else {
        if full > Decimal::ZERO {
            return Allocation {
                current_allocation: Decimal::ZERO,
                error: Some(MISSING_REGISTRATION.to_string()),
                ..Allocation::whole(full)
            };
        }
        return Allocation::whole(full);
    };

    match window.phase(registered_at) {
        RegistrationPhase::MidTerm => {
            let current = (full / Decimal::from(2))
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            Allocation {
                full_amount: full,
                current_allocation: current,
                remaining_allocation: full - current,
                registration_phase: RegistrationPhase::MidTerm,
                upgrade_eligible_after: Some(window.upgrade_eligible_after),
                upgraded_at: None,
                error: None,
            }
        }
        phase => Allocation {
            registration_phase: phase,
            ..Allocation::whole(full)
        },
    }
}

/// A recompute never undoes an upgrade staff already confirmed.
pub fn carry_upgrade(previous: Option<&Allocation>, fresh: Allocation) -> Allocation {
    match previous.and_then(|p| p.upgraded_at) {
        Some(upgraded_at) if fresh.error.is_none() => Allocation {
            current_allocation: fresh.full_amount,
            remaining_allocation: Decimal::ZERO,
            upgraded_at: Some(upgraded_at),
            ..fresh
        },
        _ => fresh,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Upgraded {
        student_key: StudentKey,
        moved: Decimal,
    },
    AlreadyUpgraded {
        student_key: StudentKey,
    },
    NothingToUpgrade {
        student_key: StudentKey,
    },
    /// The configured eligibility date has not been reached.
    NotYetEligible {
        student_key: StudentKey,
        eligible_from: NaiveDate,
    },
    NotFound {
        student_key: StudentKey,
    },
}

/// Move the deferred remainder into the current allocation. `None` when the
/// allocation is already whole or was upgraded before.
pub fn upgrade(allocation: &Allocation, now: DateTime<Utc>) -> Option<Allocation> {
    if allocation.upgraded_at.is_some() || !allocation.has_remaining() {
        return None;
    }
    Some(Allocation {
        current_allocation: allocation.full_amount,
        remaining_allocation: Decimal::ZERO,
        upgraded_at: Some(now),
        ..allocation.clone()
    })
}
