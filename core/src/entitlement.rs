//! Entitlement engine — free-credit allowance for credit-based student types.
//!
//! Enrollments consume the allowance first-come-first-served by creation
//! time. The allowance is laid out as consecutive credit ranges:
//!
//! ```text
//!   [0, base)                      policy free credits
//!   [base, base + additional)      credit-limit override
//!   [free_limit, free_limit + paid) paid credits balance
//!   [effective_limit, ..)          requires payment
//! ```
//!
//! Each enrollment occupies `[before, before + credits)` of the running
//! total and is charged for whatever part of that range falls in each
//! region. Exempt enrollments never enter the running total.

use crate::types::CourseId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditLine {
    pub course_id: CourseId,
    pub credits: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub exempt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreditAllowance {
    /// Policy limit. `None` = unlimited.
    pub base_free_credits: Option<u32>,
    pub additional_free_credits: u32,
    pub paid_credits: u32,
    /// Price of one credit beyond the effective limit.
    pub cost_per_credit: Decimal,
}

impl CreditAllowance {
    pub fn free_credits_limit(&self) -> Option<u32> {
        self.base_free_credits
            .map(|b| b.saturating_add(self.additional_free_credits))
    }

    pub fn effective_limit(&self) -> Option<u32> {
        self.free_credits_limit()
            .map(|f| f.saturating_add(self.paid_credits))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDecision {
    pub course_id: CourseId,
    pub credits: u32,
    pub exempt: bool,
    pub requires_payment: bool,
    pub credits_required_to_unlock: u32,
    pub base_free_credits_used: u32,
    pub override_credits_used: u32,
    pub paid_credits_used: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSummary {
    pub total_non_exempt_credits: u32,
    pub free_credits_limit: Option<u32>,
    pub effective_limit: Option<u32>,
    pub paid_credits_balance: u32,
    pub paid_credits_used: u32,
    pub credits_requiring_payment: u32,
    /// `credits_requiring_payment` at the policy's cost per credit.
    pub amount_due: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementOutcome {
    /// One decision per input line, in consumption (FIFO) order.
    pub decisions: Vec<CreditDecision>,
    pub summary: EntitlementSummary,
}

/// Length of `[start, end)` ∩ `[lo, hi)`.
fn overlap(start: u32, end: u32, lo: u32, hi: u32) -> u32 {
    end.min(hi).saturating_sub(start.max(lo))
}

/// Sort by creation time, oldest first. Ties keep input order; lines
/// without a timestamp go last.
fn fifo_order(lines: &[CreditLine]) -> Vec<&CreditLine> {
    let mut ordered: Vec<&CreditLine> = lines.iter().collect();
    ordered.sort_by_key(|l| (l.created_at.is_none(), l.created_at));
    ordered
}

pub fn evaluate(lines: &[CreditLine], allowance: &CreditAllowance) -> EntitlementOutcome {
    let ordered = fifo_order(lines);

    let Some(base) = allowance.base_free_credits else {
        // Unlimited policy: short-circuit, everything is free.
        let decisions: Vec<CreditDecision> = ordered
            .iter()
            .map(|l| CreditDecision {
                course_id: l.course_id,
                credits: l.credits,
                exempt: l.exempt,
                requires_payment: false,
                credits_required_to_unlock: 0,
                base_free_credits_used: if l.exempt { 0 } else { l.credits },
                override_credits_used: 0,
                paid_credits_used: 0,
            })
            .collect();
        let total = ordered
            .iter()
            .filter(|l| !l.exempt)
            .map(|l| l.credits)
            .sum();
        return EntitlementOutcome {
            decisions,
            summary: EntitlementSummary {
                total_non_exempt_credits: total,
                free_credits_limit: None,
                effective_limit: None,
                paid_credits_balance: allowance.paid_credits,
                paid_credits_used: 0,
                credits_requiring_payment: 0,
                amount_due: Decimal::ZERO,
            },
        };
    };

    let free_limit = base.saturating_add(allowance.additional_free_credits);
    let effective = free_limit.saturating_add(allowance.paid_credits);

    let mut running: u32 = 0;
    let mut decisions = Vec::with_capacity(ordered.len());
    for line in ordered {
        if line.exempt {
            decisions.push(CreditDecision {
                course_id: line.course_id,
                credits: line.credits,
                exempt: true,
                requires_payment: false,
                credits_required_to_unlock: 0,
                base_free_credits_used: 0,
                override_credits_used: 0,
                paid_credits_used: 0,
            });
            continue;
        }

        let before = running;
        let after = before.saturating_add(line.credits);
        running = after;

        let unpaid = overlap(before, after, effective, u32::MAX);
        decisions.push(CreditDecision {
            course_id: line.course_id,
            credits: line.credits,
            exempt: false,
            requires_payment: unpaid > 0,
            credits_required_to_unlock: unpaid,
            base_free_credits_used: overlap(before, after, 0, base),
            override_credits_used: overlap(before, after, base, free_limit),
            paid_credits_used: overlap(before, after, free_limit, effective),
        });
    }

    let requiring_payment: u32 = decisions.iter().map(|d| d.credits_required_to_unlock).sum();
    let summary = EntitlementSummary {
        total_non_exempt_credits: running,
        free_credits_limit: Some(free_limit),
        effective_limit: Some(effective),
        paid_credits_balance: allowance.paid_credits,
        paid_credits_used: decisions.iter().map(|d| d.paid_credits_used).sum(),
        credits_requiring_payment: requiring_payment,
        amount_due: allowance.cost_per_credit * Decimal::from(requiring_payment),
    };

    EntitlementOutcome { decisions, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn line(course_id: CourseId, credits: u32, day: u32) -> CreditLine {
        CreditLine {
            course_id,
            credits,
            created_at: Some(Utc.with_ymd_and_hms(2025, 9, day, 12, 0, 0).unwrap()),
            exempt: false,
        }
    }

    fn limited(base: u32, paid: u32) -> CreditAllowance {
        CreditAllowance {
            base_free_credits: Some(base),
            additional_free_credits: 0,
            paid_credits: paid,
            cost_per_credit: Decimal::new(10000, 2),
        }
    }

    #[test]
    fn crossing_the_limit_charges_only_the_excess() {
        let lines = vec![line(2, 5, 1), line(3, 5, 2), line(4, 5, 3)];
        let out = evaluate(&lines, &limited(12, 0));

        let unlock: Vec<u32> = out.decisions.iter().map(|d| d.credits_required_to_unlock).collect();
        assert_eq!(unlock, vec![0, 0, 3]);
        assert!(out.decisions[2].requires_payment);
        assert_eq!(out.summary.credits_requiring_payment, 3);
    }

    #[test]
    fn enrollment_after_the_limit_pays_in_full() {
        let lines = vec![line(2, 5, 1), line(3, 5, 2), line(4, 5, 3)];
        let out = evaluate(&lines, &limited(10, 0));
        assert_eq!(out.decisions[2].credits_required_to_unlock, 5);
    }

    #[test]
    fn creation_time_decides_order_not_input_order() {
        let lines = vec![line(4, 5, 20), line(2, 5, 1), line(3, 5, 5)];
        let out = evaluate(&lines, &limited(10, 0));
        let order: Vec<CourseId> = out.decisions.iter().map(|d| d.course_id).collect();
        assert_eq!(order, vec![2, 3, 4]);
        assert!(out.decisions[2].requires_payment);
    }

    #[test]
    fn ties_keep_input_order_and_missing_timestamps_go_last() {
        let mut undated = line(9, 5, 1);
        undated.created_at = None;
        let lines = vec![undated, line(3, 5, 2), line(2, 5, 2)];
        let out = evaluate(&lines, &limited(10, 0));
        let order: Vec<CourseId> = out.decisions.iter().map(|d| d.course_id).collect();
        assert_eq!(order, vec![3, 2, 9]);
    }

    #[test]
    fn paid_balance_is_consumed_once_in_fifo_order() {
        let lines = vec![line(2, 5, 1), line(3, 5, 2), line(4, 5, 3)];
        let out = evaluate(&lines, &limited(5, 7));

        assert_eq!(out.decisions[0].base_free_credits_used, 5);
        assert_eq!(out.decisions[1].paid_credits_used, 5);
        assert_eq!(out.decisions[2].paid_credits_used, 2);
        assert_eq!(out.decisions[2].credits_required_to_unlock, 3);
        assert_eq!(out.summary.paid_credits_used, 7);
        assert_eq!(out.summary.credits_requiring_payment, 3);
        assert_eq!(out.summary.amount_due, Decimal::new(30000, 2));
    }

    #[test]
    fn exempt_lines_never_require_payment_or_consume_credits() {
        let mut exempt = line(139, 50, 1);
        exempt.exempt = true;
        let lines = vec![exempt, line(2, 5, 2)];
        let out = evaluate(&lines, &limited(0, 0));

        let exempt_decision = out.decisions.iter().find(|d| d.course_id == 139).unwrap();
        assert!(!exempt_decision.requires_payment);
        assert_eq!(out.summary.total_non_exempt_credits, 5);
    }

    #[test]
    fn zero_limit_without_balance_charges_from_the_first_credit() {
        let lines = vec![line(2, 5, 1), line(3, 0, 2)];
        let out = evaluate(&lines, &limited(0, 0));
        assert_eq!(out.decisions[0].credits_required_to_unlock, 5);
        // Zero-weight enrollments never require payment.
        assert!(!out.decisions[1].requires_payment);
    }

    #[test]
    fn unlimited_policy_is_all_free() {
        let lines = vec![line(2, 5, 1), line(3, 50, 2)];
        let out = evaluate(&lines, &CreditAllowance::default());
        assert!(out.decisions.iter().all(|d| !d.requires_payment));
        assert_eq!(out.summary.effective_limit, None);
    }

    #[test]
    fn credits_are_conserved() {
        let shapes: [&[u32]; 4] = [&[5, 5, 5], &[3, 0, 7, 1], &[10], &[1, 1, 1, 1, 1, 1, 1]];
        for credits in shapes {
            let lines: Vec<CreditLine> = credits
                .iter()
                .enumerate()
                .map(|(i, c)| line(i as CourseId, *c, i as u32 + 1))
                .collect();
            for base in [0, 4, 10, 20] {
                for additional in [0, 3] {
                    for paid in [0, 2, 9] {
                        let allowance = CreditAllowance {
                            base_free_credits: Some(base),
                            additional_free_credits: additional,
                            paid_credits: paid,
                            cost_per_credit: Decimal::ZERO,
                        };
                        let out = evaluate(&lines, &allowance);
                        let total = out.summary.total_non_exempt_credits;
                        let covered = total.min(allowance.effective_limit().unwrap());
                        let unlock: u32 =
                            out.decisions.iter().map(|d| d.credits_required_to_unlock).sum();
                        assert_eq!(unlock + covered, total, "{credits:?} {allowance:?}");

                        for d in &out.decisions {
                            let split = d.base_free_credits_used
                                + d.override_credits_used
                                + d.paid_credits_used
                                + d.credits_required_to_unlock;
                            assert_eq!(split, d.credits);
                        }
                    }
                }
            }
        }
    }
}
