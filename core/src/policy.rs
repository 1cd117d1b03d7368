//! Policy lookup — student-type classification, merged credit policy,
//! course credit weights and active staff overrides.
//!
//! RULE: Nothing here is global. A PolicyContext is built per invocation
//! from the loaded config and dropped with it; its cache lives only that
//! long.

use crate::{
    config::BillingConfig,
    store::{CourseOverrideRow, CreditLimitOverrideRow},
    types::{CourseId, TypeKey},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How enrollments of a student type are billed. Selects the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    /// Free-credit allowance, then pay per credit.
    CreditBased,
    /// Every enrollment is paid for individually.
    PerCourse,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StudentType {
    NonPrimary,
    HomeEducation,
    SummerSchool,
    Primary,
    AdultStudent,
    InternationalStudent,
    /// A label no built-in type matches. Keeps the synthesized key.
    Unrecognized { key: TypeKey, label: String },
}

const KNOWN_TYPES: [StudentType; 6] = [
    StudentType::NonPrimary,
    StudentType::HomeEducation,
    StudentType::SummerSchool,
    StudentType::Primary,
    StudentType::AdultStudent,
    StudentType::InternationalStudent,
];

fn normalize(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// "Dual Credit" -> "dualCredit". Empty labels become "unknown".
fn synthesize_key(label: &str) -> TypeKey {
    let mut key = String::new();
    for (i, word) in label
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .enumerate()
    {
        let lower = word.to_ascii_lowercase();
        if i == 0 {
            key.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                key.push(first.to_ascii_uppercase());
                key.extend(chars);
            }
        }
    }
    if key.is_empty() {
        "unknown".to_string()
    } else {
        key
    }
}

impl StudentType {
    /// Classify a human label (or canonical key). Never fails.
    pub fn from_label(label: &str) -> Self {
        let wanted = normalize(label);
        KNOWN_TYPES
            .iter()
            .find(|t| normalize(t.label()) == wanted || normalize(t.key()) == wanted)
            .cloned()
            .unwrap_or_else(|| StudentType::Unrecognized {
                key: synthesize_key(label),
                label: label.trim().to_string(),
            })
    }

    pub fn key(&self) -> &str {
        match self {
            StudentType::NonPrimary => "nonPrimary",
            StudentType::HomeEducation => "homeEducation",
            StudentType::SummerSchool => "summerSchool",
            StudentType::Primary => "primary",
            StudentType::AdultStudent => "adultStudent",
            StudentType::InternationalStudent => "internationalStudent",
            StudentType::Unrecognized { key, .. } => key,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            StudentType::NonPrimary => "Non-Primary",
            StudentType::HomeEducation => "Home Education",
            StudentType::SummerSchool => "Summer School",
            StudentType::Primary => "Primary",
            StudentType::AdultStudent => "Adult Student",
            StudentType::InternationalStudent => "International Student",
            StudentType::Unrecognized { label, .. } => label,
        }
    }

    pub fn billing_model(&self) -> BillingModel {
        match self {
            StudentType::AdultStudent | StudentType::InternationalStudent => BillingModel::PerCourse,
            _ => BillingModel::CreditBased,
        }
    }

    /// Built-in defaults used where the configuration is silent.
    fn default_policy(&self) -> CreditPolicy {
        let per_credit = Decimal::new(10000, 2);
        match self {
            StudentType::NonPrimary | StudentType::HomeEducation => CreditPolicy {
                free_credits_limit: Some(10),
                cost_per_credit: per_credit,
            },
            StudentType::SummerSchool => CreditPolicy {
                free_credits_limit: None,
                cost_per_credit: per_credit,
            },
            StudentType::Primary
            | StudentType::AdultStudent
            | StudentType::InternationalStudent
            | StudentType::Unrecognized { .. } => CreditPolicy {
                free_credits_limit: None,
                cost_per_credit: Decimal::ZERO,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPolicy {
    /// `None` means unlimited: every credit is free.
    pub free_credits_limit: Option<u32>,
    pub cost_per_credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub student_type: StudentType,
    pub key: TypeKey,
    pub billing_model: BillingModel,
    pub policy: CreditPolicy,
}

/// Short-lived lookup context for one invocation.
pub struct PolicyContext<'a> {
    config: &'a BillingConfig,
    resolved: HashMap<String, ResolvedPolicy>,
}

impl<'a> PolicyContext<'a> {
    pub fn new(config: &'a BillingConfig) -> Self {
        Self {
            config,
            resolved: HashMap::new(),
        }
    }

    /// Canonical key plus merged policy for a student-type label.
    pub fn resolve(&mut self, label: &str) -> ResolvedPolicy {
        if let Some(hit) = self.resolved.get(label) {
            return hit.clone();
        }

        let student_type = StudentType::from_label(label);
        let defaults = student_type.default_policy();
        let configured = self.config.student_types.get(student_type.key()).or_else(|| {
            let wanted = normalize(label);
            self.config
                .student_types
                .values()
                .find(|t| normalize(&t.label) == wanted)
        });

        let policy = match configured {
            Some(c) => CreditPolicy {
                free_credits_limit: if c.unlimited {
                    None
                } else {
                    c.free_credits_limit.or(defaults.free_credits_limit)
                },
                cost_per_credit: c.cost_per_credit.unwrap_or(defaults.cost_per_credit),
            },
            None => {
                if matches!(student_type, StudentType::Unrecognized { .. }) {
                    log::warn!(
                        "policy: unknown student type '{label}', using key '{}' with no credit limit",
                        student_type.key()
                    );
                }
                defaults
            }
        };

        // A configured type not in the built-in table keeps its configured key.
        let key = match (&student_type, configured) {
            (StudentType::Unrecognized { .. }, Some(c)) => c.key.clone(),
            _ => student_type.key().to_string(),
        };

        let resolved = ResolvedPolicy {
            billing_model: student_type.billing_model(),
            student_type,
            key,
            policy,
        };
        self.resolved.insert(label.to_string(), resolved.clone());
        resolved
    }

    /// Credit weight of a course. Unknown courses weigh 0 and are logged.
    pub fn credit_weight(&self, course_id: CourseId) -> u32 {
        match self.config.courses.get(&course_id) {
            Some(course) => course.credits,
            None => {
                log::warn!("policy: course {course_id} has no credit weight configured, treating as 0");
                0
            }
        }
    }

    pub fn is_exempt(&self, course_id: CourseId) -> bool {
        self.config.exempt_courses.contains(&course_id)
    }

    pub fn trial_period_days(&self) -> i64 {
        self.config.per_course.trial_period_days
    }

    pub fn subscription_required_charges(&self) -> u32 {
        self.config.per_course.subscription_required_charges
    }
}

// ── Overrides ─────────────────────────────────────────────────────

/// Active (non-revoked) overrides for one student in one school year.
#[derive(Debug, Clone, Default)]
pub struct ActiveOverrides {
    credit_limits: HashMap<TypeKey, CreditLimitOverrideRow>,
    courses: HashMap<(TypeKey, CourseId), CourseOverrideRow>,
}

impl ActiveOverrides {
    pub fn from_rows(
        credit_limits: Vec<CreditLimitOverrideRow>,
        courses: Vec<CourseOverrideRow>,
    ) -> Self {
        Self {
            credit_limits: credit_limits
                .into_iter()
                .map(|r| (r.student_type.clone(), r))
                .collect(),
            courses: courses
                .into_iter()
                .map(|r| ((r.student_type.clone(), r.course_id), r))
                .collect(),
        }
    }

    pub fn additional_free_credits(&self, type_key: &str) -> u32 {
        self.credit_limits
            .get(type_key)
            .map(|r| r.additional_free_credits)
            .unwrap_or(0)
    }

    pub fn credit_limit_override(&self, type_key: &str) -> Option<&CreditLimitOverrideRow> {
        self.credit_limits.get(type_key)
    }

    pub fn course_override(&self, type_key: &str, course_id: CourseId) -> Option<&CourseOverrideRow> {
        self.courses.get(&(type_key.to_string(), course_id))
    }

    /// Course override that marks the course as paid, if any.
    pub fn paid_course_override(&self, type_key: &str, course_id: CourseId) -> Option<&CourseOverrideRow> {
        self.course_override(type_key, course_id).filter(|o| o.is_paid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_and_keys_classify_to_the_same_type() {
        assert_eq!(StudentType::from_label("Home Education"), StudentType::HomeEducation);
        assert_eq!(StudentType::from_label("homeEducation"), StudentType::HomeEducation);
        assert_eq!(StudentType::from_label("  adult student "), StudentType::AdultStudent);
        assert_eq!(StudentType::from_label("Non Primary"), StudentType::NonPrimary);
    }

    #[test]
    fn unknown_type_gets_synthesized_key_and_no_limit() {
        let config = BillingConfig::default_test();
        let mut ctx = PolicyContext::new(&config);
        let resolved = ctx.resolve("Dual Credit");
        assert_eq!(resolved.key, "dualCredit");
        assert_eq!(resolved.billing_model, BillingModel::CreditBased);
        assert_eq!(resolved.policy.free_credits_limit, None);
    }

    #[test]
    fn configured_fields_win_and_defaults_fill_gaps() {
        let mut config = BillingConfig::default_test();
        if let Some(t) = config.student_types.get_mut("homeEducation") {
            t.free_credits_limit = Some(6);
            t.cost_per_credit = None;
        }
        let mut ctx = PolicyContext::new(&config);
        let resolved = ctx.resolve("Home Education");
        assert_eq!(resolved.policy.free_credits_limit, Some(6));
        assert_eq!(resolved.policy.cost_per_credit, Decimal::new(10000, 2));
    }

    #[test]
    fn per_course_types_are_classified() {
        let config = BillingConfig::default_test();
        let mut ctx = PolicyContext::new(&config);
        assert_eq!(ctx.resolve("Adult Student").billing_model, BillingModel::PerCourse);
        assert_eq!(
            ctx.resolve("International Student").billing_model,
            BillingModel::PerCourse
        );
    }

    #[test]
    fn missing_course_weight_is_zero() {
        let config = BillingConfig::default_test();
        let ctx = PolicyContext::new(&config);
        assert_eq!(ctx.credit_weight(9999), 0);
        assert_eq!(ctx.credit_weight(2), 5);
        assert!(ctx.is_exempt(139));
    }
}
