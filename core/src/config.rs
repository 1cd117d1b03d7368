use crate::{
    error::{BillingError, BillingResult},
    types::{CourseId, SchoolYear, TypeKey},
};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ── Credit policy per student type ─────────────────────────────────

/// Configured policy for one student type. Absent fields fall back to the
/// type's built-in defaults during policy lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentTypeConfig {
    pub key: TypeKey,
    pub label: String,
    #[serde(default)]
    pub free_credits_limit: Option<u32>,
    /// Explicitly configured "no limit". Wins over `free_credits_limit`.
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default)]
    pub cost_per_credit: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct StudentTypesFile {
    student_types: Vec<StudentTypeConfig>,
    exempt_courses: Vec<CourseId>,
}

// ── Course catalog ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseConfig {
    pub course_id: CourseId,
    pub title: String,
    pub credits: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct CourseCatalogFile {
    courses: Vec<CourseConfig>,
}

// ── Per-course payment ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerCoursePaymentConfig {
    /// Days after enrollment creation during which payment is not yet due.
    pub trial_period_days: i64,
    /// Succeeded subscription charges that count as fully paid.
    pub subscription_required_charges: u32,
}

// ── Funding ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    pub kindergarten_rate: Decimal,
    pub grades_1_12_rate: Decimal,
    pub proration: ProrationConfig,
}

/// Mid-year registration window for the one proration-affected school year.
/// Times are wall-clock times in the regional timezone, both inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProrationConfig {
    pub school_year: SchoolYear,
    pub mid_term_start: NaiveDateTime,
    pub mid_term_end: NaiveDateTime,
    pub upgrade_eligible_after: NaiveDate,
}

// ── Orchestrator ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalcConfig {
    /// Budget for a single invocation, checked at every I/O boundary.
    pub timeout_ms: u64,
    /// Worker connections used by a sweep over a file-backed store.
    pub sweep_workers: usize,
}

// ── Root ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub student_types: HashMap<TypeKey, StudentTypeConfig>,
    pub exempt_courses: BTreeSet<CourseId>,
    pub courses: HashMap<CourseId, CourseConfig>,
    pub per_course: PerCoursePaymentConfig,
    pub funding: FundingConfig,
    pub recalc: RecalcConfig,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    let parsed = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
    Ok(parsed)
}

impl BillingConfig {
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let types_file: StudentTypesFile =
            read_json(&format!("{data_dir}/policy/student_types.json"))?;
        let student_types = types_file
            .student_types
            .into_iter()
            .map(|t| (t.key.clone(), t))
            .collect();

        let catalog: CourseCatalogFile =
            read_json(&format!("{data_dir}/courses/course_catalog.json"))?;
        let courses = catalog
            .courses
            .into_iter()
            .map(|c| (c.course_id, c))
            .collect();

        let per_course: PerCoursePaymentConfig =
            read_json(&format!("{data_dir}/policy/per_course_payment.json"))?;
        let funding: FundingConfig = read_json(&format!("{data_dir}/funding/funding_config.json"))?;
        let recalc: RecalcConfig = read_json(&format!("{data_dir}/recalc/recalc_config.json"))?;

        let config = Self {
            student_types,
            exempt_courses: types_file.exempt_courses.into_iter().collect(),
            courses,
            per_course,
            funding,
            recalc,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the rule modules cannot evaluate.
    pub fn validate(&self) -> BillingResult<()> {
        let p = &self.funding.proration;
        if p.mid_term_start > p.mid_term_end {
            return Err(BillingError::invalid(
                "proration",
                format!(
                    "mid_term_start {} is after mid_term_end {}",
                    p.mid_term_start, p.mid_term_end
                ),
            ));
        }
        if self.per_course.trial_period_days < 0 {
            return Err(BillingError::invalid(
                "trial_period_days",
                "must not be negative",
            ));
        }
        if self.per_course.subscription_required_charges == 0 {
            return Err(BillingError::invalid(
                "subscription_required_charges",
                "must be at least 1",
            ));
        }
        if self.funding.kindergarten_rate.is_sign_negative()
            || self.funding.grades_1_12_rate.is_sign_negative()
        {
            return Err(BillingError::invalid("funding", "rates must not be negative"));
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in unit tests.
    pub fn default_test() -> Self {
        let student_types = [
            StudentTypeConfig {
                key: "nonPrimary".into(),
                label: "Non-Primary".into(),
                free_credits_limit: Some(10),
                unlimited: false,
                cost_per_credit: Some(Decimal::new(10000, 2)),
            },
            StudentTypeConfig {
                key: "homeEducation".into(),
                label: "Home Education".into(),
                free_credits_limit: Some(10),
                unlimited: false,
                cost_per_credit: None,
            },
            StudentTypeConfig {
                key: "summerSchool".into(),
                label: "Summer School".into(),
                free_credits_limit: None,
                unlimited: true,
                cost_per_credit: None,
            },
        ]
        .into_iter()
        .map(|t| (t.key.clone(), t))
        .collect();

        let courses = [
            (2, "Math 10C", 5),
            (3, "English 10-1", 5),
            (4, "Science 10", 5),
            (5, "Social Studies 10-1", 5),
            (6, "Physical Education 10", 3),
            (7, "Career and Life Management", 3),
            (8, "Math 20-1", 5),
            (9, "Biology 20", 5),
            (139, "Orientation", 1),
        ]
        .into_iter()
        .map(|(id, title, credits)| {
            (
                id,
                CourseConfig {
                    course_id: id,
                    title: title.to_string(),
                    credits,
                },
            )
        })
        .collect();

        Self {
            student_types,
            exempt_courses: [139].into_iter().collect(),
            courses,
            per_course: PerCoursePaymentConfig {
                trial_period_days: 10,
                subscription_required_charges: 3,
            },
            funding: FundingConfig {
                kindergarten_rate: Decimal::new(45050, 2),
                grades_1_12_rate: Decimal::new(90100, 2),
                proration: ProrationConfig {
                    school_year: SchoolYear::starting(2025),
                    mid_term_start: NaiveDate::from_ymd_opt(2025, 11, 1)
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .unwrap_or_default(),
                    mid_term_end: NaiveDate::from_ymd_opt(2026, 1, 31)
                        .and_then(|d| d.and_hms_opt(23, 59, 59))
                        .unwrap_or_default(),
                    upgrade_eligible_after: NaiveDate::from_ymd_opt(2026, 2, 1)
                        .unwrap_or_default(),
                },
            },
            recalc: RecalcConfig {
                timeout_ms: 30_000,
                sweep_workers: 4,
            },
        }
    }
}
