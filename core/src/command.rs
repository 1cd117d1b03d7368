//! Commands accepted by the runner's JSON-lines interface.
//!
//! Raw strings are validated here, at the edge. A malformed key or school
//! year is `InvalidInput` before the engine is touched.

use crate::{
    engine::{RecalcEngine, RecalcKey},
    error::BillingResult,
    types::{SchoolYear, StudentKey},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Variants added over time. Never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RecalcCommand {
    // ── Triggers ──────────────────────────────────
    Recalculate {
        student_key: String,
        school_year: String,
        #[serde(default)]
        student_type: Option<String>,
    },
    Funding {
        student_key: String,
        school_year: String,
    },
    Upgrade {
        school_year: String,
        students: Vec<StudentKey>,
    },
    Sweep {
        school_year: String,
    },

    // ── Queries ───────────────────────────────────
    GetStatus {
        student_key: String,
        school_year: String,
    },
    GetFunding {
        student_key: String,
        school_year: String,
    },
    GetLog {
        key: String,
    },

    Quit,
}

impl RecalcCommand {
    /// Run against the engine. `None` for `Quit`.
    pub fn execute(self, engine: &RecalcEngine) -> BillingResult<Option<Value>> {
        let reply = match self {
            RecalcCommand::Recalculate {
                student_key,
                school_year,
                student_type,
            } => {
                let key = RecalcKey::parse(&student_key, &school_year, student_type.as_deref())?;
                serde_json::to_value(engine.recalculate(&key)?)?
            }
            RecalcCommand::Funding {
                student_key,
                school_year,
            } => {
                let year = SchoolYear::parse(&school_year)?;
                serde_json::to_value(engine.recalculate_funding(&student_key, year)?)?
            }
            RecalcCommand::Upgrade {
                school_year,
                students,
            } => {
                let year = SchoolYear::parse(&school_year)?;
                json!({ "outcomes": engine.upgrade_allocations(year, &students)? })
            }
            RecalcCommand::Sweep { school_year } => {
                let year = SchoolYear::parse(&school_year)?;
                serde_json::to_value(engine.sweep(year)?)?
            }
            RecalcCommand::GetStatus {
                student_key,
                school_year,
            } => {
                let year = SchoolYear::parse(&school_year)?;
                json!({ "projections": engine.projections(&student_key, year)? })
            }
            RecalcCommand::GetFunding {
                student_key,
                school_year,
            } => {
                let year = SchoolYear::parse(&school_year)?;
                json!({ "funding": engine.funding_entry(&student_key, year)? })
            }
            RecalcCommand::GetLog { key } => {
                let entries = engine.store().recalc_log_for(&key)?;
                json!({ "log": entries })
            }
            RecalcCommand::Quit => return Ok(None),
        };
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::BillingError, processor::NoProcessor};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn engine() -> RecalcEngine {
        let now = Utc.with_ymd_and_hms(2025, 9, 20, 18, 0, 0).unwrap();
        RecalcEngine::build_test(Arc::new(NoProcessor), now).unwrap()
    }

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd: RecalcCommand = serde_json::from_str(
            r#"{"cmd":"recalculate","student_key":"s1","school_year":"25/26"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, RecalcCommand::Recalculate { student_type: None, .. }));
    }

    #[test]
    fn malformed_school_year_is_invalid_input() {
        let err = RecalcCommand::Sweep {
            school_year: "2025-26".into(),
        }
        .execute(&engine())
        .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput { field: "school_year", .. }));
    }

    #[test]
    fn quit_has_no_reply() {
        assert!(RecalcCommand::Quit.execute(&engine()).unwrap().is_none());
    }
}
