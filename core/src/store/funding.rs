//! Funding entry queries.
//!
//! The scalar columns exist for the family aggregator's SQL; `entry_json`
//! is the authoritative copy read back here.

use super::{json_col, BillingStore};
use crate::{error::BillingResult, funding::FundingEntry, types::SchoolYear};
use rusqlite::{params, OptionalExtension};

impl BillingStore {
    pub fn upsert_funding_entry(&self, e: &FundingEntry) -> BillingResult<()> {
        let json = serde_json::to_string(e)?;
        let a = &e.allocation;
        self.conn.execute(
            "INSERT INTO funding_entry
                (student_key, school_year, age_category, funding_eligible, funding_amount,
                 current_allocation, remaining_allocation, registration_phase,
                 upgrade_eligible_after, upgraded_at, entry_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(student_key, school_year) DO UPDATE SET
                age_category=excluded.age_category,
                funding_eligible=excluded.funding_eligible,
                funding_amount=excluded.funding_amount,
                current_allocation=excluded.current_allocation,
                remaining_allocation=excluded.remaining_allocation,
                registration_phase=excluded.registration_phase,
                upgrade_eligible_after=excluded.upgrade_eligible_after,
                upgraded_at=excluded.upgraded_at,
                entry_json=excluded.entry_json",
            params![
                e.student_key,
                e.school_year,
                e.eligibility.age_category.as_str(),
                e.eligibility.funding_eligible,
                e.eligibility.funding_amount.to_string(),
                a.current_allocation.to_string(),
                a.remaining_allocation.to_string(),
                a.registration_phase.as_str(),
                a.upgrade_eligible_after,
                a.upgraded_at,
                json,
            ],
        )?;
        Ok(())
    }

    pub fn get_funding_entry(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Option<FundingEntry>> {
        Ok(self
            .conn
            .query_row(
                "SELECT entry_json FROM funding_entry WHERE student_key=?1 AND school_year=?2",
                params![student_key, school_year],
                |r| json_col(0, r.get(0)?),
            )
            .optional()?)
    }

    pub fn funding_entries_for_year(&self, school_year: SchoolYear) -> BillingResult<Vec<FundingEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_json FROM funding_entry WHERE school_year=?1 ORDER BY student_key",
        )?;
        let rows = stmt
            .query_map(params![school_year], |r| json_col(0, r.get(0)?))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
