//! Staff override and paid-credit queries.
//!
//! Overrides are keyed by canonical type key. Revoking keeps the row for
//! audit and clears `active`.

use super::{BillingStore, CourseOverrideRow, CreditLimitOverrideRow};
use crate::{
    error::BillingResult,
    types::{CourseId, SchoolYear, TypeKey},
};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::HashMap;

impl BillingStore {
    // ── Credit-limit override ──────────────────────────────────

    pub fn set_credit_limit_override(&self, row: &CreditLimitOverrideRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO credit_limit_override
                (student_key, school_year, student_type, additional_free_credits,
                 reason, created_by, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
             ON CONFLICT(student_key, school_year, student_type) DO UPDATE SET
                additional_free_credits=excluded.additional_free_credits,
                reason=excluded.reason,
                created_by=excluded.created_by,
                created_at=excluded.created_at,
                active=1",
            params![
                row.student_key,
                row.school_year,
                row.student_type,
                row.additional_free_credits,
                row.reason,
                row.created_by,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn revoke_credit_limit_override(
        &self,
        student_key: &str,
        school_year: SchoolYear,
        type_key: &str,
    ) -> BillingResult<bool> {
        let n = self.conn.execute(
            "UPDATE credit_limit_override SET active=0
             WHERE student_key=?1 AND school_year=?2 AND student_type=?3 AND active=1",
            params![student_key, school_year, type_key],
        )?;
        Ok(n > 0)
    }

    pub fn active_credit_limit_overrides(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Vec<CreditLimitOverrideRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_key, school_year, student_type, additional_free_credits,
                    reason, created_by, created_at
             FROM credit_limit_override
             WHERE student_key=?1 AND school_year=?2 AND active=1
             ORDER BY student_type",
        )?;
        let rows = stmt
            .query_map(params![student_key, school_year], |r| {
                Ok(CreditLimitOverrideRow {
                    student_key: r.get(0)?,
                    school_year: r.get(1)?,
                    student_type: r.get(2)?,
                    additional_free_credits: r.get(3)?,
                    reason: r.get(4)?,
                    created_by: r.get(5)?,
                    created_at: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Course override ────────────────────────────────────────

    pub fn set_course_override(&self, row: &CourseOverrideRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO course_override
                (student_key, school_year, student_type, course_id, is_paid,
                 reason, created_by, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
             ON CONFLICT(student_key, school_year, student_type, course_id) DO UPDATE SET
                is_paid=excluded.is_paid,
                reason=excluded.reason,
                created_by=excluded.created_by,
                created_at=excluded.created_at,
                active=1",
            params![
                row.student_key,
                row.school_year,
                row.student_type,
                row.course_id,
                row.is_paid,
                row.reason,
                row.created_by,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn revoke_course_override(
        &self,
        student_key: &str,
        school_year: SchoolYear,
        type_key: &str,
        course_id: CourseId,
    ) -> BillingResult<bool> {
        let n = self.conn.execute(
            "UPDATE course_override SET active=0
             WHERE student_key=?1 AND school_year=?2 AND student_type=?3 AND course_id=?4 AND active=1",
            params![student_key, school_year, type_key, course_id],
        )?;
        Ok(n > 0)
    }

    pub fn active_course_overrides(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Vec<CourseOverrideRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_key, school_year, student_type, course_id, is_paid,
                    reason, created_by, created_at
             FROM course_override
             WHERE student_key=?1 AND school_year=?2 AND active=1
             ORDER BY student_type, course_id",
        )?;
        let rows = stmt
            .query_map(params![student_key, school_year], |r| {
                Ok(CourseOverrideRow {
                    student_key: r.get(0)?,
                    school_year: r.get(1)?,
                    student_type: r.get(2)?,
                    course_id: r.get(3)?,
                    is_paid: r.get(4)?,
                    reason: r.get(5)?,
                    created_by: r.get(6)?,
                    created_at: r.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Paid credits ───────────────────────────────────────────

    /// Record a paid-credit purchase. Payment path only; the recalculation
    /// engine never calls this.
    pub fn add_paid_credits(
        &self,
        student_key: &str,
        school_year: SchoolYear,
        type_key: &str,
        credits: u32,
        payment_ref: &str,
        created_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO paid_credits (student_key, school_year, student_type, credits, payment_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![student_key, school_year, type_key, credits, payment_ref, created_at],
        )?;
        Ok(())
    }

    /// Paid-credit balance per type key for a student in a year.
    pub fn paid_credit_balances(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<HashMap<TypeKey, u32>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_type, SUM(credits) FROM paid_credits
             WHERE student_key=?1 AND school_year=?2
             GROUP BY student_type",
        )?;
        let balances = stmt
            .query_map(params![student_key, school_year], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(k, sum)| (k, u32::try_from(sum).unwrap_or(u32::MAX)))
            .collect();
        Ok(balances)
    }

    /// Number of purchase rows. Lets tests prove the engine never writes here.
    pub fn paid_credit_row_count(&self) -> BillingResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM paid_credits", [], |r| r.get(0))?)
    }
}
