//! Derived projection, carryover list and processor state cache.
//!
//! These are the only tables the recalculation engine writes for billing.

use super::{
    json_col, parse_col, parse_payment_type, payment_type_str, BillingStore, PriorPaymentRow,
};
use crate::{
    course_payment::{CarryoverAppend, ProcessorStateUpdate},
    error::BillingResult,
    status::{DetailedStatus, EnrollmentPaymentStatus},
    types::{CourseId, SchoolYear},
};
use rusqlite::{params, OptionalExtension, Row};

const PROJECTION_COLUMNS: &str = "student_key, school_year, course_id, student_type, is_paid,
     status, detailed_status, payment_type, last_updated, details_json";

fn projection_from_row(r: &Row<'_>) -> rusqlite::Result<EnrollmentPaymentStatus> {
    Ok(EnrollmentPaymentStatus {
        student_key: r.get(0)?,
        school_year: r.get(1)?,
        course_id: r.get(2)?,
        student_type: r.get(3)?,
        is_paid: r.get(4)?,
        status: parse_col(5, r.get(5)?)?,
        detailed_status: parse_col(6, r.get(6)?)?,
        payment_type: parse_payment_type(7, r.get(7)?)?,
        last_updated: r.get(8)?,
        details: json_col(9, r.get(9)?)?,
    })
}

impl BillingStore {
    // ── Projection ─────────────────────────────────────────────

    pub fn upsert_projection(&self, p: &EnrollmentPaymentStatus) -> BillingResult<()> {
        let details = serde_json::to_string(&p.details)?;
        self.conn.execute(
            "INSERT INTO enrollment_payment_status
                (student_key, school_year, course_id, student_type, is_paid,
                 status, detailed_status, payment_type, last_updated, details_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(student_key, course_id, school_year) DO UPDATE SET
                student_type=excluded.student_type,
                is_paid=excluded.is_paid,
                status=excluded.status,
                detailed_status=excluded.detailed_status,
                payment_type=excluded.payment_type,
                last_updated=excluded.last_updated,
                details_json=excluded.details_json",
            params![
                p.student_key,
                p.school_year,
                p.course_id,
                p.student_type,
                p.is_paid,
                p.status.as_str(),
                p.detailed_status.to_string(),
                p.payment_type.map(payment_type_str),
                p.last_updated,
                details,
            ],
        )?;
        Ok(())
    }

    /// Remove one projection row. Returns whether a row existed.
    pub fn delete_projection(
        &self,
        student_key: &str,
        school_year: SchoolYear,
        course_id: CourseId,
    ) -> BillingResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM enrollment_payment_status
             WHERE student_key=?1 AND school_year=?2 AND course_id=?3",
            params![student_key, school_year, course_id],
        )?;
        Ok(n > 0)
    }

    /// All projections of a student in a year, by course id.
    pub fn projections_for(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Vec<EnrollmentPaymentStatus>> {
        let sql = format!(
            "SELECT {PROJECTION_COLUMNS} FROM enrollment_payment_status
             WHERE student_key=?1 AND school_year=?2 ORDER BY course_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![student_key, school_year], projection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_projection(
        &self,
        student_key: &str,
        school_year: SchoolYear,
        course_id: CourseId,
    ) -> BillingResult<Option<EnrollmentPaymentStatus>> {
        let sql = format!(
            "SELECT {PROJECTION_COLUMNS} FROM enrollment_payment_status
             WHERE student_key=?1 AND school_year=?2 AND course_id=?3"
        );
        Ok(self
            .conn
            .query_row(&sql, params![student_key, school_year, course_id], projection_from_row)
            .optional()?)
    }

    /// Processor-confirmed payments for this student in other school years,
    /// earliest year first per course.
    pub fn prior_payments(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Vec<PriorPaymentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT course_id, school_year, payment_type, last_updated
             FROM enrollment_payment_status
             WHERE student_key=?1 AND school_year<>?2 AND detailed_status=?3",
        )?;
        let mut rows = stmt
            .query_map(
                params![student_key, school_year, DetailedStatus::Paid.to_string()],
                |r| {
                    Ok(PriorPaymentRow {
                        course_id: r.get(0)?,
                        school_year: r.get(1)?,
                        payment_type: parse_payment_type(2, r.get(2)?)?,
                        last_updated: r.get(3)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by_key(|p| (p.course_id, p.school_year));
        Ok(rows)
    }

    // ── Carryover ──────────────────────────────────────────────

    /// Append once. Returns false when the year was already recorded.
    pub fn append_carryover(&self, c: &CarryoverAppend) -> BillingResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO course_carryover (student_key, course_id, original_year, carried_year)
             VALUES (?1, ?2, ?3, ?4)",
            params![c.student_key, c.course_id, c.original_year, c.carried_year],
        )?;
        Ok(n > 0)
    }

    pub fn carryovers_for(
        &self,
        student_key: &str,
        course_id: CourseId,
    ) -> BillingResult<Vec<CarryoverAppend>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_key, course_id, original_year, carried_year
             FROM course_carryover WHERE student_key=?1 AND course_id=?2
             ORDER BY original_year, carried_year",
        )?;
        let rows = stmt
            .query_map(params![student_key, course_id], |r| {
                Ok(CarryoverAppend {
                    student_key: r.get(0)?,
                    course_id: r.get(1)?,
                    original_year: r.get(2)?,
                    carried_year: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Processor state cache ──────────────────────────────────

    pub fn upsert_processor_state(&self, s: &ProcessorStateUpdate) -> BillingResult<()> {
        let json = serde_json::to_string(s)?;
        self.conn.execute(
            "INSERT INTO processor_state_cache (student_key, school_year, course_id, state_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(student_key, school_year, course_id) DO UPDATE SET state_json=excluded.state_json",
            params![s.student_key, s.school_year, s.course_id, json],
        )?;
        Ok(())
    }

    pub fn cached_processor_states(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Vec<ProcessorStateUpdate>> {
        let mut stmt = self.conn.prepare(
            "SELECT state_json FROM processor_state_cache
             WHERE student_key=?1 AND school_year=?2 ORDER BY course_id",
        )?;
        let rows = stmt
            .query_map(params![student_key, school_year], |r| json_col(0, r.get(0)?))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
