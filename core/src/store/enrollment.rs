//! Student, registration and enrollment queries.

use super::{BillingStore, EnrollmentRow, RegistrationRow, StudentRow};
use crate::{
    error::BillingResult,
    processor::PaymentHandle,
    types::{CourseId, SchoolYear, StudentKey},
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};

impl BillingStore {
    // ── Student ────────────────────────────────────────────────

    pub fn upsert_student(&self, row: &StudentRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO student (student_key, birthday, family_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(student_key) DO UPDATE SET birthday=excluded.birthday, family_id=excluded.family_id",
            params![row.student_key, row.birthday, row.family_id],
        )?;
        Ok(())
    }

    pub fn get_student(&self, student_key: &str) -> BillingResult<Option<StudentRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT student_key, birthday, family_id FROM student WHERE student_key=?1",
                params![student_key],
                |r| {
                    Ok(StudentRow {
                        student_key: r.get(0)?,
                        birthday: r.get(1)?,
                        family_id: r.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    // ── Registration ───────────────────────────────────────────

    pub fn upsert_registration(&self, row: &RegistrationRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO registration (student_key, school_year, registered_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(student_key, school_year) DO UPDATE SET registered_at=excluded.registered_at",
            params![row.student_key, row.school_year, row.registered_at],
        )?;
        Ok(())
    }

    pub fn get_registration(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Option<RegistrationRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT student_key, school_year, registered_at FROM registration
                 WHERE student_key=?1 AND school_year=?2",
                params![student_key, school_year],
                |r| {
                    Ok(RegistrationRow {
                        student_key: r.get(0)?,
                        school_year: r.get(1)?,
                        registered_at: r.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Students with either an enrollment or a registration in the year.
    pub fn students_for_year(&self, school_year: SchoolYear) -> BillingResult<Vec<StudentKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_key FROM enrollment WHERE school_year=?1
             UNION
             SELECT student_key FROM registration WHERE school_year=?1
             ORDER BY student_key",
        )?;
        let keys = stmt
            .query_map(params![school_year], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Students registered in the year. These are the funding subjects.
    pub fn registered_students(&self, school_year: SchoolYear) -> BillingResult<Vec<StudentKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_key FROM registration WHERE school_year=?1 ORDER BY student_key",
        )?;
        let keys = stmt
            .query_map(params![school_year], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    // ── Enrollment ─────────────────────────────────────────────

    pub fn upsert_enrollment(&self, row: &EnrollmentRow) -> BillingResult<()> {
        let (kind, id) = match &row.payment_handle {
            Some(h) => (Some(h.kind()), Some(h.id())),
            None => (None, None),
        };
        self.conn.execute(
            "INSERT INTO enrollment
                (student_key, school_year, course_id, student_type, created_at,
                 scheduled_start, payment_handle_kind, payment_handle_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(student_key, school_year, course_id) DO UPDATE SET
                student_type=excluded.student_type,
                created_at=excluded.created_at,
                scheduled_start=excluded.scheduled_start,
                payment_handle_kind=excluded.payment_handle_kind,
                payment_handle_id=excluded.payment_handle_id",
            params![
                row.student_key,
                row.school_year,
                row.course_id,
                row.student_type,
                row.created_at,
                row.scheduled_start,
                kind,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_enrollment(
        &self,
        student_key: &str,
        school_year: SchoolYear,
        course_id: CourseId,
    ) -> BillingResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM enrollment WHERE student_key=?1 AND school_year=?2 AND course_id=?3",
            params![student_key, school_year, course_id],
        )?;
        Ok(n > 0)
    }

    /// All enrollments of a student in a year, by course id.
    pub fn enrollments_for(
        &self,
        student_key: &str,
        school_year: SchoolYear,
    ) -> BillingResult<Vec<EnrollmentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_key, course_id, school_year, student_type, created_at,
                    scheduled_start, payment_handle_kind, payment_handle_id
             FROM enrollment WHERE student_key=?1 AND school_year=?2
             ORDER BY course_id",
        )?;
        let raw = stmt
            .query_map(params![student_key, school_year], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, CourseId>(1)?,
                    r.get::<_, SchoolYear>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<DateTime<Utc>>>(4)?,
                    r.get::<_, Option<NaiveDate>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (student_key, course_id, school_year, student_type, created_at, scheduled_start, kind, id) in raw {
            let payment_handle = match (kind, id) {
                (Some(kind), Some(id)) => Some(PaymentHandle::from_parts(&kind, id)?),
                _ => None,
            };
            rows.push(EnrollmentRow {
                student_key,
                course_id,
                school_year,
                student_type,
                created_at,
                scheduled_start,
                payment_handle,
            });
        }
        Ok(rows)
    }
}
