//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Rule modules and the engine call store methods; they never execute SQL
//! directly.
//!
//! Upstream facts (students, registrations, enrollments, overrides, paid
//! credits) are read-only to the engine. The seed helpers that write them
//! exist for the runner and tests.

use crate::{
    error::BillingResult,
    processor::PaymentHandle,
    status::PaymentType,
    types::{CourseId, SchoolYear, StudentKey, TypeKey},
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef},
    Connection, ToSql, Transaction, TransactionBehavior,
};
use std::fmt::Display;
use std::str::FromStr;

mod enrollment;
mod funding;
mod overrides;
mod projection;
mod recalc_log;

pub struct BillingStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl BillingStore {
    pub fn open(path: &str) -> BillingResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> BillingResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> BillingResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// True when `reopen` reaches the same data.
    pub fn is_file_backed(&self) -> bool {
        self.path.is_some()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> BillingResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_billing.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_funding.sql"))?;
        Ok(())
    }

    /// Run `f` inside one transaction. Committed only if `f` returns Ok;
    /// any error rolls back everything `f` wrote. Not reentrant.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> BillingResult<T>,
    ) -> BillingResult<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    /// Like [`in_transaction`](Self::in_transaction) but takes the write lock
    /// at BEGIN. Use it for writes that read first, so a concurrent commit
    /// makes this one wait on the busy timeout instead of failing on the lock
    /// upgrade.
    pub fn in_write_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> BillingResult<T>,
    ) -> BillingResult<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }
}

// ── Column conversions ────────────────────────────────────────────

impl ToSql for SchoolYear {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for SchoolYear {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        SchoolYear::parse(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Parse a TEXT column holding a `FromStr` value (decimals, status codes).
pub(crate) fn parse_col<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("column {idx}: {e}").into(),
        )
    })
}

/// JSON TEXT column into a serde type.
pub(crate) fn json_col<T: serde::de::DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

pub(crate) fn payment_type_str(t: PaymentType) -> &'static str {
    match t {
        PaymentType::Subscription => "subscription",
        PaymentType::OneTime => "one_time",
        PaymentType::Manual => "manual",
        PaymentType::Carryover => "carryover",
        PaymentType::Credits => "credits",
    }
}

pub(crate) fn parse_payment_type(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<PaymentType>> {
    raw.map(|r| {
        Ok(match r.as_str() {
            "subscription" => PaymentType::Subscription,
            "one_time" => PaymentType::OneTime,
            "manual" => PaymentType::Manual,
            "carryover" => PaymentType::Carryover,
            "credits" => PaymentType::Credits,
            other => {
                return Err(rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    Type::Text,
                    format!("unknown payment type '{other}'").into(),
                ))
            }
        })
    })
    .transpose()
}

// ── Rows ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRow {
    pub student_key: StudentKey,
    /// As received upstream; parsed by the funding calculator.
    pub birthday: Option<String>,
    pub family_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRow {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRow {
    pub student_key: StudentKey,
    pub course_id: CourseId,
    pub school_year: SchoolYear,
    /// Student-type label as received.
    pub student_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub scheduled_start: Option<NaiveDate>,
    pub payment_handle: Option<PaymentHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditLimitOverrideRow {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    pub student_type: TypeKey,
    pub additional_free_credits: u32,
    pub reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseOverrideRow {
    pub student_key: StudentKey,
    pub school_year: SchoolYear,
    pub student_type: TypeKey,
    pub course_id: CourseId,
    pub is_paid: bool,
    pub reason: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A processor-confirmed payment for a course in another school year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorPaymentRow {
    pub course_id: CourseId,
    pub school_year: SchoolYear,
    pub payment_type: Option<PaymentType>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BillingStore {
        let s = BillingStore::in_memory().unwrap();
        s.migrate().unwrap();
        s
    }

    #[test]
    fn migrations_are_rerunnable() {
        let s = store();
        s.migrate().expect("second migrate must be a no-op");
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let s = store();
        let student = StudentRow {
            student_key: "s1".into(),
            birthday: None,
            family_id: None,
        };
        let result: BillingResult<()> = s.in_transaction(|tx| {
            tx.upsert_student(&student)?;
            Err(crate::error::BillingError::invalid("test", "abort"))
        });
        assert!(result.is_err());
        assert!(s.get_student("s1").unwrap().is_none());

        s.in_transaction(|tx| tx.upsert_student(&student)).unwrap();
        assert!(s.get_student("s1").unwrap().is_some());
    }

    #[test]
    fn write_transaction_holds_the_lock_from_begin() {
        let path = std::env::temp_dir().join(format!("store-write-{}.db", uuid::Uuid::new_v4()));
        let path = path.to_str().unwrap().to_string();
        {
            let writer = BillingStore::open(&path).unwrap();
            writer.migrate().unwrap();
            let other = BillingStore::open(&path).unwrap();
            other.conn.busy_timeout(std::time::Duration::ZERO).unwrap();

            writer
                .in_write_transaction(|_| {
                    // Nothing written yet, the lock is already taken.
                    assert!(other.conn.execute_batch("BEGIN IMMEDIATE; COMMIT;").is_err());
                    Ok(())
                })
                .unwrap();
            other.conn.execute_batch("BEGIN IMMEDIATE; COMMIT;").unwrap();

            let student = StudentRow {
                student_key: "s1".into(),
                birthday: None,
                family_id: None,
            };
            let result: BillingResult<()> = writer.in_write_transaction(|tx| {
                tx.upsert_student(&student)?;
                Err(crate::error::BillingError::invalid("test", "abort"))
            });
            assert!(result.is_err());
            assert!(other.get_student("s1").unwrap().is_none());
            writer.in_write_transaction(|tx| tx.upsert_student(&student)).unwrap();
            assert!(other.get_student("s1").unwrap().is_some());
        }
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path}{suffix}"));
        }
    }
}
