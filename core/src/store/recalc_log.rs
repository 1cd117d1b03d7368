//! Recalc log — invocation audit trail.

use super::BillingStore;
use crate::{error::BillingResult, event::RecalcLogEntry};
use rusqlite::params;

impl BillingStore {
    pub fn append_recalc_log(&self, entry: &RecalcLogEntry) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO recalc_log (invocation_id, invocation, key, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.invocation_id,
                entry.invocation,
                entry.key,
                entry.event_type,
                entry.payload,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    /// Entries for an invocation key, oldest first.
    pub fn recalc_log_for(&self, key: &str) -> BillingResult<Vec<RecalcLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, invocation_id, invocation, key, event_type, payload, created_at
             FROM recalc_log WHERE key=?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![key], |r| {
                Ok(RecalcLogEntry {
                    id: Some(r.get(0)?),
                    invocation_id: r.get(1)?,
                    invocation: r.get(2)?,
                    key: r.get(3)?,
                    event_type: r.get(4)?,
                    payload: r.get(5)?,
                    created_at: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
