use super::{parse_column, timestamp, Storage};
use crate::error::Result;
use crate::types::AuditEvent;
use bitcoin::Amount;
use rusqlite::params;

pub struct AuditStore<'a> {
    storage: &'a Storage,
}

impl<'a> AuditStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn append(&self, event: &AuditEvent) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT INTO audit_log (wager_id, kind, actor, amount, signature, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.wager_id,
                event.kind.as_str(),
                event.actor,
                event.amount.map(|a| a.to_sat() as i64),
                event.signature,
                event.detail,
                event.at.timestamp(),
            ],
        )?;

        Ok(())
    }

    /// Events for one wager in the order they were written.
    pub async fn events_for(&self, wager_id: &str) -> Result<Vec<AuditEvent>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT wager_id, kind, actor, amount, signature, detail, at
             FROM audit_log WHERE wager_id = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![wager_id], |row| {
                let kind: String = row.get(1)?;
                Ok(AuditEvent {
                    wager_id: row.get(0)?,
                    kind: parse_column(1, &kind)?,
                    actor: row.get(2)?,
                    amount: row
                        .get::<_, Option<i64>>(3)?
                        .map(|sats| Amount::from_sat(sats as u64)),
                    signature: row.get(4)?,
                    detail: row.get(5)?,
                    at: timestamp(row.get(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }
}
