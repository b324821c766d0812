use super::{parse_column, timestamp, Storage};
use crate::error::Result;
use crate::types::{EntropyToken, LegStatus, OutcomeRecord, SettlementLeg};
use bitcoin::Amount;
use rusqlite::{params, OptionalExtension};

/// Immutable outcome rows and the append-only settlement leg journal.
pub struct OutcomeStore<'a> {
    storage: &'a Storage,
}

impl<'a> OutcomeStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Fails with a constraint violation if the wager already has an outcome.
    pub async fn insert(&self, outcome: &OutcomeRecord) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT INTO outcomes (wager_id, entropy_height, entropy, digest, side, winner, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                outcome.wager_id,
                outcome.entropy.height,
                outcome.entropy.value,
                outcome.digest,
                outcome.side.as_str(),
                outcome.winner.as_str(),
                outcome.created_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    pub async fn load(&self, wager_id: &str) -> Result<Option<OutcomeRecord>> {
        let conn = self.storage.get_connection().await;

        let outcome = conn
            .query_row(
                "SELECT wager_id, entropy_height, entropy, digest, side, winner, created_at
                 FROM outcomes WHERE wager_id = ?1",
                params![wager_id],
                |row| {
                    let side: String = row.get(4)?;
                    let winner: String = row.get(5)?;
                    Ok(OutcomeRecord {
                        wager_id: row.get(0)?,
                        entropy: EntropyToken {
                            height: row.get(1)?,
                            value: row.get(2)?,
                        },
                        digest: row.get(3)?,
                        side: parse_column(4, &side)?,
                        winner: parse_column(5, &winner)?,
                        created_at: timestamp(row.get(6)?),
                    })
                },
            )
            .optional()?;

        Ok(outcome)
    }

    pub async fn append_leg(&self, leg: &SettlementLeg) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT INTO settlement_legs (wager_id, seq, kind, from_address, to_address, amount,
                signature, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                leg.wager_id,
                leg.seq,
                leg.kind.as_str(),
                leg.from_address,
                leg.to_address,
                leg.amount.to_sat() as i64,
                leg.signature,
                leg.status.as_str(),
                leg.error,
                leg.created_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    /// Records how a pending leg ended. Only pending legs can change.
    pub async fn finish_leg(
        &self,
        wager_id: &str,
        seq: u32,
        status: LegStatus,
        amount: Amount,
        signature: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "UPDATE settlement_legs SET status = ?3, amount = ?4, signature = ?5, error = ?6
             WHERE wager_id = ?1 AND seq = ?2 AND status = 'pending'",
            params![
                wager_id,
                seq,
                status.as_str(),
                amount.to_sat() as i64,
                signature,
                error
            ],
        )?;

        Ok(())
    }

    pub async fn legs_for(&self, wager_id: &str) -> Result<Vec<SettlementLeg>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT wager_id, seq, kind, from_address, to_address, amount, signature, status,
                error, created_at
             FROM settlement_legs WHERE wager_id = ?1 ORDER BY seq ASC",
        )?;
        let legs = stmt
            .query_map(params![wager_id], |row| {
                let kind: String = row.get(2)?;
                let status: String = row.get(7)?;
                Ok(SettlementLeg {
                    wager_id: row.get(0)?,
                    seq: row.get(1)?,
                    kind: parse_column(2, &kind)?,
                    from_address: row.get(3)?,
                    to_address: row.get(4)?,
                    amount: Amount::from_sat(row.get::<_, i64>(5)? as u64),
                    signature: row.get(6)?,
                    status: parse_column(7, &status)?,
                    error: row.get(8)?,
                    created_at: timestamp(row.get(9)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(legs)
    }
}
