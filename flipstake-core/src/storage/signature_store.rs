use super::{timestamp, Storage};
use crate::error::Result;
use crate::types::UsedSignature;
use rusqlite::{params, OptionalExtension};

/// Read side of the used-signature ledger.
///
/// Inserts only happen inside [`super::WagerStore::record_deposit`], together
/// with the wager transition they belong to.
pub struct SignatureStore<'a> {
    storage: &'a Storage,
}

impl<'a> SignatureStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn is_used(&self, signature: &str) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM used_signatures WHERE signature = ?1",
            params![signature],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    pub async fn get(&self, signature: &str) -> Result<Option<UsedSignature>> {
        let conn = self.storage.get_connection().await;

        let used = conn
            .query_row(
                "SELECT signature, payer, purpose, used_at FROM used_signatures
                 WHERE signature = ?1",
                params![signature],
                |row| {
                    Ok(UsedSignature {
                        signature: row.get(0)?,
                        payer: row.get(1)?,
                        purpose: row.get(2)?,
                        used_at: timestamp(row.get(3)?),
                    })
                },
            )
            .optional()?;

        Ok(used)
    }
}
