use super::{is_constraint_violation, parse_column, timestamp, Storage};
use crate::error::{FlipstakeError, Result};
use crate::types::{
    EscrowRef, Participant, RetiredEscrow, Role, UsedSignature, Wager, WagerStatus,
};
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const WAGER_COLUMNS: &str = "id, stake, status, version, creator_side, creator_wallet,
    creator_escrow, creator_secret, creator_deposit, acceptor_side, acceptor_wallet,
    acceptor_escrow, acceptor_secret, acceptor_deposit, created_at, accepting_at, updated_at";

/// Result of the atomic signature-insert plus deposit transition.
#[derive(Debug)]
pub enum DepositRecord {
    Recorded(Wager),
    /// The signature was already consumed; nothing changed.
    SignatureUsed,
    /// The wager left the expected state before the write; nothing changed.
    StateChanged,
}

pub struct WagerStore<'a> {
    storage: &'a Storage,
}

impl<'a> WagerStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn insert(&self, wager: &Wager) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT INTO wagers (id, stake, status, version, creator_side, creator_wallet,
                creator_escrow, creator_secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                wager.id,
                wager.stake.to_sat() as i64,
                wager.status.as_str(),
                wager.version,
                wager.creator.side.as_str(),
                wager.creator.wallet,
                wager.creator_escrow.address,
                wager.creator_escrow.encrypted_secret,
                wager.created_at.timestamp(),
                wager.updated_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    pub async fn load(&self, wager_id: &str) -> Result<Wager> {
        let conn = self.storage.get_connection().await;
        load_wager(&conn, wager_id)
    }

    pub async fn list_by_status(&self, status: WagerStatus, limit: usize) -> Result<Vec<Wager>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wagers WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
            WAGER_COLUMNS
        ))?;
        let wagers = stmt
            .query_map(params![status.as_str(), limit as i64], wager_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(wagers)
    }

    /// Open wagers whose creator deposit is confirmed, oldest first.
    pub async fn list_claimable(&self, limit: usize) -> Result<Vec<Wager>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wagers WHERE status = 'open' AND creator_deposit IS NOT NULL
             ORDER BY created_at ASC, id ASC LIMIT ?1",
            WAGER_COLUMNS
        ))?;
        let wagers = stmt
            .query_map(params![limit as i64], wager_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(wagers)
    }

    /// Claims still waiting for an acceptor deposit since before `cutoff`.
    pub async fn list_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT id FROM wagers
             WHERE status = 'accepting' AND acceptor_deposit IS NULL AND accepting_at <= ?1
             ORDER BY accepting_at ASC",
        )?;
        let ids = stmt
            .query_map(params![cutoff.timestamp()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        Ok(ids)
    }

    /// Compare-and-set claim: Open (with confirmed creator deposit) -> Accepting.
    ///
    /// Returns `None` when another claim won or the wager is no longer open.
    pub async fn claim(
        &self,
        wager_id: &str,
        acceptor: &Participant,
        escrow: &EscrowRef,
    ) -> Result<Option<Wager>> {
        let conn = self.storage.get_connection().await;
        let now = Utc::now().timestamp();

        let changed = conn.execute(
            "UPDATE wagers SET
                status = 'accepting',
                acceptor_side = ?2,
                acceptor_wallet = ?3,
                acceptor_escrow = ?4,
                acceptor_secret = ?5,
                accepting_at = ?6,
                updated_at = ?6,
                version = version + 1
             WHERE id = ?1 AND status = 'open' AND creator_deposit IS NOT NULL",
            params![
                wager_id,
                acceptor.side.as_str(),
                acceptor.wallet,
                escrow.address,
                escrow.encrypted_secret,
                now,
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        load_wager(&conn, wager_id).map(Some)
    }

    /// Consumes `used.signature` and records it as `role`'s deposit in one
    /// transaction, moving the wager from `from` to `to`.
    ///
    /// `escrow_address` is the escrow the deposit was verified against. The
    /// write only lands while that escrow is still attached to `role`, so a
    /// deposit for a released claim cannot be credited to a later one.
    pub async fn record_deposit(
        &self,
        wager_id: &str,
        role: Role,
        escrow_address: &str,
        used: &UsedSignature,
        from: WagerStatus,
        to: WagerStatus,
    ) -> Result<DepositRecord> {
        let conn = self.storage.get_connection().await;
        let tx = conn.unchecked_transaction()?;

        let inserted = tx.execute(
            "INSERT INTO used_signatures (signature, payer, purpose, used_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                used.signature,
                used.payer,
                used.purpose,
                used.used_at.timestamp()
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Ok(DepositRecord::SignatureUsed),
            Err(e) => return Err(e.into()),
        }

        let sql = match role {
            Role::Creator => {
                "UPDATE wagers SET creator_deposit = ?2, status = ?3, updated_at = ?5,
                    version = version + 1
                 WHERE id = ?1 AND status = ?4 AND creator_deposit IS NULL
                    AND creator_escrow = ?6"
            }
            Role::Acceptor => {
                "UPDATE wagers SET acceptor_deposit = ?2, status = ?3, updated_at = ?5,
                    version = version + 1
                 WHERE id = ?1 AND status = ?4 AND acceptor_deposit IS NULL
                    AND acceptor_escrow = ?6"
            }
        };
        let changed = tx.execute(
            sql,
            params![
                wager_id,
                used.signature,
                to.as_str(),
                from.as_str(),
                Utc::now().timestamp(),
                escrow_address
            ],
        )?;

        if changed == 0 {
            // dropping the transaction rolls back the signature insert
            return Ok(DepositRecord::StateChanged);
        }

        tx.commit()?;
        load_wager(&conn, wager_id).map(DepositRecord::Recorded)
    }

    /// Accepting -> Open for a claim whose acceptor never deposited.
    ///
    /// With a `cutoff`, only claims older than it are released. The detached
    /// escrow is moved to `retired_escrows`; it is never attached again.
    pub async fn release_claim(
        &self,
        wager_id: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<RetiredEscrow>> {
        let conn = self.storage.get_connection().await;
        let tx = conn.unchecked_transaction()?;
        let cutoff = cutoff.map(|c| c.timestamp()).unwrap_or(i64::MAX);

        let claim = tx
            .query_row(
                "SELECT acceptor_escrow, acceptor_secret, version FROM wagers
                 WHERE id = ?1 AND status = 'accepting' AND acceptor_deposit IS NULL
                    AND accepting_at <= ?2",
                params![wager_id, cutoff],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((address, encrypted_secret, version)) = claim else {
            return Ok(None);
        };

        let now = Utc::now();
        tx.execute(
            "INSERT INTO retired_escrows (address, wager_id, encrypted_secret, retired_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![address, wager_id, encrypted_secret, now.timestamp()],
        )?;
        let changed = tx.execute(
            "UPDATE wagers SET
                status = 'open',
                acceptor_side = NULL,
                acceptor_wallet = NULL,
                acceptor_escrow = NULL,
                acceptor_secret = NULL,
                accepting_at = NULL,
                updated_at = ?3,
                version = version + 1
             WHERE id = ?1 AND version = ?2",
            params![wager_id, version, now.timestamp()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.commit()?;

        Ok(Some(RetiredEscrow {
            wager_id: wager_id.to_string(),
            escrow: EscrowRef {
                address,
                encrypted_secret,
            },
            retired_at: now,
            needs_recovery: false,
        }))
    }

    /// Plain status transition guarded on the current status.
    pub async fn transition(
        &self,
        wager_id: &str,
        from: WagerStatus,
        to: WagerStatus,
    ) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        let changed = conn.execute(
            "UPDATE wagers SET status = ?3, updated_at = ?4, version = version + 1
             WHERE id = ?1 AND status = ?2",
            params![wager_id, from.as_str(), to.as_str(), Utc::now().timestamp()],
        )?;

        Ok(changed == 1)
    }

    pub async fn flag_for_recovery(&self, address: &str) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "UPDATE retired_escrows SET needs_recovery = 1 WHERE address = ?1",
            params![address],
        )?;

        Ok(())
    }

    pub async fn list_retired(&self) -> Result<Vec<RetiredEscrow>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT address, wager_id, encrypted_secret, retired_at, needs_recovery
             FROM retired_escrows ORDER BY retired_at ASC",
        )?;
        let retired = stmt
            .query_map([], |row| {
                Ok(RetiredEscrow {
                    escrow: EscrowRef {
                        address: row.get(0)?,
                        encrypted_secret: row.get(2)?,
                    },
                    wager_id: row.get(1)?,
                    retired_at: timestamp(row.get(3)?),
                    needs_recovery: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(retired)
    }
}

fn load_wager(conn: &Connection, wager_id: &str) -> Result<Wager> {
    conn.query_row(
        &format!("SELECT {} FROM wagers WHERE id = ?1", WAGER_COLUMNS),
        params![wager_id],
        wager_from_row,
    )
    .optional()?
    .ok_or_else(|| FlipstakeError::WagerNotFound {
        id: wager_id.to_string(),
    })
}

fn wager_from_row(row: &Row<'_>) -> rusqlite::Result<Wager> {
    let status: String = row.get(2)?;
    let creator_side: String = row.get(4)?;
    let acceptor_side: Option<String> = row.get(9)?;
    let acceptor_wallet: Option<String> = row.get(10)?;
    let acceptor_escrow: Option<String> = row.get(11)?;
    let acceptor_secret: Option<Vec<u8>> = row.get(12)?;

    let acceptor = match (acceptor_side, acceptor_wallet) {
        (Some(side), Some(wallet)) => Some(Participant {
            side: parse_column(9, &side)?,
            wallet,
        }),
        _ => None,
    };
    let acceptor_escrow = match (acceptor_escrow, acceptor_secret) {
        (Some(address), Some(encrypted_secret)) => Some(EscrowRef {
            address,
            encrypted_secret,
        }),
        _ => None,
    };

    Ok(Wager {
        id: row.get(0)?,
        stake: Amount::from_sat(row.get::<_, i64>(1)? as u64),
        status: parse_column(2, &status)?,
        version: row.get(3)?,
        creator: Participant {
            side: parse_column(4, &creator_side)?,
            wallet: row.get(5)?,
        },
        creator_escrow: EscrowRef {
            address: row.get(6)?,
            encrypted_secret: row.get(7)?,
        },
        creator_deposit: row.get(8)?,
        acceptor,
        acceptor_escrow,
        acceptor_deposit: row.get(13)?,
        created_at: timestamp(row.get(14)?),
        accepting_at: row.get::<_, Option<i64>>(15)?.map(timestamp),
        updated_at: timestamp(row.get(16)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_storage;
    use crate::storage::SignatureStore;
    use crate::types::Side;

    fn wager(id: &str) -> Wager {
        let now = Utc::now();
        Wager {
            id: id.to_string(),
            stake: Amount::from_sat(1_000_000),
            status: WagerStatus::Open,
            version: 0,
            creator: Participant {
                side: Side::Heads,
                wallet: "creator-wallet".to_string(),
            },
            creator_escrow: EscrowRef {
                address: format!("{}-creator-escrow", id),
                encrypted_secret: vec![1, 2, 3],
            },
            creator_deposit: None,
            acceptor: None,
            acceptor_escrow: None,
            acceptor_deposit: None,
            created_at: now,
            accepting_at: None,
            updated_at: now,
        }
    }

    fn used(signature: &str) -> UsedSignature {
        UsedSignature {
            signature: signature.to_string(),
            payer: "creator-wallet".to_string(),
            purpose: "creator_deposit".to_string(),
            used_at: Utc::now(),
        }
    }

    fn acceptor() -> (Participant, EscrowRef) {
        (
            Participant {
                side: Side::Tails,
                wallet: "acceptor-wallet".to_string(),
            },
            EscrowRef {
                address: "acceptor-escrow".to_string(),
                encrypted_secret: vec![9],
            },
        )
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let (storage, _dir) = temp_storage().await;
        let store = WagerStore::new(&storage);
        store.insert(&wager("wager_a")).await.unwrap();

        let loaded = store.load("wager_a").await.unwrap();
        assert_eq!(loaded.status, WagerStatus::Open);
        assert_eq!(loaded.creator.side, Side::Heads);
        assert_eq!(loaded.creator_escrow.encrypted_secret, vec![1, 2, 3]);
        assert!(loaded.acceptor.is_none());

        let missing = store.load("wager_missing").await;
        assert!(matches!(missing, Err(FlipstakeError::WagerNotFound { .. })));
    }

    #[tokio::test]
    async fn test_claim_requires_confirmed_creator_deposit() {
        let (storage, _dir) = temp_storage().await;
        let store = WagerStore::new(&storage);
        store.insert(&wager("wager_a")).await.unwrap();
        let (participant, escrow) = acceptor();

        assert!(store
            .claim("wager_a", &participant, &escrow)
            .await
            .unwrap()
            .is_none());

        store
            .record_deposit(
                "wager_a",
                Role::Creator,
                "wager_a-creator-escrow",
                &used("sig-1"),
                WagerStatus::Open,
                WagerStatus::Open,
            )
            .await
            .unwrap();

        let claimed = store
            .claim("wager_a", &participant, &escrow)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, WagerStatus::Accepting);
        assert_eq!(claimed.version, 2);

        // second claim loses the compare-and-set
        let other = EscrowRef {
            address: "other-escrow".to_string(),
            encrypted_secret: vec![],
        };
        assert!(store
            .claim("wager_a", &participant, &other)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_record_deposit_rejects_reused_signature() {
        let (storage, _dir) = temp_storage().await;
        let store = WagerStore::new(&storage);
        store.insert(&wager("wager_a")).await.unwrap();
        store.insert(&wager("wager_b")).await.unwrap();

        let first = store
            .record_deposit(
                "wager_a",
                Role::Creator,
                "wager_a-creator-escrow",
                &used("sig-1"),
                WagerStatus::Open,
                WagerStatus::Open,
            )
            .await
            .unwrap();
        assert!(matches!(first, DepositRecord::Recorded(_)));

        let replay = store
            .record_deposit(
                "wager_b",
                Role::Creator,
                "wager_b-creator-escrow",
                &used("sig-1"),
                WagerStatus::Open,
                WagerStatus::Open,
            )
            .await
            .unwrap();
        assert!(matches!(replay, DepositRecord::SignatureUsed));
        assert!(store.load("wager_b").await.unwrap().creator_deposit.is_none());
    }

    #[tokio::test]
    async fn test_state_change_rolls_back_signature() {
        let (storage, _dir) = temp_storage().await;
        let store = WagerStore::new(&storage);
        store.insert(&wager("wager_a")).await.unwrap();

        // acceptor deposit on a wager nobody claimed
        let result = store
            .record_deposit(
                "wager_a",
                Role::Acceptor,
                "acceptor-escrow",
                &used("sig-2"),
                WagerStatus::Accepting,
                WagerStatus::Settling,
            )
            .await
            .unwrap();
        assert!(matches!(result, DepositRecord::StateChanged));
        assert!(!SignatureStore::new(&storage).is_used("sig-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_deposit_for_released_claim_is_not_credited_to_next_claim() {
        let (storage, _dir) = temp_storage().await;
        let store = WagerStore::new(&storage);
        store.insert(&wager("wager_a")).await.unwrap();
        store
            .record_deposit(
                "wager_a",
                Role::Creator,
                "wager_a-creator-escrow",
                &used("sig-1"),
                WagerStatus::Open,
                WagerStatus::Open,
            )
            .await
            .unwrap();

        let (participant, escrow) = acceptor();
        store.claim("wager_a", &participant, &escrow).await.unwrap();
        store.release_claim("wager_a", None).await.unwrap().unwrap();

        let next = EscrowRef {
            address: "next-escrow".to_string(),
            encrypted_secret: vec![7],
        };
        store.claim("wager_a", &participant, &next).await.unwrap().unwrap();

        // verified against the released escrow
        let late = store
            .record_deposit(
                "wager_a",
                Role::Acceptor,
                "acceptor-escrow",
                &used("sig-late"),
                WagerStatus::Accepting,
                WagerStatus::Settling,
            )
            .await
            .unwrap();
        assert!(matches!(late, DepositRecord::StateChanged));

        let wager = store.load("wager_a").await.unwrap();
        assert_eq!(wager.status, WagerStatus::Accepting);
        assert!(wager.acceptor_deposit.is_none());
        assert!(!SignatureStore::new(&storage).is_used("sig-late").await.unwrap());

        // the creator escrow check holds as well
        store.insert(&self::wager("wager_b")).await.unwrap();
        let wrong = store
            .record_deposit(
                "wager_b",
                Role::Creator,
                "some-other-escrow",
                &used("sig-other"),
                WagerStatus::Open,
                WagerStatus::Open,
            )
            .await
            .unwrap();
        assert!(matches!(wrong, DepositRecord::StateChanged));
        assert!(store.load("wager_b").await.unwrap().creator_deposit.is_none());
    }

    #[tokio::test]
    async fn test_release_claim_retires_escrow() {
        let (storage, _dir) = temp_storage().await;
        let store = WagerStore::new(&storage);
        store.insert(&wager("wager_a")).await.unwrap();
        store
            .record_deposit(
                "wager_a",
                Role::Creator,
                "wager_a-creator-escrow",
                &used("sig-1"),
                WagerStatus::Open,
                WagerStatus::Open,
            )
            .await
            .unwrap();
        let (participant, escrow) = acceptor();
        store.claim("wager_a", &participant, &escrow).await.unwrap();

        // not stale yet
        let past = Utc::now() - chrono::Duration::minutes(5);
        assert!(store.release_claim("wager_a", Some(past)).await.unwrap().is_none());

        let retired = store.release_claim("wager_a", None).await.unwrap().unwrap();
        assert_eq!(retired.escrow.address, "acceptor-escrow");

        let reopened = store.load("wager_a").await.unwrap();
        assert_eq!(reopened.status, WagerStatus::Open);
        assert!(reopened.acceptor.is_none());
        assert!(reopened.acceptor_escrow.is_none());
        assert_eq!(reopened.creator_deposit.as_deref(), Some("sig-1"));

        store.flag_for_recovery("acceptor-escrow").await.unwrap();
        let retired = store.list_retired().await.unwrap();
        assert_eq!(retired.len(), 1);
        assert!(retired[0].needs_recovery);
    }

    #[tokio::test]
    async fn test_transition_is_guarded() {
        let (storage, _dir) = temp_storage().await;
        let store = WagerStore::new(&storage);
        store.insert(&wager("wager_a")).await.unwrap();

        assert!(!store
            .transition("wager_a", WagerStatus::Settling, WagerStatus::Completed)
            .await
            .unwrap());
        assert!(store
            .transition("wager_a", WagerStatus::Open, WagerStatus::Cancelled)
            .await
            .unwrap());
        assert_eq!(
            store.list_by_status(WagerStatus::Cancelled, 10).await.unwrap().len(),
            1
        );
    }
}
