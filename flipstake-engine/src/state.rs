use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use flipstake_core::storage::{DepositRecord, WagerStore};
use flipstake_core::{
    EscrowRef, Participant, RetiredEscrow, Role, Storage, UsedSignature, Wager, WagerStatus,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Proof that both deposits are confirmed and the wager moved to `Settling`.
///
/// Only [`WagerStateMachine::lock_stakes`] can produce one, and entropy can
/// only be drawn against one, so the outcome is never derived before both
/// stakes are locked.
#[derive(Debug)]
pub struct LockedStakes {
    wager: Wager,
}

impl LockedStakes {
    pub fn wager(&self) -> &Wager {
        &self.wager
    }

    pub fn wager_id(&self) -> &str {
        &self.wager.id
    }
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Wager),
    /// Another acceptor won, or the wager left `Open`.
    Conflict,
}

/// Sole owner of wager status changes. Every transition is a guarded write
/// in storage; nothing here reads a row and then writes it back.
pub struct WagerStateMachine {
    storage: Arc<Storage>,
}

impl WagerStateMachine {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    fn store(&self) -> WagerStore<'_> {
        WagerStore::new(&self.storage)
    }

    pub async fn create(&self, wager: &Wager) -> Result<()> {
        if wager.status != WagerStatus::Open {
            return Err(EngineError::internal("New wagers must start open"));
        }
        self.store().insert(wager).await?;
        info!("Wager {} created with stake {}", wager.id, wager.stake);
        Ok(())
    }

    pub async fn load(&self, wager_id: &str) -> Result<Wager> {
        Ok(self.store().load(wager_id).await?)
    }

    pub async fn list(&self, status: WagerStatus, limit: usize) -> Result<Vec<Wager>> {
        Ok(self.store().list_by_status(status, limit).await?)
    }

    pub async fn list_claimable(&self, limit: usize) -> Result<Vec<Wager>> {
        Ok(self.store().list_claimable(limit).await?)
    }

    /// Records the creator deposit. The wager stays `Open`.
    pub async fn confirm_creator_deposit(
        &self,
        wager_id: &str,
        escrow_address: &str,
        used: &UsedSignature,
    ) -> Result<Wager> {
        let record = self
            .store()
            .record_deposit(
                wager_id,
                Role::Creator,
                escrow_address,
                used,
                WagerStatus::Open,
                WagerStatus::Open,
            )
            .await?;

        match record {
            DepositRecord::Recorded(wager) => {
                info!("Creator deposit {} confirmed for {}", used.signature, wager_id);
                Ok(wager)
            }
            DepositRecord::SignatureUsed => Err(EngineError::validation("signature already used")),
            DepositRecord::StateChanged => Err(EngineError::validation(
                "wager is not awaiting a creator deposit",
            )),
        }
    }

    /// Records the acceptor deposit and moves Accepting -> Settling.
    ///
    /// Fails with a conflict when `escrow_address` is no longer the claim's
    /// escrow, e.g. the claim was released while the deposit was verified.
    pub async fn lock_stakes(
        &self,
        wager_id: &str,
        escrow_address: &str,
        used: &UsedSignature,
    ) -> Result<LockedStakes> {
        let record = self
            .store()
            .record_deposit(
                wager_id,
                Role::Acceptor,
                escrow_address,
                used,
                WagerStatus::Accepting,
                WagerStatus::Settling,
            )
            .await?;

        match record {
            DepositRecord::Recorded(wager) => {
                info!("Stakes locked for {}", wager_id);
                Ok(LockedStakes { wager })
            }
            DepositRecord::SignatureUsed => Err(EngineError::validation("signature already used")),
            DepositRecord::StateChanged => {
                warn!("Claim on {} ended before its deposit was recorded", wager_id);
                Err(EngineError::conflict(wager_id))
            }
        }
    }

    pub async fn claim(
        &self,
        wager_id: &str,
        acceptor: &Participant,
        escrow: &EscrowRef,
    ) -> Result<ClaimOutcome> {
        match self.store().claim(wager_id, acceptor, escrow).await? {
            Some(wager) => {
                info!("Wager {} claimed by {}", wager_id, acceptor.wallet);
                Ok(ClaimOutcome::Claimed(wager))
            }
            None => {
                debug!("Claim on {} lost", wager_id);
                Ok(ClaimOutcome::Conflict)
            }
        }
    }

    /// Accepting -> Open. With `cutoff`, only claims older than it qualify.
    pub async fn abandon(
        &self,
        wager_id: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<RetiredEscrow>> {
        let retired = self.store().release_claim(wager_id, cutoff).await?;
        if let Some(retired) = &retired {
            info!(
                "Claim on {} released, escrow {} retired",
                wager_id, retired.escrow.address
            );
        }
        Ok(retired)
    }

    /// Open -> Cancelled. `false` if the wager was no longer open.
    pub async fn cancel(&self, wager_id: &str) -> Result<bool> {
        let cancelled = self
            .store()
            .transition(wager_id, WagerStatus::Open, WagerStatus::Cancelled)
            .await?;
        if cancelled {
            info!("Wager {} cancelled", wager_id);
        }
        Ok(cancelled)
    }

    /// Settling -> Completed, consuming the lock.
    pub async fn complete(&self, locked: LockedStakes) -> Result<Wager> {
        let wager_id = locked.wager.id;
        let completed = self
            .store()
            .transition(&wager_id, WagerStatus::Settling, WagerStatus::Completed)
            .await?;
        if !completed {
            return Err(EngineError::internal(format!(
                "Wager {} left settling before completion",
                wager_id
            )));
        }

        info!("Wager {} completed", wager_id);
        self.load(&wager_id).await
    }

    pub async fn stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self.store().list_stale_claims(cutoff).await?)
    }

    pub async fn retired_escrows(&self) -> Result<Vec<RetiredEscrow>> {
        Ok(self.store().list_retired().await?)
    }

    pub async fn flag_for_recovery(&self, address: &str) -> Result<()> {
        Ok(self.store().flag_for_recovery(address).await?)
    }
}
