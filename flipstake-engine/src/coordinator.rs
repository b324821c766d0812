use crate::audit::AuditSink;
use crate::error::{EngineError, Result};
use crate::outcome::OutcomeEngine;
use crate::report::{build_report, ConsistencyReport};
use crate::retry::with_backoff;
use crate::settlement::{RefundReport, SettlementExecutor, SettlementReport};
use crate::state::{ClaimOutcome, LockedStakes, WagerStateMachine};
use crate::verifier::{DepositExpectation, DepositVerifier};
use bitcoin::Amount;
use chrono::Utc;
use flipstake_core::escrow::parse_address;
use flipstake_core::storage::OutcomeStore;
use flipstake_core::types::new_wager_id;
use flipstake_core::{
    AuditEvent, AuditKind, EngineConfig, EntropyToken, EscrowProvisioner, NetworkClient,
    OutcomeRecord, Participant, RetiredEscrow, Role, SecretVault, SettlementLeg, Side, Storage,
    Wager, WagerStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedWager {
    pub wager_id: String,
    pub escrow_address: String,
    pub side: Side,
    pub stake: Amount,
    /// Exact amount the creator must send to `escrow_address`.
    pub expected_deposit: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositStatus {
    pub wager_id: String,
    pub status: WagerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptTicket {
    pub wager_id: String,
    pub escrow_address: String,
    pub side: Side,
    pub expected_deposit: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub wager_id: String,
    pub side: Side,
    pub winner: Role,
    pub winner_wallet: String,
    pub payout: Amount,
    pub payout_signature: Option<String>,
    pub entropy_token: EntropyToken,
    pub status: WagerStatus,
    pub settlement: SettlementReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonResult {
    pub wager_id: String,
    pub status: WagerStatus,
    /// Set when the released escrow already held funds.
    pub flagged_for_recovery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    pub wager_id: String,
    pub refund_amount: Amount,
    pub status: WagerStatus,
    pub refund: RefundReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerDetails {
    pub wager: Wager,
    pub outcome: Option<OutcomeRecord>,
    pub legs: Vec<SettlementLeg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeVerification {
    pub wager_id: String,
    pub outcome: OutcomeRecord,
    pub valid: bool,
}

/// Entry point for every wager operation.
///
/// Holds no per-wager state of its own: all coordination goes through guarded
/// storage transitions, so several coordinators may share one database.
pub struct WagerLifecycleCoordinator {
    config: EngineConfig,
    storage: Arc<Storage>,
    network: Arc<dyn NetworkClient>,
    provisioner: Arc<EscrowProvisioner>,
    audit: Arc<dyn AuditSink>,
    state: WagerStateMachine,
    verifier: DepositVerifier,
    outcomes: OutcomeEngine,
    settlement: SettlementExecutor,
}

impl WagerLifecycleCoordinator {
    pub fn new(
        config: EngineConfig,
        storage: Arc<Storage>,
        network: Arc<dyn NetworkClient>,
        vault: Arc<dyn SecretVault>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;

        let provisioner = Arc::new(EscrowProvisioner::new(vault, config.network));
        let state = WagerStateMachine::new(storage.clone());
        let verifier = DepositVerifier::new(storage.clone(), network.clone());
        let outcomes = OutcomeEngine::new(network.clone(), config.retry.clone());
        let settlement = SettlementExecutor::new(
            storage.clone(),
            network.clone(),
            provisioner.clone(),
            audit.clone(),
            config.clone(),
        );

        Ok(Self {
            config,
            storage,
            network,
            provisioner,
            audit,
            state,
            verifier,
            outcomes,
            settlement,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn create_wager(
        &self,
        side: Side,
        stake: Amount,
        payout_address: &str,
    ) -> Result<CreatedWager> {
        if stake < self.config.min_stake || stake > self.config.max_stake {
            return Err(EngineError::validation(format!(
                "stake must be between {} and {}",
                self.config.min_stake, self.config.max_stake
            )));
        }
        parse_address(payout_address, self.config.network)?;

        let escrow = self.provisioner.provision()?;
        let now = Utc::now();
        let wager = Wager {
            id: new_wager_id(),
            stake,
            status: WagerStatus::Open,
            version: 0,
            creator: Participant {
                side,
                wallet: payout_address.to_string(),
            },
            creator_escrow: escrow,
            creator_deposit: None,
            acceptor: None,
            acceptor_escrow: None,
            acceptor_deposit: None,
            created_at: now,
            accepting_at: None,
            updated_at: now,
        };
        self.state.create(&wager).await?;

        let expected_deposit = self.config.expected_deposit(stake);
        self.audit
            .record(
                AuditEvent::new(&wager.id, AuditKind::WagerCreated)
                    .actor(payout_address)
                    .amount(stake)
                    .detail(format!("side {}", side)),
            )
            .await;

        Ok(CreatedWager {
            wager_id: wager.id,
            escrow_address: wager.creator_escrow.address,
            side,
            stake,
            expected_deposit,
        })
    }

    pub async fn confirm_creator_deposit(
        &self,
        wager_id: &str,
        signature: &str,
    ) -> Result<DepositStatus> {
        let wager = self.state.load(wager_id).await?;
        self.verifier.ensure_unused(signature).await?;

        if wager.status != WagerStatus::Open || wager.creator_deposit.is_some() {
            return Err(EngineError::validation(
                "wager is not awaiting a creator deposit",
            ));
        }

        let expectation = DepositExpectation {
            escrow_address: &wager.creator_escrow.address,
            payer: &wager.creator.wallet,
            amount: self.config.expected_deposit(wager.stake),
            signature,
        };
        let verified = self.verify_with_retry(wager_id, &expectation).await?;
        let amount = verified.amount;

        let wager = self
            .state
            .confirm_creator_deposit(
                wager_id,
                &wager.creator_escrow.address,
                &verified.into_used("creator_deposit"),
            )
            .await?;

        self.audit
            .record(
                AuditEvent::new(wager_id, AuditKind::DepositConfirmed)
                    .actor(&wager.creator.wallet)
                    .amount(amount)
                    .signature(signature)
                    .detail("creator"),
            )
            .await;

        Ok(DepositStatus {
            wager_id: wager.id,
            status: wager.status,
        })
    }

    pub async fn begin_accept(&self, wager_id: &str, payout_address: &str) -> Result<AcceptTicket> {
        parse_address(payout_address, self.config.network)?;
        let wager = self.state.load(wager_id).await?;

        if wager.creator.wallet == payout_address {
            return Err(EngineError::validation("you cannot accept your own wager"));
        }
        if wager.status != WagerStatus::Open || wager.creator_deposit.is_none() {
            self.audit
                .record(
                    AuditEvent::new(wager_id, AuditKind::ClaimConflict)
                        .actor(payout_address)
                        .detail(format!("wager is {}", wager.status)),
                )
                .await;
            return Err(EngineError::conflict(wager_id));
        }

        // Provision before the compare-and-set; no lock is held while the
        // vault runs. A losing claim simply discards this unused escrow.
        let escrow = self.provisioner.provision()?;
        let acceptor = Participant {
            side: wager.creator.side.opposite(),
            wallet: payout_address.to_string(),
        };

        match self.state.claim(wager_id, &acceptor, &escrow).await? {
            ClaimOutcome::Claimed(wager) => {
                self.audit
                    .record(
                        AuditEvent::new(wager_id, AuditKind::ClaimAccepted)
                            .actor(payout_address)
                            .detail(format!("side {}", acceptor.side)),
                    )
                    .await;

                Ok(AcceptTicket {
                    wager_id: wager.id,
                    escrow_address: escrow.address,
                    side: acceptor.side,
                    expected_deposit: self.config.expected_deposit(wager.stake),
                })
            }
            ClaimOutcome::Conflict => {
                self.audit
                    .record(
                        AuditEvent::new(wager_id, AuditKind::ClaimConflict)
                            .actor(payout_address),
                    )
                    .await;
                Err(EngineError::conflict(wager_id))
            }
        }
    }

    pub async fn confirm_acceptor_deposit(
        &self,
        wager_id: &str,
        signature: &str,
    ) -> Result<SettlementOutcome> {
        let wager = self.state.load(wager_id).await?;
        self.verifier.ensure_unused(signature).await?;

        let (acceptor, escrow) = match (&wager.status, &wager.acceptor, &wager.acceptor_escrow) {
            (WagerStatus::Accepting, Some(acceptor), Some(escrow))
                if wager.acceptor_deposit.is_none() =>
            {
                (acceptor, escrow)
            }
            _ => {
                return Err(EngineError::validation(
                    "wager is not awaiting an acceptor deposit",
                ))
            }
        };

        let expectation = DepositExpectation {
            escrow_address: &escrow.address,
            payer: &acceptor.wallet,
            amount: self.config.expected_deposit(wager.stake),
            signature,
        };
        let verified = self.verify_with_retry(wager_id, &expectation).await?;
        let amount = verified.amount;

        let locked = match self
            .state
            .lock_stakes(
                wager_id,
                &escrow.address,
                &verified.into_used("acceptor_deposit"),
            )
            .await
        {
            Ok(locked) => locked,
            Err(EngineError::Conflict { wager_id }) => {
                // The claim was released while the deposit was in flight; the
                // funds now sit in a retired escrow.
                self.flag_escrow(&wager_id, &escrow.address, "deposit arrived after release")
                    .await;
                return Err(EngineError::Conflict { wager_id });
            }
            Err(e) => return Err(e),
        };

        self.audit
            .record(
                AuditEvent::new(wager_id, AuditKind::DepositConfirmed)
                    .actor(&acceptor.wallet)
                    .amount(amount)
                    .signature(signature)
                    .detail("acceptor"),
            )
            .await;
        self.audit
            .record(AuditEvent::new(wager_id, AuditKind::StakesLocked).amount(wager.stake * 2))
            .await;

        // Past this point the wager never rolls back; failures leave it in
        // `Settling` for recovery.
        match self.settle_locked(locked).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ EngineError::SettlementPending { .. }) => Err(e),
            Err(e) => {
                error!("Settlement of {} interrupted: {}", wager_id, e);
                self.audit
                    .record(
                        AuditEvent::new(wager_id, AuditKind::SettlementPending)
                            .detail(e.to_string()),
                    )
                    .await;
                Err(EngineError::SettlementPending {
                    wager_id: wager_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn settle_locked(&self, locked: LockedStakes) -> Result<SettlementOutcome> {
        let wager_id = locked.wager_id().to_string();

        let outcome = self.outcomes.draw(&locked).await?;
        OutcomeStore::new(&self.storage).insert(&outcome).await?;
        self.audit
            .record(
                AuditEvent::new(&wager_id, AuditKind::OutcomeResolved)
                    .detail(format!(
                        "side {} winner {} entropy {}@{} digest {}",
                        outcome.side,
                        outcome.winner,
                        outcome.entropy.value,
                        outcome.entropy.height,
                        outcome.digest
                    )),
            )
            .await;

        let winner_wallet = locked
            .wager()
            .participant(outcome.winner)
            .map(|p| p.wallet.clone())
            .ok_or_else(|| EngineError::internal("winner missing from locked wager"))?;

        let settlement = self.settlement.settle(&locked, &outcome).await?;
        let wager = self.state.complete(locked).await?;

        self.audit
            .record(
                AuditEvent::new(&wager_id, AuditKind::WagerCompleted)
                    .actor(&winner_wallet)
                    .amount(settlement.payout),
            )
            .await;

        Ok(SettlementOutcome {
            wager_id,
            side: outcome.side,
            winner: outcome.winner,
            winner_wallet,
            payout: settlement.payout,
            payout_signature: settlement.payout_signature.clone(),
            entropy_token: outcome.entropy,
            status: wager.status,
            settlement,
        })
    }

    pub async fn abandon_accept(&self, wager_id: &str) -> Result<AbandonResult> {
        match self.state.abandon(wager_id, None).await? {
            Some(retired) => {
                let flagged = self.release_follow_up(&retired, "abandoned").await;
                Ok(AbandonResult {
                    wager_id: wager_id.to_string(),
                    status: WagerStatus::Open,
                    flagged_for_recovery: flagged,
                })
            }
            None => {
                // distinguishes a missing wager from one with no live claim
                let wager = self.state.load(wager_id).await?;
                Err(EngineError::validation(format!(
                    "wager has no pending claim (status {})",
                    wager.status
                )))
            }
        }
    }

    pub async fn cancel(&self, wager_id: &str) -> Result<CancelResult> {
        let wager = self.state.load(wager_id).await?;
        if wager.status != WagerStatus::Open {
            return Err(EngineError::validation(
                "only wagers that have not been accepted can be cancelled",
            ));
        }

        if !self.state.cancel(wager_id).await? {
            return Err(EngineError::conflict(wager_id));
        }
        self.audit
            .record(AuditEvent::new(wager_id, AuditKind::WagerCancelled).actor(&wager.creator.wallet))
            .await;

        let wager = self.state.load(wager_id).await?;
        let refund = self.settlement.refund(&wager).await?;

        Ok(CancelResult {
            wager_id: wager.id,
            refund_amount: refund.refund_amount,
            status: wager.status,
            refund,
        })
    }

    pub async fn get_wager(&self, wager_id: &str) -> Result<WagerDetails> {
        let wager = self.state.load(wager_id).await?;
        let store = OutcomeStore::new(&self.storage);
        let outcome = store.load(wager_id).await?;
        let legs = store.legs_for(wager_id).await?;

        Ok(WagerDetails {
            wager,
            outcome,
            legs,
        })
    }

    /// Wagers an acceptor can claim right now.
    pub async fn list_open_wagers(&self, limit: usize) -> Result<Vec<Wager>> {
        self.state.list_claimable(limit).await
    }

    /// Releases claims older than the abandon timeout. Returns their ids.
    pub async fn reap_stale_claims(&self) -> Result<Vec<String>> {
        let timeout = chrono::Duration::from_std(self.config.abandon_timeout)
            .map_err(|e| EngineError::internal(format!("Invalid abandon timeout: {}", e)))?;
        let cutoff = Utc::now() - timeout;

        let mut released = Vec::new();
        for wager_id in self.state.stale_claims(cutoff).await? {
            if let Some(retired) = self.state.abandon(&wager_id, Some(cutoff)).await? {
                self.release_follow_up(&retired, "claim timed out").await;
                released.push(wager_id);
            }
        }

        if !released.is_empty() {
            info!("Released {} stale claims", released.len());
        }
        Ok(released)
    }

    /// Runs [`Self::reap_stale_claims`] every `every` until the handle is aborted.
    pub fn spawn_reaper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reap_stale_claims().await {
                    warn!("Stale claim sweep failed: {}", e);
                }
            }
        })
    }

    pub async fn consistency_report(&self) -> Result<ConsistencyReport> {
        build_report(&self.state, self.network.as_ref(), &self.config).await
    }

    pub async fn verify_outcome(&self, wager_id: &str) -> Result<OutcomeVerification> {
        let wager = self.state.load(wager_id).await?;
        let outcome = OutcomeStore::new(&self.storage)
            .load(wager_id)
            .await?
            .ok_or_else(|| EngineError::validation("wager has no recorded outcome yet"))?;

        let valid = OutcomeEngine::verify(&outcome, &wager);
        if !valid {
            error!("Stored outcome for {} does not recompute", wager_id);
        }

        Ok(OutcomeVerification {
            wager_id: wager.id,
            outcome,
            valid,
        })
    }

    async fn verify_with_retry(
        &self,
        wager_id: &str,
        expectation: &DepositExpectation<'_>,
    ) -> Result<crate::verifier::VerifiedDeposit> {
        let verifier = &self.verifier;
        let result = with_backoff(&self.config.retry, "deposit lookup", move || async move {
            verifier.verify(expectation).await
        })
        .await;

        if let Err(EngineError::Validation(reason)) = &result {
            self.audit
                .record(
                    AuditEvent::new(wager_id, AuditKind::DepositRejected)
                        .actor(expectation.payer)
                        .signature(expectation.signature)
                        .detail(reason),
                )
                .await;
        }
        result
    }

    /// Audits a released claim and flags its escrow if it holds anything.
    async fn release_follow_up(&self, retired: &RetiredEscrow, reason: &str) -> bool {
        self.audit
            .record(
                AuditEvent::new(&retired.wager_id, AuditKind::ClaimAbandoned)
                    .detail(format!("{}; escrow {} retired", reason, retired.escrow.address)),
            )
            .await;

        let address = retired.escrow.address.as_str();
        let network = &self.network;
        let balance = with_backoff(&self.config.retry, "retired escrow balance", move || async move {
            Ok(network.get_balance(address).await?)
        })
        .await;

        let funded = match balance {
            Ok(balance) => balance > Amount::ZERO,
            Err(e) => {
                // cannot prove it is empty
                warn!("Could not read retired escrow {}: {}", address, e);
                true
            }
        };
        if funded {
            self.flag_escrow(&retired.wager_id, address, "funds in released escrow")
                .await;
        }
        funded
    }

    async fn flag_escrow(&self, wager_id: &str, address: &str, reason: &str) {
        if let Err(e) = self.state.flag_for_recovery(address).await {
            error!("Failed to flag escrow {} for recovery: {}", address, e);
        }
        warn!("Escrow {} of {} flagged for recovery: {}", address, wager_id, reason);
        self.audit
            .record(
                AuditEvent::new(wager_id, AuditKind::EscrowFlagged)
                    .detail(format!("{}: {}", address, reason)),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CompositeAuditSink;
    use crate::outcome::resolve;
    use flipstake_core::storage::AuditStore;
    use async_trait::async_trait;
    use flipstake_core::storage::SignatureStore;
    use flipstake_core::{
        ChainTransaction, EscrowSecret, LegKind, LegStatus, MemoryNetwork, Network,
        PassphraseVault, RetryPolicy, Transfer,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const STAKE: u64 = 1_000_000; // 0.01 BTC
    const DEPOSIT: u64 = 3_500_000; // stake + 0.025 BTC fee

    struct Harness {
        coordinator: Arc<WagerLifecycleCoordinator>,
        network: Arc<MemoryNetwork>,
        storage: Arc<Storage>,
        treasury: String,
        _dir: TempDir,
    }

    fn fresh_address() -> String {
        let vault = PassphraseVault::with_rounds("addresses", 1_000).unwrap();
        EscrowProvisioner::new(Arc::new(vault), Network::Regtest)
            .provision()
            .unwrap()
            .address
    }

    /// Holds the next transaction lookup until released, so a test can
    /// change the wager while a deposit is being verified.
    struct GatedNetwork {
        inner: Arc<MemoryNetwork>,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedNetwork {
        fn new(inner: Arc<MemoryNetwork>) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl NetworkClient for GatedNetwork {
        async fn get_finalized_entropy(&self) -> flipstake_core::Result<EntropyToken> {
            self.inner.get_finalized_entropy().await
        }

        async fn get_transaction(
            &self,
            signature: &str,
        ) -> flipstake_core::Result<Option<ChainTransaction>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.get_transaction(signature).await
        }

        async fn get_balance(&self, address: &str) -> flipstake_core::Result<Amount> {
            self.inner.get_balance(address).await
        }

        async fn transfer(
            &self,
            secret: &EscrowSecret,
            to: &str,
            amount: Amount,
        ) -> flipstake_core::Result<String> {
            self.inner.transfer(secret, to, amount).await
        }

        async fn sweep(
            &self,
            secret: &EscrowSecret,
            to: &str,
        ) -> flipstake_core::Result<Option<Transfer>> {
            self.inner.sweep(secret, to).await
        }
    }

    async fn harness() -> Harness {
        harness_with(MemoryNetwork::default(), |_| {}).await
    }

    async fn harness_with(network: MemoryNetwork, tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
        let network = Arc::new(network);
        harness_over(network.clone(), network, tweak).await
    }

    /// Engine talks to `client`; tests fund addresses through `network`.
    async fn harness_over(
        network: Arc<MemoryNetwork>,
        client: Arc<dyn NetworkClient>,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("engine.db")).await.unwrap());
        let treasury = fresh_address();

        let mut config = EngineConfig::new(Network::Regtest).with_treasury(treasury.clone());
        config.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        tweak(&mut config);

        let vault = Arc::new(PassphraseVault::with_rounds("engine tests", 1_000).unwrap());
        let audit = Arc::new(CompositeAuditSink::standard(storage.clone()));
        let coordinator =
            WagerLifecycleCoordinator::new(config, storage.clone(), client, vault, audit).unwrap();

        Harness {
            coordinator: Arc::new(coordinator),
            network,
            storage,
            treasury,
            _dir: dir,
        }
    }

    /// Creates a wager and confirms the creator deposit.
    async fn funded_wager(h: &Harness, side: Side, stake: u64) -> (String, String) {
        let creator = fresh_address();
        let created = h
            .coordinator
            .create_wager(side, Amount::from_sat(stake), &creator)
            .await
            .unwrap();
        let sig = h
            .network
            .deposit(&creator, &created.escrow_address, created.expected_deposit);
        h.coordinator
            .confirm_creator_deposit(&created.wager_id, &sig)
            .await
            .unwrap();
        (created.wager_id, creator)
    }

    #[tokio::test]
    async fn test_full_wager_pays_winner_and_sweeps_treasury() {
        let h = harness().await;
        let (wager_id, creator) = funded_wager(&h, Side::Heads, STAKE).await;
        assert_eq!(h.network.entropy_fetches(), 0);

        let acceptor = fresh_address();
        let ticket = h.coordinator.begin_accept(&wager_id, &acceptor).await.unwrap();
        assert_eq!(ticket.side, Side::Tails);
        assert_eq!(ticket.expected_deposit, Amount::from_sat(DEPOSIT));
        let sig = h
            .network
            .deposit(&acceptor, &ticket.escrow_address, ticket.expected_deposit);

        let result = h
            .coordinator
            .confirm_acceptor_deposit(&wager_id, &sig)
            .await
            .unwrap();

        assert_eq!(result.status, WagerStatus::Completed);
        assert_eq!(h.network.entropy_fetches(), 1);
        assert_eq!(result.side, resolve(&result.entropy_token.value, &wager_id));
        let expected_winner = if result.side == Side::Heads { &creator } else { &acceptor };
        assert_eq!(&result.winner_wallet, expected_winner);

        // 0.0196 BTC to the winner
        assert_eq!(result.payout, Amount::from_sat(1_960_000));
        assert_eq!(h.network.balance_of(expected_winner), Amount::from_sat(1_960_000));
        assert!(result.payout_signature.is_some());

        let details = h.coordinator.get_wager(&wager_id).await.unwrap();
        for escrow in [
            &details.wager.creator_escrow.address,
            &details.wager.acceptor_escrow.as_ref().unwrap().address,
        ] {
            assert!(h.network.balance_of(escrow) <= h.coordinator.config().dust_limit);
        }

        // treasury gets fees and residue minus four legs of gas, about 0.0504 BTC
        let gas = h.network.gas_spent();
        let treasury = h.network.balance_of(&h.treasury);
        assert_eq!(gas, h.network.gas() * 4);
        assert_eq!(treasury, Amount::from_sat(5_040_000) - gas);
        assert_eq!(
            Amount::from_sat(2 * DEPOSIT),
            result.payout + treasury + gas
        );

        assert_eq!(details.legs.len(), 4);
        assert!(details.legs.iter().all(|l| l.status == LegStatus::Sent));
        assert_eq!(
            details.legs.iter().map(|l| l.kind).collect::<Vec<_>>(),
            vec![
                LegKind::WinnerPayout,
                LegKind::LoserPayout,
                LegKind::WinnerSweep,
                LegKind::LoserSweep
            ]
        );

        let verification = h.coordinator.verify_outcome(&wager_id).await.unwrap();
        assert!(verification.valid);
        assert!(h.coordinator.consistency_report().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_cancel_refunds_stake_and_sweeps_fee() {
        let h = harness().await;
        let (wager_id, creator) = funded_wager(&h, Side::Tails, 2_000_000).await;

        let result = h.coordinator.cancel(&wager_id).await.unwrap();

        assert_eq!(result.status, WagerStatus::Cancelled);
        assert_eq!(result.refund_amount, Amount::from_sat(2_000_000));
        assert_eq!(h.network.balance_of(&creator), Amount::from_sat(2_000_000));
        // 0.025 BTC fee minus gas for both legs
        assert_eq!(
            h.network.balance_of(&h.treasury),
            Amount::from_sat(2_500_000) - h.network.gas() * 2
        );
        assert_eq!(result.refund.legs.len(), 2);

        let again = h.coordinator.cancel(&wager_id).await;
        assert!(matches!(again, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_deposit_refunds_nothing() {
        let h = harness().await;
        let creator = fresh_address();
        let created = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(STAKE), &creator)
            .await
            .unwrap();

        let result = h.coordinator.cancel(&created.wager_id).await.unwrap();
        assert_eq!(result.refund_amount, Amount::ZERO);
        assert_eq!(h.network.transfers_sent(), 0);
    }

    #[tokio::test]
    async fn test_replayed_signature_is_rejected() {
        let h = harness().await;
        let creator = fresh_address();
        let first = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(STAKE), &creator)
            .await
            .unwrap();
        let second = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(STAKE), &creator)
            .await
            .unwrap();

        let sig = h
            .network
            .deposit(&creator, &first.escrow_address, first.expected_deposit);
        h.coordinator
            .confirm_creator_deposit(&first.wager_id, &sig)
            .await
            .unwrap();

        let err = h
            .coordinator
            .confirm_creator_deposit(&second.wager_id, &sig)
            .await
            .unwrap_err();
        assert!(matches!(&err, EngineError::Validation(msg) if msg == "signature already used"));
        assert_eq!(err.user_message(), "signature already used");

        let wager = h.coordinator.get_wager(&second.wager_id).await.unwrap().wager;
        assert!(wager.creator_deposit.is_none());
        assert_eq!(wager.status, WagerStatus::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_accepts_have_one_winner() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;

        let contenders: Vec<String> = (0..8).map(|_| fresh_address()).collect();
        let handles: Vec<_> = contenders
            .iter()
            .cloned()
            .map(|wallet| {
                let coordinator = h.coordinator.clone();
                let wager_id = wager_id.clone();
                tokio::spawn(async move { coordinator.begin_accept(&wager_id, &wallet).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(EngineError::Conflict { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(winners, 1);

        let wager = h.coordinator.get_wager(&wager_id).await.unwrap().wager;
        assert_eq!(wager.status, WagerStatus::Accepting);
        let acceptor = wager.acceptor.unwrap();
        assert!(contenders.contains(&acceptor.wallet));
        assert_eq!(acceptor.side, Side::Tails);
    }

    #[tokio::test]
    async fn test_own_wager_cannot_be_accepted() {
        let h = harness().await;
        let (wager_id, creator) = funded_wager(&h, Side::Heads, STAKE).await;

        let err = h
            .coordinator
            .begin_accept(&wager_id, &creator)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unfunded_wager_is_not_claimable() {
        let h = harness().await;
        let created = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(STAKE), &fresh_address())
            .await
            .unwrap();

        let err = h
            .coordinator
            .begin_accept(&created.wager_id, &fresh_address())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
        assert!(h.coordinator.list_open_wagers(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_deposit_leaves_no_trace() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        let acceptor = fresh_address();
        let ticket = h.coordinator.begin_accept(&wager_id, &acceptor).await.unwrap();

        let short = h.network.deposit(
            &acceptor,
            &ticket.escrow_address,
            Amount::from_sat(DEPOSIT - 1),
        );
        let err = h
            .coordinator
            .confirm_acceptor_deposit(&wager_id, &short)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let wager = h.coordinator.get_wager(&wager_id).await.unwrap().wager;
        assert_eq!(wager.status, WagerStatus::Accepting);
        assert_eq!(h.network.entropy_fetches(), 0);

        let events = AuditStore::new(&h.storage).events_for(&wager_id).await.unwrap();
        assert!(events.iter().any(|e| e.kind == AuditKind::DepositRejected));
    }

    #[tokio::test]
    async fn test_unfinalized_deposit_is_retryable() {
        let h = harness().await;
        let creator = fresh_address();
        let created = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(STAKE), &creator)
            .await
            .unwrap();
        let sig = h
            .network
            .deposit_pending(&creator, &created.escrow_address, created.expected_deposit);

        let err = h
            .coordinator
            .confirm_creator_deposit(&created.wager_id, &sig)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        let wager = h.coordinator.get_wager(&created.wager_id).await.unwrap().wager;
        assert!(wager.creator_deposit.is_none());

        h.network.finalize(&sig);
        let status = h
            .coordinator
            .confirm_creator_deposit(&created.wager_id, &sig)
            .await
            .unwrap();
        assert_eq!(status.status, WagerStatus::Open);
    }

    #[tokio::test]
    async fn test_failed_leg_freezes_wager_in_settling() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        let acceptor = fresh_address();
        let ticket = h.coordinator.begin_accept(&wager_id, &acceptor).await.unwrap();
        let sig = h
            .network
            .deposit(&acceptor, &ticket.escrow_address, ticket.expected_deposit);

        h.network.fail_transfers_after(1);
        let err = h
            .coordinator
            .confirm_acceptor_deposit(&wager_id, &sig)
            .await
            .unwrap_err();

        assert!(matches!(&err, EngineError::SettlementPending { wager_id: id, .. } if *id == wager_id));
        assert!(err.user_message().contains("processing"));

        let details = h.coordinator.get_wager(&wager_id).await.unwrap();
        assert_eq!(details.wager.status, WagerStatus::Settling);
        assert!(details.outcome.is_some());
        assert_eq!(details.legs.len(), 2);
        assert_eq!(details.legs[0].status, LegStatus::Sent);
        assert_eq!(details.legs[1].status, LegStatus::Failed);
        assert_eq!(h.network.transfers_sent(), 1);

        let report = h.coordinator.consistency_report().await.unwrap();
        assert_eq!(report.pending_settlements, vec![wager_id.clone()]);

        // the same deposit cannot be replayed to restart settlement
        let replay = h.coordinator.confirm_acceptor_deposit(&wager_id, &sig).await;
        assert!(matches!(replay, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_dust_residue_is_skipped() {
        let network = MemoryNetwork::new(Amount::from_sat(1_000), Amount::from_sat(546));
        let h = harness_with(network, |config| {
            config.participant_fee = Amount::from_sat(1_500);
        })
        .await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        let acceptor = fresh_address();
        let ticket = h.coordinator.begin_accept(&wager_id, &acceptor).await.unwrap();
        let sig = h
            .network
            .deposit(&acceptor, &ticket.escrow_address, ticket.expected_deposit);

        let result = h
            .coordinator
            .confirm_acceptor_deposit(&wager_id, &sig)
            .await
            .unwrap();
        assert_eq!(result.status, WagerStatus::Completed);

        let winner_sweep = result
            .settlement
            .legs
            .iter()
            .find(|l| l.kind == LegKind::WinnerSweep)
            .unwrap();
        assert_eq!(winner_sweep.status, LegStatus::Skipped);
        assert!(h.network.balance_of(&winner_sweep.from_address) <= Amount::from_sat(546));
    }

    #[tokio::test]
    async fn test_abandon_reopens_wager() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        let first = h
            .coordinator
            .begin_accept(&wager_id, &fresh_address())
            .await
            .unwrap();

        let result = h.coordinator.abandon_accept(&wager_id).await.unwrap();
        assert_eq!(result.status, WagerStatus::Open);
        assert!(!result.flagged_for_recovery);

        let wager = h.coordinator.get_wager(&wager_id).await.unwrap().wager;
        assert!(wager.acceptor.is_none());
        assert_eq!(h.coordinator.list_open_wagers(10).await.unwrap().len(), 1);

        // a new claim gets a new escrow
        let second = h
            .coordinator
            .begin_accept(&wager_id, &fresh_address())
            .await
            .unwrap();
        assert_ne!(first.escrow_address, second.escrow_address);

        let err = h.coordinator.abandon_accept("wager_missing").await.unwrap_err();
        assert!(matches!(err, EngineError::WagerNotFound(_)));
    }

    #[tokio::test]
    async fn test_funded_abandoned_escrow_is_flagged() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        let acceptor = fresh_address();
        let ticket = h.coordinator.begin_accept(&wager_id, &acceptor).await.unwrap();
        let late = h
            .network
            .deposit(&acceptor, &ticket.escrow_address, ticket.expected_deposit);

        let result = h.coordinator.abandon_accept(&wager_id).await.unwrap();
        assert!(result.flagged_for_recovery);

        // the deposit can no longer confirm anything
        let err = h
            .coordinator
            .confirm_acceptor_deposit(&wager_id, &late)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let report = h.coordinator.consistency_report().await.unwrap();
        assert!(report
            .inconsistencies
            .iter()
            .any(|i| i.escrow_address == ticket.escrow_address && i.status.is_none()));
    }

    #[tokio::test]
    async fn test_reaper_releases_stale_claims() {
        let h = harness_with(MemoryNetwork::default(), |config| {
            config.abandon_timeout = Duration::ZERO;
        })
        .await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        h.coordinator
            .begin_accept(&wager_id, &fresh_address())
            .await
            .unwrap();

        let released = h.coordinator.reap_stale_claims().await.unwrap();
        assert_eq!(released, vec![wager_id.clone()]);

        let wager = h.coordinator.get_wager(&wager_id).await.unwrap().wager;
        assert_eq!(wager.status, WagerStatus::Open);
        assert!(h.coordinator.reap_stale_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_claims_survive_reaper() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        h.coordinator
            .begin_accept(&wager_id, &fresh_address())
            .await
            .unwrap();

        assert!(h.coordinator.reap_stale_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_validates_inputs() {
        let h = harness().await;

        let err = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(1), &fresh_address())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(STAKE), "not-an-address")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cannot_cancel_claimed_wager() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        h.coordinator
            .begin_accept(&wager_id, &fresh_address())
            .await
            .unwrap();

        let err = h.coordinator.cancel(&wager_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(h.network.transfers_sent(), 0);
    }

    #[tokio::test]
    async fn test_deposit_for_released_claim_does_not_lock_next_claim() {
        let network = Arc::new(MemoryNetwork::default());
        let gate = Arc::new(GatedNetwork::new(network.clone()));
        let h = harness_over(network, gate.clone(), |_| {}).await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;

        let first = fresh_address();
        let first_ticket = h.coordinator.begin_accept(&wager_id, &first).await.unwrap();
        let sig = h
            .network
            .deposit(&first, &first_ticket.escrow_address, first_ticket.expected_deposit);

        gate.arm();
        let confirm = {
            let coordinator = h.coordinator.clone();
            let wager_id = wager_id.clone();
            let sig = sig.clone();
            tokio::spawn(async move { coordinator.confirm_acceptor_deposit(&wager_id, &sig).await })
        };

        // the deposit lookup is in flight; the claim changes hands meanwhile
        gate.entered.notified().await;
        let abandoned = h.coordinator.abandon_accept(&wager_id).await.unwrap();
        assert!(abandoned.flagged_for_recovery);
        let second_ticket = h
            .coordinator
            .begin_accept(&wager_id, &fresh_address())
            .await
            .unwrap();
        gate.release.notify_one();

        let result = confirm.await.unwrap();
        assert!(matches!(result, Err(EngineError::Conflict { .. })));

        let wager = h.coordinator.get_wager(&wager_id).await.unwrap().wager;
        assert_eq!(wager.status, WagerStatus::Accepting);
        assert!(wager.acceptor_deposit.is_none());
        assert_eq!(
            wager.acceptor_escrow.unwrap().address,
            second_ticket.escrow_address
        );
        assert_eq!(h.network.entropy_fetches(), 0);
        assert!(!SignatureStore::new(&h.storage).is_used(&sig).await.unwrap());

        let retired = h.coordinator.state.retired_escrows().await.unwrap();
        assert!(retired
            .iter()
            .any(|r| r.escrow.address == first_ticket.escrow_address && r.needs_recovery));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replay_consumes_signature_once() {
        let h = harness().await;
        let creator = fresh_address();
        let created = h
            .coordinator
            .create_wager(Side::Heads, Amount::from_sat(STAKE), &creator)
            .await
            .unwrap();
        let sig = h
            .network
            .deposit(&creator, &created.escrow_address, created.expected_deposit);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let coordinator = h.coordinator.clone();
                let wager_id = created.wager_id.clone();
                let sig = sig.clone();
                tokio::spawn(async move { coordinator.confirm_creator_deposit(&wager_id, &sig).await })
            })
            .collect();

        let mut confirmed = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => confirmed += 1,
                Err(EngineError::Validation(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((confirmed, rejected), (1, 1));

        let rows: i64 = h
            .storage
            .get_connection()
            .await
            .query_row(
                "SELECT COUNT(*) FROM used_signatures WHERE signature = ?1",
                [&sig],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);

        let wager = h.coordinator.get_wager(&created.wager_id).await.unwrap().wager;
        assert_eq!(wager.creator_deposit.as_deref(), Some(sig.as_str()));
    }

    #[tokio::test]
    async fn test_unexpected_escrow_balance_blocks_settlement() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Heads, STAKE).await;
        let acceptor = fresh_address();
        let ticket = h.coordinator.begin_accept(&wager_id, &acceptor).await.unwrap();
        let sig = h
            .network
            .deposit(&acceptor, &ticket.escrow_address, ticket.expected_deposit);

        // one extra satoshi in the creator escrow
        let creator_escrow = h
            .coordinator
            .get_wager(&wager_id)
            .await
            .unwrap()
            .wager
            .creator_escrow
            .address;
        h.network
            .deposit(&fresh_address(), &creator_escrow, Amount::from_sat(1));

        let err = h
            .coordinator
            .confirm_acceptor_deposit(&wager_id, &sig)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SettlementPending { .. }));
        assert_eq!(h.network.transfers_sent(), 0);

        let details = h.coordinator.get_wager(&wager_id).await.unwrap();
        assert_eq!(details.wager.status, WagerStatus::Settling);
        assert!(details.legs.is_empty());

        let report = h.coordinator.consistency_report().await.unwrap();
        assert!(report.pending_settlements.contains(&wager_id));
    }

    #[tokio::test]
    async fn test_unexpected_escrow_balance_blocks_refund() {
        let h = harness().await;
        let (wager_id, _) = funded_wager(&h, Side::Tails, STAKE).await;
        let creator_escrow = h
            .coordinator
            .get_wager(&wager_id)
            .await
            .unwrap()
            .wager
            .creator_escrow
            .address;
        h.network
            .deposit(&fresh_address(), &creator_escrow, Amount::from_sat(1));

        let err = h.coordinator.cancel(&wager_id).await.unwrap_err();
        assert!(matches!(err, EngineError::SettlementPending { .. }));
        assert_eq!(h.network.transfers_sent(), 0);
        assert_eq!(
            h.network.balance_of(&creator_escrow),
            Amount::from_sat(DEPOSIT + 1)
        );
    }
}
