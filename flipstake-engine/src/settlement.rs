use crate::audit::AuditSink;
use crate::error::{EngineError, Result};
use crate::retry::with_backoff;
use crate::state::LockedStakes;
use bitcoin::Amount;
use chrono::Utc;
use flipstake_core::storage::OutcomeStore;
use flipstake_core::{
    AuditEvent, AuditKind, EngineConfig, EscrowProvisioner, EscrowRef, LegKind, LegStatus,
    NetworkClient, OutcomeRecord, Role, SettlementLeg, Storage, Wager, WagerStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReport {
    pub wager_id: String,
    pub payout: Amount,
    /// Signature of the leg paid out of the winner's own escrow.
    pub payout_signature: Option<String>,
    pub treasury_total: Amount,
    pub legs: Vec<SettlementLeg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReport {
    pub wager_id: String,
    pub refund_amount: Amount,
    pub refund_signature: Option<String>,
    pub treasury_total: Amount,
    pub legs: Vec<SettlementLeg>,
}

struct PlannedLeg<'a> {
    kind: LegKind,
    escrow: &'a EscrowRef,
    to: &'a str,
    /// Zero for sweeps; the amount is whatever the escrow holds.
    amount: Amount,
}

/// Moves funds out of escrows once an outcome exists or a wager is cancelled.
///
/// Each leg is journaled as pending before it is submitted and finished
/// afterwards. A failed leg stops the run; legs are never resubmitted here.
pub struct SettlementExecutor {
    storage: Arc<Storage>,
    network: Arc<dyn NetworkClient>,
    provisioner: Arc<EscrowProvisioner>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl SettlementExecutor {
    pub fn new(
        storage: Arc<Storage>,
        network: Arc<dyn NetworkClient>,
        provisioner: Arc<EscrowProvisioner>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            network,
            provisioner,
            audit,
            config,
        }
    }

    pub async fn settle(
        &self,
        locked: &LockedStakes,
        outcome: &OutcomeRecord,
    ) -> Result<SettlementReport> {
        let wager = locked.wager();
        let winner = outcome.winner;
        let (winner_escrow, winner_wallet) = escrow_and_wallet(wager, winner)?;
        let (loser_escrow, _) = escrow_and_wallet(wager, winner.other())?;

        let expected = self.config.expected_deposit(wager.stake);
        self.require_balance(wager, winner_escrow, expected).await?;
        self.require_balance(wager, loser_escrow, expected).await?;

        let payout = self.config.payout_for(wager.stake);
        let from_winner = payout.min(wager.stake);
        let from_loser = payout - from_winner;
        let treasury = self.config.treasury_address.as_str();

        let mut plan = vec![PlannedLeg {
            kind: LegKind::WinnerPayout,
            escrow: winner_escrow,
            to: winner_wallet,
            amount: from_winner,
        }];
        if from_loser > Amount::ZERO {
            plan.push(PlannedLeg {
                kind: LegKind::LoserPayout,
                escrow: loser_escrow,
                to: winner_wallet,
                amount: from_loser,
            });
        }
        plan.push(PlannedLeg {
            kind: LegKind::WinnerSweep,
            escrow: winner_escrow,
            to: treasury,
            amount: Amount::ZERO,
        });
        plan.push(PlannedLeg {
            kind: LegKind::LoserSweep,
            escrow: loser_escrow,
            to: treasury,
            amount: Amount::ZERO,
        });

        let legs = self.execute(&wager.id, plan).await?;

        let payout_signature = legs
            .iter()
            .find(|l| l.kind == LegKind::WinnerPayout)
            .and_then(|l| l.signature.clone());
        let treasury_total = sum_to(&legs, treasury);

        info!(
            "Settled {}: {} paid to {}, {} swept to treasury",
            wager.id, payout, winner_wallet, treasury_total
        );

        Ok(SettlementReport {
            wager_id: wager.id.clone(),
            payout,
            payout_signature,
            treasury_total,
            legs,
        })
    }

    /// Returns the creator's stake and sweeps the fee of a cancelled wager.
    pub async fn refund(&self, wager: &Wager) -> Result<RefundReport> {
        if wager.status != WagerStatus::Cancelled {
            return Err(EngineError::internal(format!(
                "Refund requested for {} wager {}",
                wager.status, wager.id
            )));
        }

        if wager.creator_deposit.is_none() {
            info!("Wager {} cancelled before any deposit; nothing to refund", wager.id);
            return Ok(RefundReport {
                wager_id: wager.id.clone(),
                refund_amount: Amount::ZERO,
                refund_signature: None,
                treasury_total: Amount::ZERO,
                legs: Vec::new(),
            });
        }

        let escrow = &wager.creator_escrow;
        let expected = self.config.expected_deposit(wager.stake);
        self.require_balance(wager, escrow, expected).await?;

        let treasury = self.config.treasury_address.as_str();
        let plan = vec![
            PlannedLeg {
                kind: LegKind::Refund,
                escrow,
                to: &wager.creator.wallet,
                amount: wager.stake,
            },
            PlannedLeg {
                kind: LegKind::RefundSweep,
                escrow,
                to: treasury,
                amount: Amount::ZERO,
            },
        ];
        let legs = self.execute(&wager.id, plan).await?;

        let refund_signature = legs
            .iter()
            .find(|l| l.kind == LegKind::Refund)
            .and_then(|l| l.signature.clone());
        let treasury_total = sum_to(&legs, treasury);

        self.audit
            .record(
                AuditEvent::new(&wager.id, AuditKind::RefundCompleted)
                    .actor(&wager.creator.wallet)
                    .amount(wager.stake),
            )
            .await;

        Ok(RefundReport {
            wager_id: wager.id.clone(),
            refund_amount: wager.stake,
            refund_signature,
            treasury_total,
            legs,
        })
    }

    async fn require_balance(&self, wager: &Wager, escrow: &EscrowRef, expected: Amount) -> Result<()> {
        let address = escrow.address.as_str();
        let balance = with_backoff(&self.config.retry, "escrow balance", move || async move {
            Ok(self.network.get_balance(address).await?)
        })
        .await
        .map_err(|e| self.pending(&wager.id, format!("balance lookup failed: {}", e)))?;

        if balance != expected {
            let reason = format!(
                "escrow {} holds {}, expected {}",
                escrow.address, balance, expected
            );
            error!("Refusing to settle {}: {}", wager.id, reason);
            self.audit
                .record(AuditEvent::new(&wager.id, AuditKind::SettlementPending).detail(&reason))
                .await;
            return Err(self.pending(&wager.id, reason));
        }
        Ok(())
    }

    async fn execute(&self, wager_id: &str, plan: Vec<PlannedLeg<'_>>) -> Result<Vec<SettlementLeg>> {
        let journal = OutcomeStore::new(&self.storage);
        let mut seq = journal.legs_for(wager_id).await?.len() as u32;
        let mut done = Vec::with_capacity(plan.len());

        for planned in plan {
            let mut leg = SettlementLeg {
                wager_id: wager_id.to_string(),
                seq,
                kind: planned.kind,
                from_address: planned.escrow.address.clone(),
                to_address: planned.to.to_string(),
                amount: planned.amount,
                signature: None,
                status: LegStatus::Pending,
                error: None,
                created_at: Utc::now(),
            };
            journal.append_leg(&leg).await?;
            seq += 1;

            match self.submit(&planned).await {
                Ok(Some((signature, amount))) => {
                    journal
                        .finish_leg(wager_id, leg.seq, LegStatus::Sent, amount, Some(&signature), None)
                        .await?;
                    self.audit
                        .record(
                            AuditEvent::new(wager_id, AuditKind::TransferSent)
                                .actor(planned.to)
                                .amount(amount)
                                .signature(&signature)
                                .detail(format!("{} from {}", leg.kind.as_str(), leg.from_address)),
                        )
                        .await;
                    leg.status = LegStatus::Sent;
                    leg.amount = amount;
                    leg.signature = Some(signature);
                }
                Ok(None) => {
                    journal
                        .finish_leg(wager_id, leg.seq, LegStatus::Skipped, Amount::ZERO, None, None)
                        .await?;
                    self.audit
                        .record(
                            AuditEvent::new(wager_id, AuditKind::TransferSkipped)
                                .detail(format!("{} from {}: dust only", leg.kind.as_str(), leg.from_address)),
                        )
                        .await;
                    leg.status = LegStatus::Skipped;
                }
                Err(e) => {
                    let reason = format!("{} leg failed: {}", leg.kind.as_str(), e);
                    error!("Settlement of {} stopped: {}", wager_id, reason);
                    journal
                        .finish_leg(
                            wager_id,
                            leg.seq,
                            LegStatus::Failed,
                            leg.amount,
                            None,
                            Some(&e.to_string()),
                        )
                        .await?;
                    self.audit
                        .record(
                            AuditEvent::new(wager_id, AuditKind::TransferFailed)
                                .amount(leg.amount)
                                .detail(&reason),
                        )
                        .await;
                    self.audit
                        .record(AuditEvent::new(wager_id, AuditKind::SettlementPending).detail(&reason))
                        .await;
                    return Err(self.pending(wager_id, reason));
                }
            }

            done.push(leg);
        }

        Ok(done)
    }

    /// One network call; the key is decrypted only for its duration.
    async fn submit(&self, planned: &PlannedLeg<'_>) -> Result<Option<(String, Amount)>> {
        let secret = self.provisioner.unlock(planned.escrow)?;

        if planned.kind.is_payout() || planned.kind == LegKind::Refund {
            let signature = self
                .network
                .transfer(&secret, planned.to, planned.amount)
                .await?;
            Ok(Some((signature, planned.amount)))
        } else {
            let swept = self.network.sweep(&secret, planned.to).await?;
            if swept.is_none() {
                warn!("Escrow {} left with dust only", planned.escrow.address);
            }
            Ok(swept.map(|t| (t.signature, t.amount)))
        }
    }

    fn pending(&self, wager_id: &str, reason: String) -> EngineError {
        EngineError::SettlementPending {
            wager_id: wager_id.to_string(),
            reason,
        }
    }
}

fn escrow_and_wallet(wager: &Wager, role: Role) -> Result<(&EscrowRef, &str)> {
    let escrow = wager
        .escrow(role)
        .ok_or_else(|| EngineError::internal(format!("{} escrow missing on {}", role, wager.id)))?;
    let participant = wager
        .participant(role)
        .ok_or_else(|| EngineError::internal(format!("{} missing on {}", role, wager.id)))?;
    Ok((escrow, participant.wallet.as_str()))
}

fn sum_to(legs: &[SettlementLeg], address: &str) -> Amount {
    legs.iter()
        .filter(|l| l.to_address == address && l.status == LegStatus::Sent)
        .fold(Amount::ZERO, |acc, l| acc + l.amount)
}
