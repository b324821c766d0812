use crate::error::FlipstakeError;
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fresh wager identifier of the form `wager_<12 hex>`.
pub fn new_wager_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("wager_{}", &hex[..12])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Heads,
    Tails,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Heads => Side::Tails,
            Side::Tails => Side::Heads,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Heads => "heads",
            Side::Tails => "tails",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = FlipstakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heads" => Ok(Side::Heads),
            "tails" => Ok(Side::Tails),
            other => Err(FlipstakeError::internal(format!("Unknown side: {}", other))),
        }
    }
}

/// Which participant of a wager an escrow, deposit or payout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Creator,
    Acceptor,
}

impl Role {
    pub fn other(self) -> Self {
        match self {
            Role::Creator => Role::Acceptor,
            Role::Acceptor => Role::Creator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Creator => "creator",
            Role::Acceptor => "acceptor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = FlipstakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creator" => Ok(Role::Creator),
            "acceptor" => Ok(Role::Acceptor),
            other => Err(FlipstakeError::internal(format!("Unknown role: {}", other))),
        }
    }
}

/// Wager lifecycle state.
///
/// `Settling` covers both the window between locking the stakes and
/// completing settlement, and the frozen state left behind when a
/// settlement leg fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WagerStatus {
    Open,
    Accepting,
    Settling,
    Completed,
    Cancelled,
}

impl WagerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WagerStatus::Open => "open",
            WagerStatus::Accepting => "accepting",
            WagerStatus::Settling => "settling",
            WagerStatus::Completed => "completed",
            WagerStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WagerStatus::Completed | WagerStatus::Cancelled)
    }
}

impl fmt::Display for WagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WagerStatus {
    type Err = FlipstakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(WagerStatus::Open),
            "accepting" => Ok(WagerStatus::Accepting),
            "settling" => Ok(WagerStatus::Settling),
            "completed" => Ok(WagerStatus::Completed),
            "cancelled" => Ok(WagerStatus::Cancelled),
            other => Err(FlipstakeError::internal(format!(
                "Unknown wager status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub side: Side,
    /// Sends the deposit and receives any payout or refund.
    pub wallet: String,
}

/// Escrow address plus the vault ciphertext of its signing key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRef {
    pub address: String,
    pub encrypted_secret: Vec<u8>,
}

impl fmt::Debug for EscrowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowRef")
            .field("address", &self.address)
            .field("encrypted_secret", &format!("<{} bytes>", self.encrypted_secret.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: String,
    pub stake: Amount,
    pub status: WagerStatus,
    pub version: i64,
    pub creator: Participant,
    pub creator_escrow: EscrowRef,
    pub creator_deposit: Option<String>,
    pub acceptor: Option<Participant>,
    pub acceptor_escrow: Option<EscrowRef>,
    pub acceptor_deposit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accepting_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Wager {
    pub fn participant(&self, role: Role) -> Option<&Participant> {
        match role {
            Role::Creator => Some(&self.creator),
            Role::Acceptor => self.acceptor.as_ref(),
        }
    }

    pub fn escrow(&self, role: Role) -> Option<&EscrowRef> {
        match role {
            Role::Creator => Some(&self.creator_escrow),
            Role::Acceptor => self.acceptor_escrow.as_ref(),
        }
    }

    pub fn deposit(&self, role: Role) -> Option<&str> {
        match role {
            Role::Creator => self.creator_deposit.as_deref(),
            Role::Acceptor => self.acceptor_deposit.as_deref(),
        }
    }

    /// Role whose chosen side matches `side`.
    pub fn role_for_side(&self, side: Side) -> Role {
        if self.creator.side == side {
            Role::Creator
        } else {
            Role::Acceptor
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedSignature {
    pub signature: String,
    pub payer: String,
    pub purpose: String,
    pub used_at: DateTime<Utc>,
}

/// Acceptor escrow detached from its wager by an abandoned claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredEscrow {
    pub wager_id: String,
    pub escrow: EscrowRef,
    pub retired_at: DateTime<Utc>,
    pub needs_recovery: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropyToken {
    /// Height of the finalized block the token was read from.
    pub height: u32,
    pub value: String,
}

impl fmt::Display for EntropyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub wager_id: String,
    pub entropy: EntropyToken,
    /// Hex SHA-256 of `entropy.value || wager_id`.
    pub digest: String,
    pub side: Side,
    pub winner: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegKind {
    WinnerPayout,
    LoserPayout,
    WinnerSweep,
    LoserSweep,
    Refund,
    RefundSweep,
}

impl LegKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LegKind::WinnerPayout => "winner_payout",
            LegKind::LoserPayout => "loser_payout",
            LegKind::WinnerSweep => "winner_sweep",
            LegKind::LoserSweep => "loser_sweep",
            LegKind::Refund => "refund",
            LegKind::RefundSweep => "refund_sweep",
        }
    }

    pub fn is_payout(self) -> bool {
        matches!(self, LegKind::WinnerPayout | LegKind::LoserPayout)
    }
}

impl FromStr for LegKind {
    type Err = FlipstakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "winner_payout" => Ok(LegKind::WinnerPayout),
            "loser_payout" => Ok(LegKind::LoserPayout),
            "winner_sweep" => Ok(LegKind::WinnerSweep),
            "loser_sweep" => Ok(LegKind::LoserSweep),
            "refund" => Ok(LegKind::Refund),
            "refund_sweep" => Ok(LegKind::RefundSweep),
            other => Err(FlipstakeError::internal(format!("Unknown leg kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegStatus {
    /// Written before the transfer is submitted.
    Pending,
    Sent,
    /// Balance was within the dust limit; nothing to move.
    Skipped,
    Failed,
}

impl LegStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LegStatus::Pending => "pending",
            LegStatus::Sent => "sent",
            LegStatus::Skipped => "skipped",
            LegStatus::Failed => "failed",
        }
    }
}

impl FromStr for LegStatus {
    type Err = FlipstakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LegStatus::Pending),
            "sent" => Ok(LegStatus::Sent),
            "skipped" => Ok(LegStatus::Skipped),
            "failed" => Ok(LegStatus::Failed),
            other => Err(FlipstakeError::internal(format!(
                "Unknown leg status: {}",
                other
            ))),
        }
    }
}

/// One outbound transfer from an escrow, recorded individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementLeg {
    pub wager_id: String,
    pub seq: u32,
    pub kind: LegKind,
    pub from_address: String,
    pub to_address: String,
    pub amount: Amount,
    pub signature: Option<String>,
    pub status: LegStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Transaction as seen by the deposit verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub signature: String,
    /// `None` when the inputs do not resolve to a single address.
    pub sender: Option<String>,
    pub outputs: Vec<TxOutput>,
    pub finalized: bool,
}

impl ChainTransaction {
    /// Total paid to `address` across all outputs.
    pub fn amount_to(&self, address: &str) -> Amount {
        self.outputs
            .iter()
            .filter(|o| o.address == address)
            .fold(Amount::ZERO, |acc, o| acc + o.amount)
    }

    pub fn pays(&self, address: &str) -> bool {
        self.outputs.iter().any(|o| o.address == address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub signature: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    WagerCreated,
    DepositConfirmed,
    DepositRejected,
    ClaimAccepted,
    ClaimConflict,
    ClaimAbandoned,
    EscrowFlagged,
    WagerCancelled,
    StakesLocked,
    OutcomeResolved,
    TransferSent,
    TransferSkipped,
    TransferFailed,
    SettlementPending,
    WagerCompleted,
    RefundCompleted,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::WagerCreated => "wager_created",
            AuditKind::DepositConfirmed => "deposit_confirmed",
            AuditKind::DepositRejected => "deposit_rejected",
            AuditKind::ClaimAccepted => "claim_accepted",
            AuditKind::ClaimConflict => "claim_conflict",
            AuditKind::ClaimAbandoned => "claim_abandoned",
            AuditKind::EscrowFlagged => "escrow_flagged",
            AuditKind::WagerCancelled => "wager_cancelled",
            AuditKind::StakesLocked => "stakes_locked",
            AuditKind::OutcomeResolved => "outcome_resolved",
            AuditKind::TransferSent => "transfer_sent",
            AuditKind::TransferSkipped => "transfer_skipped",
            AuditKind::TransferFailed => "transfer_failed",
            AuditKind::SettlementPending => "settlement_pending",
            AuditKind::WagerCompleted => "wager_completed",
            AuditKind::RefundCompleted => "refund_completed",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditKind {
    type Err = FlipstakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "wager_created" => AuditKind::WagerCreated,
            "deposit_confirmed" => AuditKind::DepositConfirmed,
            "deposit_rejected" => AuditKind::DepositRejected,
            "claim_accepted" => AuditKind::ClaimAccepted,
            "claim_conflict" => AuditKind::ClaimConflict,
            "claim_abandoned" => AuditKind::ClaimAbandoned,
            "escrow_flagged" => AuditKind::EscrowFlagged,
            "wager_cancelled" => AuditKind::WagerCancelled,
            "stakes_locked" => AuditKind::StakesLocked,
            "outcome_resolved" => AuditKind::OutcomeResolved,
            "transfer_sent" => AuditKind::TransferSent,
            "transfer_skipped" => AuditKind::TransferSkipped,
            "transfer_failed" => AuditKind::TransferFailed,
            "settlement_pending" => AuditKind::SettlementPending,
            "wager_completed" => AuditKind::WagerCompleted,
            "refund_completed" => AuditKind::RefundCompleted,
            other => {
                return Err(FlipstakeError::internal(format!(
                    "Unknown audit kind: {}",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub wager_id: String,
    pub kind: AuditKind,
    pub actor: Option<String>,
    pub amount: Option<Amount>,
    pub signature: Option<String>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(wager_id: impl Into<String>, kind: AuditKind) -> Self {
        Self {
            wager_id: wager_id.into(),
            kind,
            actor: None,
            amount: None,
            signature: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
