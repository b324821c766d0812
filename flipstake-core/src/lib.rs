//! flipstake core - escrow, storage and chain primitives for wager settlement
//!
//! This crate owns everything that touches keys, the database or the
//! network. The lifecycle rules live in `flipstake-engine`.

pub mod chain;
pub mod config;
pub mod error;
pub mod escrow;
pub mod storage;
pub mod types;
pub mod vault;

pub use chain::{
    CircuitState, EndpointHealth, EndpointStatus, EsploraNetwork, FailoverNetwork, MemoryNetwork,
    NetworkClient,
};
pub use config::{BreakerPolicy, EngineConfig, RetryPolicy};
pub use error::{FlipstakeError, Result};
pub use escrow::EscrowProvisioner;
pub use storage::Storage;
pub use types::{
    AuditEvent, AuditKind, ChainTransaction, EntropyToken, EscrowRef, LegKind, LegStatus,
    OutcomeRecord, Participant, RetiredEscrow, Role, SettlementLeg, Side, Transfer, TxOutput,
    UsedSignature, Wager, WagerStatus,
};
pub use vault::{EscrowSecret, PassphraseVault, SecretVault};

pub use ::bitcoin::Amount;
pub use ::bitcoin::Network;
