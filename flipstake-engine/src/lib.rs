//! flipstake engine - escrow-backed two-party coin flip wagers
//!
//! Two participants each lock a stake plus a fixed fee in a dedicated escrow.
//! Once both deposits are final the outcome is derived from fresh block
//! entropy, the winner is paid and the residue is swept to the treasury.

pub mod audit;
pub mod coordinator;
pub mod error;
pub mod outcome;
pub mod report;
pub mod retry;
pub mod settlement;
pub mod state;
pub mod verifier;

pub use audit::{AuditSink, CompositeAuditSink, SqliteAuditSink, TracingAuditSink};
pub use coordinator::{
    AbandonResult, AcceptTicket, CancelResult, CreatedWager, DepositStatus, OutcomeVerification,
    SettlementOutcome, WagerDetails, WagerLifecycleCoordinator,
};
pub use error::{EngineError, Result};
pub use outcome::{resolve, OutcomeEngine};
pub use report::{ConsistencyReport, ExpectedBalance, Inconsistency};
pub use settlement::{RefundReport, SettlementExecutor, SettlementReport};
pub use state::{ClaimOutcome, LockedStakes, WagerStateMachine};
pub use verifier::{DepositExpectation, DepositVerifier, VerifiedDeposit};
