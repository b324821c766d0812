use crate::error::Result;
use crate::retry::with_backoff;
use crate::state::WagerStateMachine;
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use flipstake_core::{EngineConfig, NetworkClient, Role, Wager, WagerStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

const REPORT_SCAN_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedBalance {
    Exactly(Amount),
    /// Drained, apart from dust.
    AtMostDust,
    /// Any balance is a finding; used for retired escrows.
    Empty,
}

impl ExpectedBalance {
    fn holds(self, actual: Amount, dust_limit: Amount) -> bool {
        match self {
            ExpectedBalance::Exactly(amount) => actual == amount,
            ExpectedBalance::AtMostDust => actual <= dust_limit,
            ExpectedBalance::Empty => actual == Amount::ZERO,
        }
    }
}

impl fmt::Display for ExpectedBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedBalance::Exactly(amount) => write!(f, "exactly {}", amount),
            ExpectedBalance::AtMostDust => f.write_str("dust only"),
            ExpectedBalance::Empty => f.write_str("empty"),
        }
    }
}

/// An escrow whose balance disagrees with the status of its wager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inconsistency {
    pub wager_id: String,
    /// `None` for retired escrows.
    pub status: Option<WagerStatus>,
    pub role: Role,
    pub escrow_address: String,
    pub expected: ExpectedBalance,
    pub actual: Amount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub escrows_checked: usize,
    pub inconsistencies: Vec<Inconsistency>,
    /// Wagers frozen in `Settling`, listed regardless of balances.
    pub pending_settlements: Vec<String>,
    /// Escrows whose balance could not be read.
    pub unreachable: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty()
            && self.pending_settlements.is_empty()
            && self.unreachable.is_empty()
    }
}

/// Read-only scan comparing escrow balances with recorded status.
pub(crate) async fn build_report(
    state: &WagerStateMachine,
    network: &dyn NetworkClient,
    config: &EngineConfig,
) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport {
        generated_at: Some(Utc::now()),
        ..ConsistencyReport::default()
    };
    let expected_deposit = |w: &Wager| ExpectedBalance::Exactly(config.expected_deposit(w.stake));

    for status in [
        WagerStatus::Open,
        WagerStatus::Accepting,
        WagerStatus::Settling,
        WagerStatus::Completed,
        WagerStatus::Cancelled,
    ] {
        for wager in state.list(status, REPORT_SCAN_LIMIT).await? {
            if status == WagerStatus::Settling {
                report.pending_settlements.push(wager.id.clone());
            }

            let creator = match (status, wager.creator_deposit.is_some()) {
                (WagerStatus::Open | WagerStatus::Accepting, true) => expected_deposit(&wager),
                (WagerStatus::Open | WagerStatus::Accepting, false) => ExpectedBalance::Empty,
                (WagerStatus::Settling, _) => expected_deposit(&wager),
                (WagerStatus::Completed | WagerStatus::Cancelled, _) => {
                    ExpectedBalance::AtMostDust
                }
            };
            check_address(
                network,
                config,
                &mut report,
                &wager.id,
                Some(status),
                Role::Creator,
                &wager.creator_escrow.address,
                creator,
            )
            .await;

            if let Some(escrow) = &wager.acceptor_escrow {
                let acceptor = match status {
                    WagerStatus::Accepting => ExpectedBalance::Empty,
                    WagerStatus::Settling => expected_deposit(&wager),
                    _ => ExpectedBalance::AtMostDust,
                };
                check_address(
                    network,
                    config,
                    &mut report,
                    &wager.id,
                    Some(status),
                    Role::Acceptor,
                    &escrow.address,
                    acceptor,
                )
                .await;
            }
        }
    }

    for retired in state.retired_escrows().await? {
        check_address(
            network,
            config,
            &mut report,
            &retired.wager_id,
            None,
            Role::Acceptor,
            &retired.escrow.address,
            ExpectedBalance::Empty,
        )
        .await;
    }

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn check_address(
    network: &dyn NetworkClient,
    config: &EngineConfig,
    report: &mut ConsistencyReport,
    wager_id: &str,
    status: Option<WagerStatus>,
    role: Role,
    address: &str,
    expected: ExpectedBalance,
) {
    report.escrows_checked += 1;

    let balance = with_backoff(&config.retry, "report balance", move || async move {
        Ok(network.get_balance(address).await?)
    })
    .await;

    match balance {
        Ok(actual) if expected.holds(actual, config.dust_limit) => {}
        Ok(actual) => report.inconsistencies.push(Inconsistency {
            wager_id: wager_id.to_string(),
            status,
            role,
            escrow_address: address.to_string(),
            expected,
            actual,
        }),
        Err(e) => {
            warn!("Could not read balance of {}: {}", address, e);
            report.unreachable.push(address.to_string());
        }
    }
}
