use crate::error::{FlipstakeError, Result};
use crate::escrow::parse_address;
use bitcoin::{Amount, Network};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub network: Network,
    /// Esplora endpoints in order of preference; later ones are fallbacks.
    pub esplora_urls: Vec<String>,
    /// Receives participant fees and escrow residue.
    pub treasury_address: String,
    /// Fixed fee each participant deposits on top of the stake.
    pub participant_fee: Amount,
    /// Winner share of the combined stake, in basis points.
    pub payout_bps: u32,
    pub finality_depth: u32,
    pub abandon_timeout: Duration,
    pub dust_limit: Amount,
    pub min_stake: Amount,
    pub max_stake: Amount,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Per-endpoint circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close it again.
    pub success_threshold: u32,
    /// How long an open circuit is skipped before it is tried again.
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            esplora_urls: vec!["http://localhost:3000".to_string()],
            treasury_address: String::new(),
            participant_fee: Amount::from_sat(2_500_000), // 0.025 BTC
            payout_bps: 9_800,
            finality_depth: 6,
            abandon_timeout: Duration::from_secs(300), // 5 minutes
            dust_limit: Amount::from_sat(546),
            min_stake: Amount::from_sat(10_000),
            max_stake: Amount::from_sat(100_000_000),
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(network: Network) -> Self {
        let mut config = Self::default();
        config.network = network;

        match network {
            Network::Bitcoin => {
                config.esplora_urls = vec![
                    "https://blockstream.info/api".to_string(),
                    "https://mempool.space/api".to_string(),
                ];
            }
            Network::Testnet => {
                config.esplora_urls = vec![
                    "https://blockstream.info/testnet/api".to_string(),
                    "https://mempool.space/testnet/api".to_string(),
                ];
            }
            Network::Signet => {
                config.esplora_urls = vec!["https://mempool.space/signet/api".to_string()];
            }
            Network::Regtest => {
                // keep defaults for regtest
                config.finality_depth = 1;
            }
            _ => {
                config.esplora_urls = vec!["http://localhost:3000".to_string()];
            }
        }

        config
    }

    pub fn with_treasury(mut self, address: impl Into<String>) -> Self {
        self.treasury_address = address.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.esplora_urls.is_empty() {
            return Err(FlipstakeError::config("At least one Esplora URL is required"));
        }
        if self.esplora_urls.iter().any(|url| url.trim().is_empty()) {
            return Err(FlipstakeError::config("Esplora URL cannot be empty"));
        }

        if self.treasury_address.is_empty() {
            return Err(FlipstakeError::config("Treasury address cannot be empty"));
        }
        parse_address(&self.treasury_address, self.network)
            .map_err(|e| FlipstakeError::config(format!("Treasury address: {}", e)))?;

        if self.payout_bps == 0 || u128::from(self.payout_bps) > BPS_DENOMINATOR {
            return Err(FlipstakeError::config(
                "Payout must be between 1 and 10000 basis points",
            ));
        }

        if self.finality_depth == 0 {
            return Err(FlipstakeError::config("Finality depth must be at least 1"));
        }

        if self.participant_fee <= self.dust_limit {
            return Err(FlipstakeError::config(
                "Participant fee must exceed the dust limit",
            ));
        }

        if self.min_stake <= self.dust_limit {
            return Err(FlipstakeError::config("Minimum stake must exceed the dust limit"));
        }

        if self.min_stake > self.max_stake {
            return Err(FlipstakeError::config(
                "Minimum stake cannot exceed maximum stake",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(FlipstakeError::config("Retry attempts must be at least 1"));
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(FlipstakeError::config(
                "Circuit breaker thresholds must be at least 1",
            ));
        }

        Ok(())
    }

    /// Exact amount each participant must deposit into their escrow.
    pub fn expected_deposit(&self, stake: Amount) -> Amount {
        stake + self.participant_fee
    }

    /// Winner payout for a wager, rounded half-up to the satoshi.
    pub fn payout_for(&self, stake: Amount) -> Amount {
        let pot = u128::from(stake.to_sat()) * 2;
        let scaled = pot * u128::from(self.payout_bps);
        let sats = (scaled + BPS_DENOMINATOR / 2) / BPS_DENOMINATOR;
        // bps <= 10000 keeps the result within 2 * stake
        Amount::from_sat(sats as u64)
    }
}
