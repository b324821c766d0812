use crate::error::Result;
use crate::retry::with_backoff;
use crate::state::LockedStakes;
use chrono::Utc;
use flipstake_core::{NetworkClient, OutcomeRecord, RetryPolicy, Side, Wager};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

/// SHA-256 over the entropy token followed by the wager id.
pub fn outcome_digest(entropy: &str, wager_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entropy.as_bytes());
    hasher.update(wager_id.as_bytes());
    hasher.finalize().into()
}

/// Even first byte is heads, odd is tails.
pub fn side_for_byte(byte: u8) -> Side {
    if byte % 2 == 0 {
        Side::Heads
    } else {
        Side::Tails
    }
}

/// Pure outcome function; anyone holding the token and id can recompute it.
pub fn resolve(entropy: &str, wager_id: &str) -> Side {
    side_for_byte(outcome_digest(entropy, wager_id)[0])
}

pub struct OutcomeEngine {
    network: Arc<dyn NetworkClient>,
    retry: RetryPolicy,
}

impl OutcomeEngine {
    pub fn new(network: Arc<dyn NetworkClient>, retry: RetryPolicy) -> Self {
        Self { network, retry }
    }

    /// Fetches fresh entropy for a locked wager and derives its outcome.
    ///
    /// Every call performs a new fetch; tokens are never cached.
    pub async fn draw(&self, locked: &LockedStakes) -> Result<OutcomeRecord> {
        let wager = locked.wager();
        let entropy = with_backoff(&self.retry, "entropy fetch", move || async move {
            Ok(self.network.get_finalized_entropy().await?)
        })
        .await?;

        let digest = outcome_digest(&entropy.value, &wager.id);
        let side = side_for_byte(digest[0]);
        let winner = wager.role_for_side(side);

        info!(
            "Wager {} resolved {} from block {} ({} wins)",
            wager.id, side, entropy.height, winner
        );

        Ok(OutcomeRecord {
            wager_id: wager.id.clone(),
            entropy,
            digest: hex::encode(digest),
            side,
            winner,
            created_at: Utc::now(),
        })
    }

    /// Recomputes a stored outcome against its wager.
    pub fn verify(record: &OutcomeRecord, wager: &Wager) -> bool {
        let digest = outcome_digest(&record.entropy.value, &wager.id);
        let side = side_for_byte(digest[0]);

        record.wager_id == wager.id
            && record.digest == hex::encode(digest)
            && record.side == side
            && record.winner == wager.role_for_side(side)
    }
}
