mod esplora;
mod failover;
mod memory;

pub use esplora::EsploraNetwork;
pub use failover::{CircuitState, EndpointHealth, EndpointStatus, FailoverNetwork};
pub use memory::MemoryNetwork;

use crate::error::Result;
use crate::types::{ChainTransaction, EntropyToken, Transfer};
use crate::vault::EscrowSecret;
use async_trait::async_trait;
use bitcoin::Amount;

/// Everything the engine needs from the settlement network.
///
/// Implementations fetch fresh routing data (UTXOs, fee rates) on every
/// call; nothing is cached between attempts.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Unpredictable token read from the most recent finalized block.
    async fn get_finalized_entropy(&self) -> Result<EntropyToken>;

    /// `Ok(None)` when the network has never seen `signature`.
    async fn get_transaction(&self, signature: &str) -> Result<Option<ChainTransaction>>;

    async fn get_balance(&self, address: &str) -> Result<Amount>;

    /// Sends `amount` out of the escrow, paying gas from what remains.
    async fn transfer(&self, secret: &EscrowSecret, to: &str, amount: Amount) -> Result<String>;

    /// Moves the escrow's whole balance minus gas. `None` when only dust is left.
    async fn sweep(&self, secret: &EscrowSecret, to: &str) -> Result<Option<Transfer>>;
}
