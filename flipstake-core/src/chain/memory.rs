use super::NetworkClient;
use crate::error::{FlipstakeError, Result};
use crate::escrow::address_for_secret;
use crate::types::{ChainTransaction, EntropyToken, Transfer, TxOutput};
use crate::vault::EscrowSecret;
use async_trait::async_trait;
use bitcoin::{Amount, Network};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// In-process ledger implementing [`NetworkClient`].
///
/// Used by tests and local dry runs: balances, finality, per-transfer gas and
/// injected failures are all simulated. Addresses are regtest addresses.
pub struct MemoryNetwork {
    state: Mutex<LedgerState>,
    gas: Amount,
    dust_limit: Amount,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, Amount>,
    transactions: HashMap<String, ChainTransaction>,
    height: u32,
    tx_counter: u64,
    entropy_fetches: u32,
    transfers_sent: u32,
    fail_after: Option<u32>,
    offline: bool,
    gas_spent: Amount,
}

impl LedgerState {
    fn next_signature(&mut self) -> String {
        self.tx_counter += 1;
        hex::encode(Sha256::digest(format!("memory-tx-{}", self.tx_counter)))
    }

    fn credit(&mut self, address: &str, amount: Amount) {
        let balance = self.balances.entry(address.to_string()).or_insert(Amount::ZERO);
        *balance += amount;
    }

    fn check_online(&self) -> Result<()> {
        if self.offline {
            return Err(FlipstakeError::chain_unavailable("memory network is offline"));
        }
        Ok(())
    }

    fn check_transfer_budget(&self) -> Result<()> {
        self.check_online()?;
        match self.fail_after {
            Some(limit) if self.transfers_sent >= limit => {
                Err(FlipstakeError::transfer("injected transfer failure"))
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, sender: Option<&str>, to: &str, amount: Amount, finalized: bool) -> String {
        let signature = self.next_signature();
        self.transactions.insert(
            signature.clone(),
            ChainTransaction {
                signature: signature.clone(),
                sender: sender.map(str::to_string),
                outputs: vec![TxOutput {
                    address: to.to_string(),
                    amount,
                }],
                finalized,
            },
        );
        signature
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(Amount::from_sat(1_000), Amount::from_sat(546))
    }
}

impl MemoryNetwork {
    pub fn new(gas: Amount, dust_limit: Amount) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            gas,
            dust_limit,
        }
    }

    pub fn gas(&self) -> Amount {
        self.gas
    }

    /// Simulates an external wallet paying `to`. Returns the signature.
    pub fn deposit(&self, from: &str, to: &str, amount: Amount) -> String {
        let mut state = self.state.lock();
        state.credit(to, amount);
        state.record(Some(from), to, amount, true)
    }

    /// Like [`MemoryNetwork::deposit`] but not yet final.
    pub fn deposit_pending(&self, from: &str, to: &str, amount: Amount) -> String {
        let mut state = self.state.lock();
        state.credit(to, amount);
        state.record(Some(from), to, amount, false)
    }

    pub fn finalize(&self, signature: &str) {
        if let Some(tx) = self.state.lock().transactions.get_mut(signature) {
            tx.finalized = true;
        }
    }

    pub fn balance_of(&self, address: &str) -> Amount {
        self.state
            .lock()
            .balances
            .get(address)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Every transfer after the first `n` successful ones fails.
    pub fn fail_transfers_after(&self, n: u32) {
        self.state.lock().fail_after = Some(n);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn entropy_fetches(&self) -> u32 {
        self.state.lock().entropy_fetches
    }

    pub fn transfers_sent(&self) -> u32 {
        self.state.lock().transfers_sent
    }

    pub fn gas_spent(&self) -> Amount {
        self.state.lock().gas_spent
    }
}

#[async_trait]
impl NetworkClient for MemoryNetwork {
    async fn get_finalized_entropy(&self) -> Result<EntropyToken> {
        let mut state = self.state.lock();
        state.check_online()?;

        // every fetch observes a newly finalized block
        state.height += 1;
        state.entropy_fetches += 1;
        let height = state.height;
        Ok(EntropyToken {
            height,
            value: hex::encode(Sha256::digest(height.to_be_bytes())),
        })
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<ChainTransaction>> {
        let state = self.state.lock();
        state.check_online()?;
        Ok(state.transactions.get(signature).cloned())
    }

    async fn get_balance(&self, address: &str) -> Result<Amount> {
        let state = self.state.lock();
        state.check_online()?;
        Ok(state.balances.get(address).copied().unwrap_or(Amount::ZERO))
    }

    async fn transfer(&self, secret: &EscrowSecret, to: &str, amount: Amount) -> Result<String> {
        let from = address_for_secret(secret, Network::Regtest)?.to_string();
        let mut state = self.state.lock();
        state.check_transfer_budget()?;

        let available = state.balances.get(&from).copied().unwrap_or(Amount::ZERO);
        let needed = amount + self.gas;
        if available < needed {
            return Err(FlipstakeError::InsufficientFunds {
                need: needed.to_sat(),
                available: available.to_sat(),
            });
        }

        state.balances.insert(from.clone(), available - needed);
        state.credit(to, amount);
        state.gas_spent += self.gas;
        state.transfers_sent += 1;
        let signature = state.record(Some(&from), to, amount, true);
        debug!("memory transfer {} {} -> {}", amount, from, to);
        Ok(signature)
    }

    async fn sweep(&self, secret: &EscrowSecret, to: &str) -> Result<Option<Transfer>> {
        let from = address_for_secret(secret, Network::Regtest)?.to_string();
        let mut state = self.state.lock();
        state.check_transfer_budget()?;

        let available = state.balances.get(&from).copied().unwrap_or(Amount::ZERO);
        let value = match available.checked_sub(self.gas) {
            Some(value) if value > self.dust_limit => value,
            _ => return Ok(None),
        };

        state.balances.insert(from.clone(), Amount::ZERO);
        state.credit(to, value);
        state.gas_spent += self.gas;
        state.transfers_sent += 1;
        let signature = state.record(Some(&from), to, value, true);
        Ok(Some(Transfer {
            signature,
            amount: value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::EscrowProvisioner;
    use crate::vault::PassphraseVault;
    use std::sync::Arc;

    fn provisioner() -> EscrowProvisioner {
        let vault = PassphraseVault::with_rounds("memory", 1_000).unwrap();
        EscrowProvisioner::new(Arc::new(vault), Network::Regtest)
    }

    #[tokio::test]
    async fn test_transfer_charges_gas_to_source() {
        let network = MemoryNetwork::default();
        let provisioner = provisioner();
        let escrow = provisioner.provision().unwrap();
        let sink = provisioner.provision().unwrap();
        network.deposit("payer", &escrow.address, Amount::from_sat(100_000));

        let secret = provisioner.unlock(&escrow).unwrap();
        network
            .transfer(&secret, &sink.address, Amount::from_sat(40_000))
            .await
            .unwrap();

        assert_eq!(network.balance_of(&sink.address), Amount::from_sat(40_000));
        assert_eq!(network.balance_of(&escrow.address), Amount::from_sat(59_000));
    }

    #[tokio::test]
    async fn test_sweep_leaves_dust() {
        let network = MemoryNetwork::default();
        let provisioner = provisioner();
        let escrow = provisioner.provision().unwrap();
        network.deposit("payer", &escrow.address, Amount::from_sat(1_200));

        let secret = provisioner.unlock(&escrow).unwrap();
        let swept = network.sweep(&secret, "treasury").await.unwrap();

        assert!(swept.is_none());
        assert_eq!(network.balance_of(&escrow.address), Amount::from_sat(1_200));
    }

    #[tokio::test]
    async fn test_each_entropy_fetch_is_fresh() {
        let network = MemoryNetwork::default();
        let a = network.get_finalized_entropy().await.unwrap();
        let b = network.get_finalized_entropy().await.unwrap();

        assert_ne!(a, b);
        assert_eq!(network.entropy_fetches(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let network = MemoryNetwork::default();
        let provisioner = provisioner();
        let escrow = provisioner.provision().unwrap();
        network.deposit("payer", &escrow.address, Amount::from_sat(100_000));
        network.fail_transfers_after(0);

        let secret = provisioner.unlock(&escrow).unwrap();
        let result = network.transfer(&secret, "x", Amount::from_sat(1_000)).await;
        assert!(matches!(result, Err(FlipstakeError::Transfer(_))));

        network.set_offline(true);
        let result = network.get_balance(&escrow.address).await;
        assert!(result.unwrap_err().is_transient());
    }
}
