use crate::error::{EngineError, Result};
use bitcoin::Amount;
use chrono::Utc;
use flipstake_core::storage::SignatureStore;
use flipstake_core::{NetworkClient, Storage, UsedSignature};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a deposit must look like to be accepted.
#[derive(Debug, Clone)]
pub struct DepositExpectation<'a> {
    pub escrow_address: &'a str,
    pub payer: &'a str,
    pub amount: Amount,
    pub signature: &'a str,
}

#[derive(Debug, Clone)]
pub struct VerifiedDeposit {
    pub signature: String,
    pub payer: String,
    pub amount: Amount,
}

impl VerifiedDeposit {
    pub fn into_used(self, purpose: impl Into<String>) -> UsedSignature {
        UsedSignature {
            signature: self.signature,
            payer: self.payer,
            purpose: purpose.into(),
            used_at: Utc::now(),
        }
    }
}

/// Checks deposits against the network. Read-only: recording the signature
/// as used happens in the state machine, atomically with the transition.
pub struct DepositVerifier {
    storage: Arc<Storage>,
    network: Arc<dyn NetworkClient>,
}

impl DepositVerifier {
    pub fn new(storage: Arc<Storage>, network: Arc<dyn NetworkClient>) -> Self {
        Self { storage, network }
    }

    pub async fn ensure_unused(&self, signature: &str) -> Result<()> {
        if signature.trim().is_empty() {
            return Err(EngineError::validation("malformed signature"));
        }
        if SignatureStore::new(&self.storage).is_used(signature).await? {
            return Err(EngineError::validation("signature already used"));
        }
        Ok(())
    }

    pub async fn verify(&self, expected: &DepositExpectation<'_>) -> Result<VerifiedDeposit> {
        self.ensure_unused(expected.signature).await?;

        let tx = self
            .network
            .get_transaction(expected.signature)
            .await?
            .ok_or_else(|| {
                EngineError::TransientChain(format!(
                    "transaction {} not seen yet",
                    expected.signature
                ))
            })?;

        if !tx.finalized {
            debug!("Deposit {} not final yet", expected.signature);
            return Err(EngineError::TransientChain(format!(
                "transaction {} not finalized",
                expected.signature
            )));
        }

        if !tx.pays(expected.escrow_address) {
            warn!(
                "Deposit {} does not pay escrow {}",
                expected.signature, expected.escrow_address
            );
            return Err(EngineError::validation(
                "deposit was not sent to the escrow address",
            ));
        }

        if tx.sender.as_deref() != Some(expected.payer) {
            warn!(
                "Deposit {} sent by {:?}, expected {}",
                expected.signature, tx.sender, expected.payer
            );
            return Err(EngineError::validation(
                "deposit was not sent from the registered wallet",
            ));
        }

        let amount = tx.amount_to(expected.escrow_address);
        if amount != expected.amount {
            warn!(
                "Deposit {} paid {}, expected {}",
                expected.signature, amount, expected.amount
            );
            return Err(EngineError::validation(format!(
                "deposit amount {} does not match the required {}",
                amount, expected.amount
            )));
        }

        Ok(VerifiedDeposit {
            signature: tx.signature,
            payer: expected.payer.to_string(),
            amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flipstake_core::MemoryNetwork;
    use tempfile::TempDir;

    async fn setup() -> (DepositVerifier, Arc<MemoryNetwork>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("verifier.db")).await.unwrap());
        let network = Arc::new(MemoryNetwork::default());
        let verifier = DepositVerifier::new(storage, network.clone());
        (verifier, network, dir)
    }

    fn expectation<'a>(signature: &'a str, amount: Amount) -> DepositExpectation<'a> {
        DepositExpectation {
            escrow_address: "escrow",
            payer: "payer",
            amount,
            signature,
        }
    }

    #[tokio::test]
    async fn test_accepts_exact_finalized_deposit() {
        let (verifier, network, _dir) = setup().await;
        let sig = network.deposit("payer", "escrow", Amount::from_sat(3_500_000));

        let verified = verifier
            .verify(&expectation(&sig, Amount::from_sat(3_500_000)))
            .await
            .unwrap();
        assert_eq!(verified.amount, Amount::from_sat(3_500_000));
        assert_eq!(verified.into_used("creator_deposit").payer, "payer");
    }

    #[tokio::test]
    async fn test_unfinalized_is_transient() {
        let (verifier, network, _dir) = setup().await;
        let sig = network.deposit_pending("payer", "escrow", Amount::from_sat(3_500_000));

        let err = verifier
            .verify(&expectation(&sig, Amount::from_sat(3_500_000)))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        network.finalize(&sig);
        assert!(verifier
            .verify(&expectation(&sig, Amount::from_sat(3_500_000)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_mismatches_are_permanent() {
        let (verifier, network, _dir) = setup().await;

        let short = network.deposit("payer", "escrow", Amount::from_sat(3_499_999));
        let err = verifier
            .verify(&expectation(&short, Amount::from_sat(3_500_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let stranger = network.deposit("stranger", "escrow", Amount::from_sat(3_500_000));
        let err = verifier
            .verify(&expectation(&stranger, Amount::from_sat(3_500_000)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("registered wallet"));

        let elsewhere = network.deposit("payer", "other", Amount::from_sat(3_500_000));
        let err = verifier
            .verify(&expectation(&elsewhere, Amount::from_sat(3_500_000)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("escrow address"));
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_transient() {
        let (verifier, _network, _dir) = setup().await;
        let err = verifier
            .verify(&expectation("deadbeef", Amount::from_sat(1)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
