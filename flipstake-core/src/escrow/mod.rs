use crate::error::{FlipstakeError, Result};
use crate::types::EscrowRef;
use crate::vault::{EscrowSecret, SecretVault};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network};
use rand::{rngs::OsRng, RngCore};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};
use zeroize::{Zeroize, Zeroizing};

/// Creates one disposable escrow account per wager side.
///
/// The raw key only lives on the stack of [`EscrowProvisioner::provision`]
/// until the vault has encrypted it.
pub struct EscrowProvisioner {
    vault: Arc<dyn SecretVault>,
    network: Network,
}

impl EscrowProvisioner {
    pub fn new(vault: Arc<dyn SecretVault>, network: Network) -> Self {
        Self { vault, network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn provision(&self) -> Result<EscrowRef> {
        let secret_key = generate_secret_key();
        let address = address_for_key(&secret_key, self.network)?;
        let raw = Zeroizing::new(secret_key.secret_bytes());

        let encrypted_secret = self
            .vault
            .encrypt(raw.as_slice())
            .map_err(|e| {
                error!("Escrow key encryption failed for {}: {}", address, e);
                e
            })?;

        debug!("Provisioned escrow {}", address);

        Ok(EscrowRef {
            address: address.to_string(),
            encrypted_secret,
        })
    }

    /// Decrypts an escrow key for a single signing call.
    pub fn unlock(&self, escrow: &EscrowRef) -> Result<EscrowSecret> {
        self.vault.decrypt(&escrow.encrypted_secret)
    }
}

fn generate_secret_key() -> SecretKey {
    let mut bytes = [0u8; 32];
    loop {
        OsRng.fill_bytes(&mut bytes);
        // Out-of-range scalars are astronomically rare; draw again
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            bytes.zeroize();
            return key;
        }
    }
}

fn address_for_key(secret_key: &SecretKey, network: Network) -> Result<Address> {
    let secp = Secp256k1::new();
    let pubkey = secret_key.public_key(&secp);
    let wpkh = CompressedPublicKey::from_slice(&pubkey.serialize())
        .map_err(|e| FlipstakeError::internal(format!("Failed to create WPKH: {}", e)))?;
    Ok(Address::p2wpkh(&wpkh, network))
}

/// P2WPKH address controlled by a decrypted escrow secret.
pub fn address_for_secret(secret: &EscrowSecret, network: Network) -> Result<Address> {
    let key = secret_key_from(secret)?;
    address_for_key(&key, network)
}

pub fn secret_key_from(secret: &EscrowSecret) -> Result<SecretKey> {
    SecretKey::from_slice(secret.expose_secret())
        .map_err(|_| FlipstakeError::vault("Decrypted escrow key is malformed"))
}

/// Parses an address and checks it belongs to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    Address::from_str(address)
        .map_err(|e| FlipstakeError::InvalidAddress(format!("{}: {}", address, e)))?
        .require_network(network)
        .map_err(|e| FlipstakeError::InvalidAddress(format!("{}: {}", address, e)))
}
