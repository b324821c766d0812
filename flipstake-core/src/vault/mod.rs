mod passphrase;

pub use passphrase::PassphraseVault;

use crate::error::Result;
use std::fmt;
use zeroize::Zeroize;

/// Encrypts escrow keys at rest.
///
/// All key material passes through an implementation of this trait; nothing
/// else in the workspace touches raw escrow keys except the signing call in
/// the network client.
pub trait SecretVault: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<EscrowSecret>;
}

/// Decrypted escrow key. Wiped on drop and never printed.
pub struct EscrowSecret(Vec<u8>);

impl EscrowSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn expose_secret(&self) -> &[u8] {
        &self.0
    }

    fn wipe(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for EscrowSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EscrowSecret(<redacted>)")
    }
}

impl Drop for EscrowSecret {
    fn drop(&mut self) {
        self.wipe();
    }
}
