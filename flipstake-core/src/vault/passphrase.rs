use super::{EscrowSecret, SecretVault};
use crate::error::{FlipstakeError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

const ENVELOPE_VERSION: u8 = 1;
const DEFAULT_ROUNDS: u32 = 100_000;
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = 1 + 4 + SALT_SIZE + NONCE_SIZE;

/// ChaCha20-Poly1305 vault keyed from an operator passphrase via PBKDF2.
///
/// Envelope layout: `version || rounds (u32 BE) || salt || nonce || ciphertext`.
pub struct PassphraseVault {
    passphrase: String,
    rounds: u32,
}

impl PassphraseVault {
    pub fn new(passphrase: impl Into<String>) -> Result<Self> {
        Self::with_rounds(passphrase, DEFAULT_ROUNDS)
    }

    /// Lower round counts are only meant for tests.
    pub fn with_rounds(passphrase: impl Into<String>, rounds: u32) -> Result<Self> {
        let passphrase = passphrase.into();
        if passphrase.is_empty() {
            return Err(FlipstakeError::vault("Vault passphrase cannot be empty"));
        }
        if rounds == 0 {
            return Err(FlipstakeError::vault("PBKDF2 rounds must be non-zero"));
        }
        Ok(Self { passphrase, rounds })
    }

    fn derive_key(&self, salt: &[u8], rounds: u32) -> Key {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(self.passphrase.as_bytes(), salt, rounds, &mut key);
        *Key::from_slice(&key)
    }
}

impl SecretVault for PassphraseVault {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(&self.derive_key(&salt, self.rounds));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| FlipstakeError::vault(format!("Encryption failed: {}", e)))?;

        let mut envelope = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&self.rounds.to_be_bytes());
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    fn decrypt(&self, envelope: &[u8]) -> Result<EscrowSecret> {
        if envelope.len() <= HEADER_SIZE {
            return Err(FlipstakeError::vault("Ciphertext envelope is truncated"));
        }
        if envelope[0] != ENVELOPE_VERSION {
            return Err(FlipstakeError::vault(format!(
                "Unsupported envelope version {}",
                envelope[0]
            )));
        }

        let mut rounds = [0u8; 4];
        rounds.copy_from_slice(&envelope[1..5]);
        let rounds = u32::from_be_bytes(rounds);
        let salt = &envelope[5..5 + SALT_SIZE];
        let nonce = &envelope[5 + SALT_SIZE..HEADER_SIZE];

        let cipher = ChaCha20Poly1305::new(&self.derive_key(salt, rounds));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), &envelope[HEADER_SIZE..])
            .map_err(|_| FlipstakeError::vault("Decryption failed"))?;

        Ok(EscrowSecret::new(plaintext))
    }
}
