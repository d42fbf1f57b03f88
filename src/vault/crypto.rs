//! CredentialVault cryptographic core (spec.md §4.3): AES-256-GCM
//! authenticated encryption, SHA-256 hashing/fingerprinting, and
//! deterministic user-id derivation.
//!
//! Grounded on the AES-256-GCM idiom in the pack's `client-vault-rs` crate
//! (`Aead`, `KeyInit`, `Nonce`) and the teacher's HMAC-SHA256 signing style
//! in `vault/execution.rs`, generalized here to plain SHA-256 fingerprinting.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("MASTER_KEY environment variable is not set")]
    MissingMasterKey,
    #[error("ciphertext authentication failed")]
    AuthenticationFailed,
    #[error("malformed ciphertext encoding: {0}")]
    Encoding(String),
}

/// The 256-bit AES key, held read-only for the process lifetime after
/// startup (spec.md §5: "The master AES key is read-only after startup").
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Derive the AES-256 key as SHA-256 of the operator-provided master
    /// secret (spec.md §4.3).
    pub fn derive(master_secret: &str) -> Self {
        let digest = Sha256::digest(master_secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Read `MASTER_KEY` from the environment; fatal (spec.md §4.3,
    /// §6: "MASTER_KEY (mandatory)") if absent.
    pub fn from_env() -> Result<Self, VaultError> {
        let secret = std::env::var("MASTER_KEY").map_err(|_| VaultError::MissingMasterKey)?;
        Ok(Self::derive(&secret))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Encrypt `plaintext` with a fresh random 12-byte nonce. Output is
/// `nonce || tag || ciphertext`, hex-encoded (spec.md §4.3). `aes-gcm`
/// appends the 16-byte tag to the ciphertext itself, so the wire layout is
/// produced by simply prepending the nonce to that combined buffer.
pub fn encrypt(master_key: &MasterKey, plaintext: &[u8]) -> String {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // `encrypt` cannot fail for a well-formed key/nonce pair.
    let ciphertext_and_tag = master_key
        .cipher()
        .encrypt(nonce, plaintext)
        .expect("AES-GCM encryption failed");

    let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext_and_tag.len());
    wire.extend_from_slice(&nonce_bytes);
    wire.extend_from_slice(&ciphertext_and_tag);
    hex::encode(wire)
}

/// Decrypt a `nonce || tag || ciphertext` hex string produced by
/// `encrypt`. Tag failure is a fatal vault error, not silently swallowed
/// (spec.md §4.3).
pub fn decrypt(master_key: &MasterKey, ciphertext_hex: &str) -> Result<Vec<u8>, VaultError> {
    let wire = hex::decode(ciphertext_hex).map_err(|e| VaultError::Encoding(e.to_string()))?;
    if wire.len() < NONCE_LEN {
        return Err(VaultError::Encoding("ciphertext shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext_and_tag) = wire.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    master_key
        .cipher()
        .decrypt(nonce, ciphertext_and_tag)
        .map_err(|_| VaultError::AuthenticationFailed)
}

/// SHA-256 of `bytes`, hex-encoded.
pub fn hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonical credential string used for both the fingerprint and the
/// deterministic user-id: `key:secret:passphrase`, where an absent
/// passphrase contributes an empty string (spec.md §3, §4.3).
fn canonical_credential_string(key: &str, secret: &str, passphrase: Option<&str>) -> String {
    format!("{}:{}:{}", key, secret, passphrase.unwrap_or(""))
}

/// SHA-256 over `key:secret:passphrase`, used for duplicate-account
/// detection (spec.md §3, §4.3) — never used as an encryption key.
pub fn fingerprint(key: &str, secret: &str, passphrase: Option<&str>) -> String {
    hash(canonical_credential_string(key, secret, passphrase).as_bytes())
}

/// Deterministic type-4 UUID derived from `venue:key:secret:passphrase`
/// (spec.md §4.3): SHA-256 of that string, leading 128 bits reinterpreted
/// as a UUID with the version nibble set to 4 and the variant bits set to
/// the RFC-4122 `10` pattern.
pub fn derive_user_id(venue: &str, key: &str, secret: &str, passphrase: Option<&str>) -> Uuid {
    let canonical = format!(
        "{}:{}",
        venue,
        canonical_credential_string(key, secret, passphrase)
    );
    let digest = Sha256::digest(canonical.as_bytes());

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[0..16]);
    bytes[6] = (bytes[6] & 0x0F) | 0x40; // version 4
    bytes[8] = (bytes[8] & 0x3F) | 0x80; // variant 10

    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_inverts_encrypt() {
        let key = MasterKey::derive("operator-secret");
        let plaintext = b"super-secret-api-key";
        let ciphertext = encrypt(&key, plaintext);
        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encrypt_is_nondeterministic_across_calls() {
        let key = MasterKey::derive("operator-secret");
        let a = encrypt(&key, b"same-plaintext");
        let b = encrypt(&key, b"same-plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let key = MasterKey::derive("operator-secret");
        let mut wire = hex::decode(encrypt(&key, b"data")).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let tampered = hex::encode(wire);

        let result = decrypt(&key, &tampered);
        assert!(matches!(result, Err(VaultError::AuthenticationFailed)));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let key_a = MasterKey::derive("secret-a");
        let key_b = MasterKey::derive("secret-b");
        let ciphertext = encrypt(&key_a, b"data");
        assert!(matches!(decrypt(&key_b, &ciphertext), Err(VaultError::AuthenticationFailed)));
    }

    #[test]
    fn deterministic_user_id_is_stable() {
        let id1 = derive_user_id("binance", "K1", "S1", Some(""));
        let id2 = derive_user_id("binance", "K1", "S1", Some(""));
        assert_eq!(id1, id2);

        // version 4, variant 10
        assert_eq!(id1.get_version_num(), 4);
    }

    #[test]
    fn deterministic_user_id_differs_across_credentials() {
        let id1 = derive_user_id("binance", "K1", "S1", None);
        let id2 = derive_user_id("binance", "K2", "S1", None);
        assert_ne!(id1, id2);
    }

    #[test]
    fn fingerprint_matches_literal_scenario() {
        // Scenario 1 in spec.md §8: key="K1", secret="S1", passphrase=""
        let fp = fingerprint("K1", "S1", Some(""));
        let expected = hash(b"K1:S1:");
        assert_eq!(fp, expected);
    }
}
