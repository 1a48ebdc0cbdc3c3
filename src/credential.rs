//! Process master key and per-module credentials.
//!
//! The master key never leaves the kernel. Each sandbox receives a child key
//! derived from the master key and its own domain, so two modules never share
//! a secret and no module can recover the master key from what it is given.

use base64::Engine;
use sha2::{Digest, Sha512};
use thiserror::Error;

/// Length of the process master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

/// Derivation path prefix for module credentials.
const MODULE_KEY_PATH: &str = "moduleKeyDerivation";

/// Master key loading errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The key material is not valid hex.
    #[error("master key is not valid hex: {0}")]
    InvalidHex(String),
    /// The decoded key has the wrong length.
    #[error("master key must be {MASTER_KEY_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// The process master key. Debug output is always redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns an error when the text is not hex or has the wrong length.
    pub fn from_hex(text: &str) -> Result<Self, CredentialError> {
        let bytes =
            hex::decode(text.trim()).map_err(|e| CredentialError::InvalidHex(e.to_string()))?;
        let len = bytes.len();
        let key: [u8; MASTER_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CredentialError::WrongLength(len))?;
        Ok(Self(key))
    }

    /// Generate a fresh random key for processes without a configured one.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Raw key material. Only nonce derivation and key derivation read this.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Derive a child key for an arbitrary derivation path.
    pub fn derive_child(&self, path: &str) -> ChildKey {
        let tag = Sha512::digest(path.as_bytes());
        let mut hasher = Sha512::new();
        hasher.update(self.0);
        hasher.update(tag);
        let mut key = [0u8; 64];
        key.copy_from_slice(&hasher.finalize());
        ChildKey(key)
    }

    /// Derive the credential handed to the sandbox for `domain`.
    pub fn derive_module_key(&self, domain: &str) -> ChildKey {
        self.derive_child(&format!("{MODULE_KEY_PATH}{domain}"))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// A derived, domain-scoped key.
#[derive(Clone, PartialEq, Eq)]
pub struct ChildKey([u8; 64]);

impl ChildKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Standard base64 of the key, as sent to the sandbox.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl std::fmt::Debug for ChildKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChildKey([REDACTED])")
    }
}
