//! Signed registry entries.
//!
//! An entry is published under an Ed25519 public key and points at the
//! current immutable identifier for a resolver. Wire form:
//!
//! ```text
//! [0x07][0xed][pubkey: 32][revision: u64 LE][len: u8][data: len][signature: 64]
//! ```
//!
//! The signature covers `[0x07][revision][len][data]`. Nothing in `data` is
//! trusted until the signature has been checked against the resolver's key.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use thiserror::Error;

use crate::identifier::{Identifier, IdentifierError, IdentifierKind, HASH_TYPE_ED25519};

/// Record type tag for registry entries.
pub const RECORD_TYPE_REGISTRY: u8 = 0x07;

/// Payload tag marking an identifier in the entry data.
pub const PAYLOAD_TYPE_IDENTIFIER: u8 = 0x5a;

const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
// type + key type + key + revision + length byte
const HEADER_LEN: usize = 2 + PUBLIC_KEY_LEN + 8 + 1;

/// Registry entry decoding and verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    /// Not enough bytes for the fixed fields.
    #[error("registry entry is truncated ({0} bytes)")]
    Truncated(usize),
    /// Unknown record or key type.
    #[error("registry entry has unexpected type {record:#04x}/{key:#04x}")]
    UnexpectedType {
        /// Record type found.
        record: u8,
        /// Key type found.
        key: u8,
    },
    /// The length byte disagrees with the entry size.
    #[error("registry entry length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Data length the entry declares.
        declared: usize,
        /// Data length actually present.
        actual: usize,
    },
    /// The entry was signed by a different key.
    #[error("registry entry was published by a different key")]
    WrongKey,
    /// Data does not fit the one-byte length field.
    #[error("registry entry data too long ({0} bytes)")]
    DataTooLong(usize),
    /// Signature check failed.
    #[error("registry entry signature is invalid")]
    BadSignature,
    /// The payload does not name an immutable identifier.
    #[error("registry entry payload is not a content identifier: {0}")]
    Payload(String),
}

impl From<IdentifierError> for EntryError {
    fn from(e: IdentifierError) -> Self {
        Self::Payload(e.to_string())
    }
}

/// A decoded (not yet verified) registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRegistryEntry {
    /// Publisher key.
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// Monotonic revision chosen by the publisher.
    pub revision: u64,
    /// Entry payload.
    pub data: Vec<u8>,
    /// Ed25519 signature over [`Self::signed_message`].
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignedRegistryEntry {
    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not a well-formed entry.
    pub fn decode(bytes: &[u8]) -> Result<Self, EntryError> {
        if bytes.len() < HEADER_LEN.saturating_add(SIGNATURE_LEN) {
            return Err(EntryError::Truncated(bytes.len()));
        }
        let (header, rest) = bytes.split_at(HEADER_LEN);
        let [record, key, fixed @ ..] = header else {
            return Err(EntryError::Truncated(bytes.len()));
        };
        if *record != RECORD_TYPE_REGISTRY || *key != HASH_TYPE_ED25519 {
            return Err(EntryError::UnexpectedType {
                record: *record,
                key: *key,
            });
        }

        let (public_key, fixed) = fixed.split_at(PUBLIC_KEY_LEN);
        let (revision, length) = fixed.split_at(8);
        let public_key: [u8; PUBLIC_KEY_LEN] = public_key
            .try_into()
            .map_err(|_| EntryError::Truncated(bytes.len()))?;
        let revision: [u8; 8] = revision
            .try_into()
            .map_err(|_| EntryError::Truncated(bytes.len()))?;
        let declared = length.first().map_or(0, |len| usize::from(*len));

        let actual = rest.len().saturating_sub(SIGNATURE_LEN);
        if declared != actual {
            return Err(EntryError::LengthMismatch { declared, actual });
        }
        let (data, sig) = rest.split_at(actual);
        let signature: [u8; SIGNATURE_LEN] = sig
            .try_into()
            .map_err(|_| EntryError::Truncated(bytes.len()))?;

        Ok(Self {
            public_key,
            revision: u64::from_le_bytes(revision),
            data: data.to_vec(),
            signature,
        })
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN
                .saturating_add(self.data.len())
                .saturating_add(SIGNATURE_LEN),
        );
        out.push(RECORD_TYPE_REGISTRY);
        out.push(HASH_TYPE_ED25519);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.revision.to_le_bytes());
        // Entries come from `sign` or `decode`, both of which bound the length.
        out.push(u8::try_from(self.data.len()).unwrap_or(u8::MAX));
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.signature);
        out
    }

    /// Bytes covered by the signature.
    ///
    /// # Errors
    ///
    /// Returns [`EntryError::DataTooLong`] when the data exceeds 255 bytes.
    pub fn signed_message(&self) -> Result<Vec<u8>, EntryError> {
        signed_message(self.revision, &self.data)
    }

    /// Build and sign an entry.
    ///
    /// # Errors
    ///
    /// Returns [`EntryError::DataTooLong`] when `data` exceeds 255 bytes.
    pub fn sign(key: &SigningKey, revision: u64, data: Vec<u8>) -> Result<Self, EntryError> {
        let message = signed_message(revision, &data)?;
        let signature = key.sign(&message).to_bytes();
        Ok(Self {
            public_key: key.verifying_key().to_bytes(),
            revision,
            data,
            signature,
        })
    }
}

fn signed_message(revision: u64, data: &[u8]) -> Result<Vec<u8>, EntryError> {
    let len = u8::try_from(data.len()).map_err(|_| EntryError::DataTooLong(data.len()))?;
    let mut message = Vec::with_capacity(data.len().saturating_add(10));
    message.push(RECORD_TYPE_REGISTRY);
    message.extend_from_slice(&revision.to_le_bytes());
    message.push(len);
    message.extend_from_slice(data);
    Ok(message)
}

/// Encode an identifier as a registry payload.
pub fn payload_for(target: &Identifier) -> Vec<u8> {
    let mut payload = vec![PAYLOAD_TYPE_IDENTIFIER];
    payload.extend_from_slice(&target.to_bytes());
    payload
}

/// Decode a verified payload into the immutable identifier it names.
///
/// # Errors
///
/// Returns [`EntryError::Payload`] for anything but a tagged content
/// identifier.
pub fn identifier_from_payload(data: &[u8]) -> Result<Identifier, EntryError> {
    let Some((&tag, body)) = data.split_first() else {
        return Err(EntryError::Payload("empty payload".to_owned()));
    };
    if tag != PAYLOAD_TYPE_IDENTIFIER {
        return Err(EntryError::Payload(format!("unexpected payload tag {tag:#04x}")));
    }
    let id = Identifier::from_bytes(body)?;
    if id.kind() != IdentifierKind::Content {
        return Err(EntryError::Payload(
            "registry entry points at another resolver".to_owned(),
        ));
    }
    Ok(id)
}

/// Verifies a signed entry against an expected publisher key.
pub trait EntryVerifier: Send + Sync {
    /// Check `bytes` and return the entry payload when it was signed by
    /// `public_key`.
    fn verify_entry(
        &self,
        bytes: &[u8],
        public_key: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<Vec<u8>, EntryError>;
}

/// Strict Ed25519 verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl EntryVerifier for Ed25519Verifier {
    fn verify_entry(
        &self,
        bytes: &[u8],
        public_key: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<Vec<u8>, EntryError> {
        let entry = SignedRegistryEntry::decode(bytes)?;
        if &entry.public_key != public_key {
            return Err(EntryError::WrongKey);
        }
        let key = VerifyingKey::from_bytes(public_key).map_err(|_| EntryError::BadSignature)?;
        let signature = Signature::from_bytes(&entry.signature);
        key.verify_strict(&entry.signed_message()?, &signature)
            .map_err(|_| EntryError::BadSignature)?;
        Ok(entry.data)
    }
}
