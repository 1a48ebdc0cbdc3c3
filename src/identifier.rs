//! Module identifier classification.
//!
//! Every module reference that reaches the kernel is untrusted input. This
//! module decides whether a caller-supplied value names immutable content, a
//! mutable resolver, or nothing the kernel will touch. It fails closed: any
//! decode error or unexpected type/hash pairing is [`Classification::Invalid`].
//!
//! Text form is multibase base58btc (`z` prefix) over the binary form
//! `[type][hash_type][32-byte hash][optional little-endian size]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Multibase prefix for base58btc.
pub const MULTIBASE_BASE58BTC: char = 'z';

/// Type tag for raw (immutable) content.
pub const CID_TYPE_RAW: u8 = 0x26;

/// Type tag for resolver (mutable) identifiers.
pub const CID_TYPE_RESOLVER: u8 = 0x25;

/// Hash family used by content identifiers.
pub const HASH_TYPE_BLAKE3: u8 = 0x1f;

/// Key family used by resolver identifiers.
pub const HASH_TYPE_ED25519: u8 = 0xed;

const HASH_LEN: usize = 32;
const MAX_SIZE_LEN: usize = 8;

/// Reasons an identifier is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The value was not a JSON string.
    #[error("identifier is not a string")]
    NotAString,
    /// The text does not start with the base58btc multibase prefix.
    #[error("identifier has an unsupported multibase prefix")]
    UnsupportedEncoding,
    /// The body is not valid base58.
    #[error("identifier is not valid base58: {0}")]
    Decode(String),
    /// The text decodes but is not in canonical form.
    #[error("identifier is not canonically encoded")]
    NonCanonical,
    /// Fewer bytes than a type, hash type and hash.
    #[error("identifier is truncated ({0} bytes)")]
    Truncated(usize),
    /// A (type, hash type) pair the kernel does not load.
    #[error("unsupported identifier type {kind:#04x} with hash type {hash_type:#04x}")]
    UnsupportedType {
        /// Type tag found.
        kind: u8,
        /// Hash type tag found.
        hash_type: u8,
    },
    /// Bytes after the hash that are not a valid size field.
    #[error("identifier has {0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// The two identifier families the kernel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    /// Immutable content addressed by its BLAKE3 hash.
    Content,
    /// Mutable pointer named by an Ed25519 public key.
    Resolver,
}

/// A validated module identifier.
///
/// Only constructible through parsing or the typed constructors, so holding
/// one means the (type, hash type) pair has already been checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    kind: IdentifierKind,
    hash: [u8; HASH_LEN],
    size: Option<u64>,
    text: String,
}

impl Identifier {
    /// Build a content identifier from a BLAKE3 hash and optional byte size.
    pub fn content(hash: [u8; HASH_LEN], size: Option<u64>) -> Self {
        Self::assemble(IdentifierKind::Content, hash, size)
    }

    /// Build a resolver identifier from an Ed25519 public key.
    pub fn resolver(public_key: [u8; HASH_LEN]) -> Self {
        Self::assemble(IdentifierKind::Resolver, public_key, None)
    }

    fn assemble(kind: IdentifierKind, hash: [u8; HASH_LEN], size: Option<u64>) -> Self {
        let mut id = Self {
            kind,
            hash,
            size,
            text: String::new(),
        };
        id.text = format!(
            "{MULTIBASE_BASE58BTC}{}",
            bs58::encode(id.to_bytes()).into_string()
        );
        id
    }

    /// Parse the text form.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentifierError`] for anything that is not a canonical,
    /// supported identifier.
    pub fn parse(text: &str) -> Result<Self, IdentifierError> {
        let body = text
            .strip_prefix(MULTIBASE_BASE58BTC)
            .ok_or(IdentifierError::UnsupportedEncoding)?;
        let bytes = bs58::decode(body)
            .into_vec()
            .map_err(|e| IdentifierError::Decode(e.to_string()))?;
        let id = Self::from_bytes(&bytes)?;
        if id.text != text {
            return Err(IdentifierError::NonCanonical);
        }
        Ok(id)
    }

    /// Decode the binary form.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentifierError`] when the bytes are truncated, carry an
    /// unsupported type pairing, or have trailing garbage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentifierError> {
        let [kind, hash_type, rest @ ..] = bytes else {
            return Err(IdentifierError::Truncated(bytes.len()));
        };
        let kind = match (*kind, *hash_type) {
            (CID_TYPE_RAW, HASH_TYPE_BLAKE3) => IdentifierKind::Content,
            (CID_TYPE_RESOLVER, HASH_TYPE_ED25519) => IdentifierKind::Resolver,
            (kind, hash_type) => return Err(IdentifierError::UnsupportedType { kind, hash_type }),
        };
        let hash: [u8; HASH_LEN] = rest
            .get(..HASH_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(IdentifierError::Truncated(bytes.len()))?;
        let trailing = rest.get(HASH_LEN..).unwrap_or_default();

        let size = match kind {
            IdentifierKind::Resolver if !trailing.is_empty() => {
                return Err(IdentifierError::TrailingBytes(trailing.len()));
            }
            IdentifierKind::Resolver => None,
            IdentifierKind::Content => decode_size(trailing)?,
        };

        Ok(Self::assemble(kind, hash, size))
    }

    /// Encode the binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (kind, hash_type) = match self.kind {
            IdentifierKind::Content => (CID_TYPE_RAW, HASH_TYPE_BLAKE3),
            IdentifierKind::Resolver => (CID_TYPE_RESOLVER, HASH_TYPE_ED25519),
        };
        let mut out = Vec::with_capacity(2 + HASH_LEN + MAX_SIZE_LEN);
        out.push(kind);
        out.push(hash_type);
        out.extend_from_slice(&self.hash);
        if let Some(size) = self.size {
            out.extend_from_slice(&encode_size(size));
        }
        out
    }

    /// Which family this identifier belongs to.
    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }

    /// Whether this is a mutable resolver identifier.
    pub fn is_resolver(&self) -> bool {
        self.kind == IdentifierKind::Resolver
    }

    /// Content hash, or the public key for resolvers.
    pub fn hash(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// Ed25519 public key embedded in a resolver identifier.
    pub fn public_key(&self) -> Option<&[u8; HASH_LEN]> {
        match self.kind {
            IdentifierKind::Resolver => Some(&self.hash),
            IdentifierKind::Content => None,
        }
    }

    /// Declared content size, when present.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Canonical text form; also the module's domain.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn decode_size(trailing: &[u8]) -> Result<Option<u64>, IdentifierError> {
    if trailing.is_empty() {
        return Ok(None);
    }
    if trailing.len() > MAX_SIZE_LEN {
        return Err(IdentifierError::TrailingBytes(trailing.len()));
    }
    let mut buf = [0u8; MAX_SIZE_LEN];
    buf.get_mut(..trailing.len())
        .ok_or(IdentifierError::TrailingBytes(trailing.len()))?
        .copy_from_slice(trailing);
    Ok(Some(u64::from_le_bytes(buf)))
}

// Little-endian with trailing zero bytes trimmed, at least one byte.
fn encode_size(size: u64) -> Vec<u8> {
    let mut bytes = size.to_le_bytes().to_vec();
    while bytes.len() > 1 && bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

/// Result of classifying an untrusted module reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Rejected; carries the reason for diagnostics.
    Invalid(IdentifierError),
    /// Immutable content identifier, loadable as-is.
    Immutable(Identifier),
    /// Resolver identifier that must be resolved before loading.
    Resolver(Identifier),
}

/// Classify an arbitrary JSON value as a module reference.
pub fn classify(value: &Value) -> Classification {
    let Some(text) = value.as_str() else {
        return Classification::Invalid(IdentifierError::NotAString);
    };
    match Identifier::parse(text) {
        Ok(id) if id.is_resolver() => Classification::Resolver(id),
        Ok(id) => Classification::Immutable(id),
        Err(e) => Classification::Invalid(e),
    }
}
