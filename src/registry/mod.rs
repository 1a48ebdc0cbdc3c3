//! Resolver identifier to content identifier resolution.
//!
//! Two tiers: local overrides (saved, then defaults), then a signed entry
//! fetched over the registry transport. The network payload is only trusted
//! after the verifier accepts it. Results are not cached here.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::identifier::Identifier;

pub mod entry;
pub mod overrides;

pub use entry::{Ed25519Verifier, EntryError, EntryVerifier, SignedRegistryEntry};
pub use overrides::RegistryOverrides;

/// Resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No override exists and the network cannot be queried yet.
    #[error("network is not ready")]
    NetworkUnavailable,
    /// The transport failed or returned nothing usable.
    #[error("registry lookup failed: {0}")]
    Lookup(String),
    /// The returned entry did not verify or decode.
    #[error(transparent)]
    Verification(#[from] EntryError),
}

/// Network access to signed registry entries.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Whether lookups can be issued right now.
    async fn network_ready(&self) -> bool;

    /// Fetch the raw signed entry published under `public_key`.
    async fn get_registry_entry(&self, public_key: &[u8; 32]) -> Result<Vec<u8>, ResolveError>;
}

/// Two-tier resolver.
#[derive(Clone)]
pub struct RegistryResolver {
    overrides: Arc<RegistryOverrides>,
    transport: Arc<dyn RegistryTransport>,
    verifier: Arc<dyn EntryVerifier>,
}

impl std::fmt::Debug for RegistryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryResolver")
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl RegistryResolver {
    /// Build a resolver from its collaborators.
    pub fn new(
        overrides: Arc<RegistryOverrides>,
        transport: Arc<dyn RegistryTransport>,
        verifier: Arc<dyn EntryVerifier>,
    ) -> Self {
        Self {
            overrides,
            transport,
            verifier,
        }
    }

    /// Resolve `id` to the content identifier to load. Content identifiers
    /// resolve to themselves.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] when no override exists and the network
    /// lookup cannot produce a verified entry.
    pub async fn resolve(&self, id: &Identifier) -> Result<Identifier, ResolveError> {
        let Some(public_key) = id.public_key() else {
            return Ok(id.clone());
        };

        if let Some(target) = self.overrides.get(id) {
            debug!(resolver = %id, target = %target, "resolved from local override");
            return Ok(target.clone());
        }

        if !self.transport.network_ready().await {
            return Err(ResolveError::NetworkUnavailable);
        }

        let bytes = self.transport.get_registry_entry(public_key).await?;
        let payload = self.verifier.verify_entry(&bytes, public_key)?;
        let target = entry::identifier_from_payload(&payload)?;
        info!(resolver = %id, target = %target, "resolved from registry");
        Ok(target)
    }
}
