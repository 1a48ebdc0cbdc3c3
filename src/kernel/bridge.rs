//! Calls issued by the kernel itself.
//!
//! An internal call goes through the same dispatch path as any other call;
//! only its delivery differs, completing a oneshot instead of posting a frame.
//! The default registry transport is built on it, asking the core network
//! modules for readiness and signed entries.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::debug;

use super::{Command, KernelError, KernelHandle};
use crate::identifier::{Identifier, HASH_TYPE_ED25519};
use crate::registry::{RegistryTransport, ResolveError};

impl KernelHandle {
    /// Call `method` on `module` as the kernel and wait for the result.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Module`] with the module's error payload, or
    /// [`KernelError::Stopped`] if the kernel went away.
    pub async fn call_internal(
        &self,
        module: &Identifier,
        method: &str,
        params: Value,
    ) -> Result<Value, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Internal {
            module: module.clone(),
            method: method.to_owned(),
            params,
            reply,
        })?;
        rx.await
            .map_err(|_| KernelError::Stopped)?
            .map_err(KernelError::Module)
    }
}

/// Core network modules the kernel relies on for registry lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreModules {
    /// Peer swarm; network readiness is asked of it.
    pub swarm: Option<Identifier>,
    /// Registry client serving `getRegistryEntry`.
    pub s5: Option<Identifier>,
}

/// [`RegistryTransport`] backed by internal calls to the core modules.
#[derive(Debug, Clone)]
pub struct CoreModuleTransport {
    kernel: KernelHandle,
    modules: CoreModules,
}

impl CoreModuleTransport {
    /// Build a transport issuing calls through `kernel`.
    pub fn new(kernel: KernelHandle, modules: CoreModules) -> Self {
        Self { kernel, modules }
    }
}

#[async_trait]
impl RegistryTransport for CoreModuleTransport {
    async fn network_ready(&self) -> bool {
        let Some(swarm) = &self.modules.swarm else {
            return false;
        };
        // Readiness never triggers a load of the swarm itself.
        if !matches!(self.kernel.is_loaded(swarm.as_str()).await, Ok(true)) {
            return false;
        }
        match self.kernel.call_internal(swarm, "getRelays", json!({})).await {
            Ok(Value::Array(relays)) => !relays.is_empty(),
            Ok(other) => {
                debug!(?other, "getRelays returned a non-list");
                false
            }
            Err(e) => {
                debug!(error = %e, "getRelays failed");
                false
            }
        }
    }

    async fn get_registry_entry(&self, public_key: &[u8; 32]) -> Result<Vec<u8>, ResolveError> {
        let s5 = self
            .modules
            .s5
            .as_ref()
            .ok_or_else(|| ResolveError::Lookup("no registry module configured".to_owned()))?;
        // A resolver-addressed registry module cannot be loaded through itself.
        if s5.is_resolver() && !matches!(self.kernel.is_loaded(s5.as_str()).await, Ok(true)) {
            return Err(ResolveError::Lookup(format!(
                "registry module {s5} is not running"
            )));
        }

        let mut pubkey = Vec::with_capacity(33);
        pubkey.push(HASH_TYPE_ED25519);
        pubkey.extend_from_slice(public_key);

        let entry = self
            .kernel
            .call_internal(s5, "getRegistryEntry", json!({ "pubkey": pubkey }))
            .await
            .map_err(|e| ResolveError::Lookup(e.to_string()))?;
        entry_bytes(&entry)
    }
}

/// Accept an entry as a byte array or a base64 string.
fn entry_bytes(entry: &Value) -> Result<Vec<u8>, ResolveError> {
    match entry {
        Value::String(text) => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| ResolveError::Lookup(format!("registry entry is not base64: {e}"))),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| ResolveError::Lookup("registry entry is not a byte array".to_owned())),
        Value::Null => Err(ResolveError::Lookup("no registry entry published".to_owned())),
        _ => Err(ResolveError::Lookup(
            "registry entry has an unexpected shape".to_owned(),
        )),
    }
}
