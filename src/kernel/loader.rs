//! Module cache and load coordination.
//!
//! Per domain: `Absent -> Loading -> Ready`, with `Loading -> Absent` on
//! failure. While a domain is loading, every further call for it is parked on
//! the single pending load and released from its one outcome.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::queries::Caller;
use crate::host::{Sandbox, SandboxId};
use crate::identifier::Identifier;

/// Liveness of a published module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum ModuleHealth {
    /// Running normally.
    Running,
    /// Reported a fatal error but has not exited.
    Faulted(String),
    /// The sandbox stopped.
    Exited,
}

/// A running sandbox bound to one domain.
#[derive(Debug)]
pub(crate) struct Module {
    pub domain: String,
    /// Content identifier the code was fetched for.
    pub target: Identifier,
    pub sandbox: Arc<dyn Sandbox>,
    pub id: SandboxId,
    pub health: ModuleHealth,
}

/// Where a domain is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadState {
    Absent,
    Loading,
    Ready,
}

/// A call waiting for its module.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub caller: Caller,
    pub caller_domain: String,
    pub caller_nonce: Value,
    pub module: Identifier,
    pub method: String,
    pub input: Value,
    pub send_kernel_nonce: bool,
}

/// The in-flight load for one domain.
#[derive(Debug)]
pub(crate) struct PendingLoad {
    pub waiters: Vec<PendingCall>,
    pub started_at: Instant,
}

/// Result of publishing a freshly launched module.
#[derive(Debug)]
pub(crate) enum Published {
    /// The module is now live.
    New,
    /// Another path published this domain first; the offered module was not
    /// stored and is handed back so its sandbox can be torn down.
    AlreadyPresent(Module),
}

/// Published modules plus pending loads.
#[derive(Debug, Default)]
pub(crate) struct ModuleCache {
    modules: HashMap<String, Module>,
    loading: HashMap<String, PendingLoad>,
}

impl ModuleCache {
    pub(crate) fn state(&self, domain: &str) -> LoadState {
        if self.modules.contains_key(domain) {
            LoadState::Ready
        } else if self.loading.contains_key(domain) {
            LoadState::Loading
        } else {
            LoadState::Absent
        }
    }

    pub(crate) fn get(&self, domain: &str) -> Option<&Module> {
        self.modules.get(domain)
    }

    /// Published module for `domain` if it is backed by sandbox `id`.
    pub(crate) fn get_sandbox(&self, domain: &str, id: SandboxId) -> Option<&Module> {
        self.modules.get(domain).filter(|m| m.id == id)
    }

    /// Record a new pending load with its first waiter.
    pub(crate) fn begin(&mut self, domain: &str, first: PendingCall) {
        self.loading.insert(
            domain.to_owned(),
            PendingLoad {
                waiters: vec![first],
                started_at: Instant::now(),
            },
        );
    }

    /// Park a call on the pending load. Hands the call back if there is none.
    pub(crate) fn attach(&mut self, domain: &str, call: PendingCall) -> Result<(), PendingCall> {
        match self.loading.get_mut(domain) {
            Some(load) => {
                load.waiters.push(call);
                Ok(())
            }
            None => Err(call),
        }
    }

    /// End the pending load, returning its waiters.
    pub(crate) fn finish(&mut self, domain: &str) -> Option<PendingLoad> {
        self.loading.remove(domain)
    }

    /// Publish unless the domain is already live.
    pub(crate) fn publish(&mut self, module: Module) -> Published {
        if self.modules.contains_key(&module.domain) {
            return Published::AlreadyPresent(module);
        }
        self.modules.insert(module.domain.clone(), module);
        Published::New
    }

    /// Update the health of the module backed by sandbox `id`.
    pub(crate) fn set_health(&mut self, domain: &str, id: SandboxId, health: ModuleHealth) -> bool {
        match self.modules.get_mut(domain).filter(|m| m.id == id) {
            Some(module) => {
                module.health = health;
                true
            }
            None => false,
        }
    }

    pub(crate) fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub(crate) fn loading(&self) -> impl Iterator<Item = (&str, &PendingLoad)> {
        self.loading.iter().map(|(d, l)| (d.as_str(), l))
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Module> + '_ {
        self.modules.drain().map(|(_, m)| m)
    }

    pub(crate) fn drain_loading(&mut self) -> impl Iterator<Item = PendingLoad> + '_ {
        self.loading.drain().map(|(_, l)| l)
    }
}
