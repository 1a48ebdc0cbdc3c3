//! Sandbox launch and credential delivery.
//!
//! A launch creates the execution context, wires its event handlers back to
//! the kernel mailbox, and posts the module's credential as the first frame
//! the sandbox ever sees. A sandbox whose credential cannot be delivered is
//! torn down before anyone can reach it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Command;
use crate::credential::MasterKey;
use crate::frame::Frame;
use crate::host::{CodeStore, HostError, Sandbox, SandboxEvents, SandboxHost, SandboxId};
use crate::identifier::Identifier;
use crate::registry::{RegistryResolver, ResolveError};

/// Sandbox launch failures.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The host could not create the execution context.
    #[error("sandbox creation failed: {0}")]
    Create(#[source] HostError),
    /// The host did not finish creating the context in time.
    #[error("sandbox creation timed out after {0:?}")]
    Timeout(Duration),
    /// The credential frame could not be delivered.
    #[error("credential delivery failed: {0}")]
    Credential(#[source] HostError),
}

/// Everything that can stop a module from being loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The resolver identifier could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The code store had nothing usable.
    #[error("code fetch failed: {0}")]
    Fetch(#[source] HostError),
    /// The sandbox could not be started.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// Resolution, fetch and launch together took too long.
    #[error("module load timed out after {0:?}")]
    Timeout(Duration),
}

impl LoadError {
    /// Error text reported to every caller waiting on the load.
    pub fn caller_message(&self) -> String {
        match self {
            Self::Resolve(e) => format!("registry entry for module is not found: {e}"),
            other => format!("module could not be loaded: {other}"),
        }
    }
}

/// A sandbox that received its credential.
pub(crate) struct LaunchedSandbox {
    pub id: SandboxId,
    pub sandbox: Arc<dyn Sandbox>,
}

/// Outcome of a successful load.
pub(crate) struct LoadedModule {
    pub target: Identifier,
    pub launched: LaunchedSandbox,
}

/// Starts sandboxes on behalf of the kernel.
pub(crate) struct SandboxSupervisor {
    host: Arc<dyn SandboxHost>,
    master: MasterKey,
    next_id: AtomicU64,
    handshake_timeout: Duration,
    mailbox: mpsc::UnboundedSender<Command>,
}

impl SandboxSupervisor {
    pub(crate) fn new(
        host: Arc<dyn SandboxHost>,
        master: MasterKey,
        handshake_timeout: Duration,
        mailbox: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            host,
            master,
            next_id: AtomicU64::new(1),
            handshake_timeout,
            mailbox,
        }
    }

    /// Create a sandbox for `domain` and deliver its credential.
    pub(crate) async fn launch(
        &self,
        code: Vec<u8>,
        domain: &str,
    ) -> Result<LaunchedSandbox, LaunchError> {
        let id = SandboxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let events = SandboxEvents::new(id, domain, self.mailbox.clone());

        let sandbox = tokio::time::timeout(
            self.handshake_timeout,
            self.host.create_sandbox(code, events),
        )
        .await
        .map_err(|_| LaunchError::Timeout(self.handshake_timeout))?
        .map_err(LaunchError::Create)?;

        let key = self.master.derive_module_key(domain);
        if let Err(e) = sandbox.post(Frame::present_key(&key)) {
            warn!(module = %domain, sandbox = %id, error = %e, "credential delivery failed");
            sandbox.terminate();
            return Err(LaunchError::Credential(e));
        }

        info!(module = %domain, sandbox = %id, "sandbox launched");
        Ok(LaunchedSandbox { id, sandbox })
    }
}

/// Resolve, fetch and launch `module`. Runs outside the kernel task.
pub(crate) async fn load_module(
    module: Identifier,
    resolver: RegistryResolver,
    store: Arc<dyn CodeStore>,
    supervisor: Arc<SandboxSupervisor>,
) -> Result<LoadedModule, LoadError> {
    let target = resolver.resolve(&module).await?;
    let code = store.fetch_code(&target).await.map_err(LoadError::Fetch)?;
    debug!(module = %module, target = %target, bytes = code.len(), "module code fetched");
    let launched = supervisor.launch(code, module.as_str()).await?;
    Ok(LoadedModule { target, launched })
}
