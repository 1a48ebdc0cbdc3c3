//! The module-query kernel.
//!
//! One actor task owns every piece of routing state: the module cache, the
//! pending loads, the open-query table and the diagnostics list. Callers,
//! sandboxes and background loads talk to it only through its mailbox, and
//! each command is handled to completion before the next one is looked at.
//! Work that has to wait on I/O (resolution, code fetch, sandbox creation)
//! runs in a spawned task that reports back with another command, and the
//! handler re-checks state when that report arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::credential::MasterKey;
use crate::host::{CallerPort, CodeStore, SandboxEvent, SandboxHost, SandboxId};
use crate::identifier::Identifier;
use crate::registry::{EntryVerifier, RegistryOverrides, RegistryResolver, RegistryTransport};

mod bridge;
mod diagnostics;
mod loader;
mod queries;
mod router;
mod supervisor;

pub use bridge::{CoreModuleTransport, CoreModules};
pub use diagnostics::NotableError;
pub use loader::ModuleHealth;
pub use supervisor::{LaunchError, LoadError};

use diagnostics::Diagnostics;
use loader::ModuleCache;
use queries::{LocalReply, QueryTable};
use supervisor::{LoadedModule, SandboxSupervisor};

/// Kernel version reported to `version` probes.
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Messages handled by the kernel task.
pub(crate) enum Command {
    /// A frame from an external caller.
    Caller {
        port: Arc<dyn CallerPort>,
        origin: String,
        frame: Value,
    },
    /// Something a sandbox reported.
    Sandbox {
        id: SandboxId,
        domain: String,
        event: SandboxEvent,
    },
    /// A call issued by the kernel itself.
    Internal {
        module: Identifier,
        method: String,
        params: Value,
        reply: LocalReply,
    },
    /// A background load finished.
    Loaded {
        domain: String,
        result: Result<LoadedModule, LoadError>,
    },
    /// Whether a domain is published.
    IsLoaded {
        domain: String,
        reply: oneshot::Sender<bool>,
    },
    /// Snapshot request.
    Status { reply: oneshot::Sender<KernelStatus> },
    /// Stop the kernel.
    Shutdown,
}

/// Kernel handle errors.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The kernel task is no longer running.
    #[error("kernel is not running")]
    Stopped,
    /// The module answered with an error.
    #[error("module returned an error: {0}")]
    Module(Value),
}

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Distribution name reported by `version`.
    pub distribution: String,
    /// Version reported by `version`.
    pub version: String,
    /// Open queries older than this are closed with an error.
    pub query_ttl: Duration,
    /// How often expired queries are looked for.
    pub reap_interval: Duration,
    /// Origin schemes whose callers declare their own domain.
    pub trusted_schemes: Vec<String>,
    /// Upper bound on sandbox creation.
    pub handshake_timeout: Duration,
    /// Upper bound on a whole load: resolution, fetch and launch.
    pub load_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            distribution: "modkern".to_owned(),
            version: KERNEL_VERSION.to_owned(),
            query_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(5),
            trusted_schemes: vec!["moz-extension".to_owned(), "chrome-extension".to_owned()],
            handshake_timeout: Duration::from_secs(30),
            load_timeout: Duration::from_secs(120),
        }
    }
}

/// Collaborators and settings the kernel is built from.
pub struct KernelDeps {
    /// Router tuning.
    pub settings: RouterSettings,
    /// Process master key.
    pub master_key: MasterKey,
    /// Where module code comes from.
    pub store: Arc<dyn CodeStore>,
    /// Where sandboxes come from.
    pub host: Arc<dyn SandboxHost>,
    /// Saved and default resolver mappings.
    pub overrides: Arc<RegistryOverrides>,
    /// Registry entry verification.
    pub verifier: Arc<dyn EntryVerifier>,
    /// Registry network access. `None` uses the core modules through the
    /// kernel's own routing.
    pub transport: Option<Arc<dyn RegistryTransport>>,
    /// Core module identifiers for the default transport.
    pub core_modules: CoreModules,
}

/// Published module as seen by [`KernelHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleStatus {
    /// Domain the module was requested under.
    pub domain: String,
    /// Content identifier the code was loaded from.
    pub target: String,
    /// Backing sandbox.
    pub sandbox: SandboxId,
    /// Liveness.
    pub health: ModuleHealth,
}

/// Kernel state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelStatus {
    /// Kernel version.
    pub version: String,
    /// Published modules, sorted by domain.
    pub modules: Vec<ModuleStatus>,
    /// Domains with a load in flight.
    pub loading: Vec<String>,
    /// Number of open queries.
    pub open_queries: usize,
    /// Number of recorded notable errors.
    pub notable_errors: usize,
}

/// Cloneable handle to a running kernel.
#[derive(Clone)]
pub struct KernelHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("running", &!self.tx.is_closed())
            .finish()
    }
}

impl KernelHandle {
    /// Hand an inbound caller frame to the kernel. Replies go to `port`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Stopped`] if the kernel has shut down.
    pub fn submit(
        &self,
        port: Arc<dyn CallerPort>,
        origin: &str,
        frame: Value,
    ) -> Result<(), KernelError> {
        self.send(Command::Caller {
            port,
            origin: origin.to_owned(),
            frame,
        })
    }

    /// Whether a module is published under `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Stopped`] if the kernel has shut down.
    pub async fn is_loaded(&self, domain: &str) -> Result<bool, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::IsLoaded {
            domain: domain.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| KernelError::Stopped)
    }

    /// Snapshot of the kernel's state.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Stopped`] if the kernel has shut down.
    pub async fn status(&self) -> Result<KernelStatus, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| KernelError::Stopped)
    }

    /// Ask the kernel to stop. Running sandboxes are terminated.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Wait until the kernel task has exited.
    pub async fn stopped(&self) {
        self.tx.closed().await;
    }

    fn send(&self, command: Command) -> Result<(), KernelError> {
        self.tx.send(command).map_err(|_| KernelError::Stopped)
    }
}

/// Kernel state. Only ever touched from the kernel task.
pub(crate) struct Kernel {
    settings: RouterSettings,
    modules: ModuleCache,
    queries: QueryTable,
    diagnostics: Diagnostics,
    /// Sandboxes that exited while their domain was still loading.
    early_exits: HashMap<SandboxId, String>,
    supervisor: Arc<SandboxSupervisor>,
    store: Arc<dyn CodeStore>,
    resolver: RegistryResolver,
    mailbox: mpsc::UnboundedSender<Command>,
}

/// Start the kernel on the current tokio runtime.
pub fn spawn(deps: KernelDeps) -> KernelHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = KernelHandle { tx: tx.clone() };

    let transport = deps.transport.unwrap_or_else(|| {
        Arc::new(CoreModuleTransport::new(
            handle.clone(),
            deps.core_modules.clone(),
        ))
    });
    let resolver = RegistryResolver::new(deps.overrides, transport, deps.verifier);
    let supervisor = Arc::new(SandboxSupervisor::new(
        deps.host,
        deps.master_key.clone(),
        deps.settings.handshake_timeout,
        tx.clone(),
    ));

    let kernel = Kernel {
        modules: ModuleCache::default(),
        queries: QueryTable::new(deps.master_key),
        diagnostics: Diagnostics::default(),
        early_exits: HashMap::new(),
        supervisor,
        store: deps.store,
        resolver,
        mailbox: tx,
        settings: deps.settings,
    };
    tokio::spawn(kernel.run(rx));
    handle
}

impl Kernel {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(
            version = %self.settings.version,
            distribution = %self.settings.distribution,
            "kernel started"
        );
        let period = self.settings.reap_interval.max(Duration::from_millis(1));
        let mut reaper = tokio::time::interval(period);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        reaper.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command) {
                        break;
                    }
                }
                _ = reaper.tick() => self.reap_expired(Instant::now()),
            }
        }

        self.teardown();
        info!("kernel stopped");
    }

    /// Handle one command. Returns `false` when the kernel should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Caller {
                port,
                origin,
                frame,
            } => self.on_caller_frame(port, origin, frame),
            Command::Sandbox { id, domain, event } => self.on_sandbox_event(id, &domain, event),
            Command::Internal {
                module,
                method,
                params,
                reply,
            } => self.on_internal_call(module, method, params, reply),
            Command::Loaded { domain, result } => self.on_loaded(&domain, result),
            Command::IsLoaded { domain, reply } => {
                let _ = reply.send(self.modules.get(&domain).is_some());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn status(&self) -> KernelStatus {
        let mut modules: Vec<ModuleStatus> = self
            .modules
            .modules()
            .map(|m| ModuleStatus {
                domain: m.domain.clone(),
                target: m.target.as_str().to_owned(),
                sandbox: m.id,
                health: m.health.clone(),
            })
            .collect();
        modules.sort_by(|a, b| a.domain.cmp(&b.domain));
        let mut loading: Vec<String> = self.modules.loading().map(|(d, _)| d.to_owned()).collect();
        loading.sort();
        KernelStatus {
            version: self.settings.version.clone(),
            modules,
            loading,
            open_queries: self.queries.len(),
            notable_errors: self.diagnostics.len(),
        }
    }

    fn teardown(&mut self) {
        for module in self.modules.drain() {
            debug!(module = %module.domain, sandbox = %module.id, "terminating sandbox");
            module.sandbox.terminate();
        }
        for load in self.modules.drain_loading() {
            for call in load.waiters {
                call.caller.fail(call.caller_nonce, "kernel is shutting down");
            }
        }
        for query in self.queries.drain() {
            query.caller.fail(query.caller_nonce, "kernel is shutting down");
        }
    }
}
