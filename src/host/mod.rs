//! Host collaborator interfaces.
//!
//! The kernel does not execute module code, fetch bytes, or own a transport
//! to its callers. Those capabilities are provided by the host through the
//! traits below; [`store`] and [`process`] ship the implementations the
//! `modkern` binary uses.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::frame::Frame;
use crate::identifier::Identifier;
use crate::kernel::Command;

pub mod process;
pub mod store;

/// Errors produced by host collaborators.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The store has no bytes for the identifier.
    #[error("no code found for {0}")]
    NotFound(String),
    /// Filesystem or pipe failure.
    #[error("host I/O failed: {0}")]
    Io(String),
    /// The execution context could not be created.
    #[error("sandbox creation failed: {0}")]
    Create(String),
    /// The peer is gone and can no longer receive frames.
    #[error("destination is closed")]
    Closed,
}

/// Fetches module code for a content identifier.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Return the code bytes for `id`.
    async fn fetch_code(&self, id: &Identifier) -> Result<Vec<u8>, HostError>;
}

/// A running, isolated execution context.
pub trait Sandbox: Send + Sync {
    /// Queue a frame for delivery into the sandbox.
    fn post(&self, frame: Frame) -> Result<(), HostError>;

    /// Tear the sandbox down. Idempotent.
    fn terminate(&self);
}

impl fmt::Debug for dyn Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sandbox")
    }
}

/// Creates sandboxes from code bytes.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    /// Start a sandbox running `code`. Frames and lifecycle changes from the
    /// sandbox must be reported through `events`.
    async fn create_sandbox(
        &self,
        code: Vec<u8>,
        events: SandboxEvents,
    ) -> Result<Arc<dyn Sandbox>, HostError>;
}

/// Delivers frames to an external caller (page or extension).
pub trait CallerPort: Send + Sync {
    /// Post `frame` to the caller at `origin`.
    fn post(&self, origin: &str, frame: Frame) -> Result<(), HostError>;
}

/// Process-unique sandbox id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(pub u64);

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sandbox-{}", self.0)
    }
}

/// Something a sandbox reported.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    /// An inbound frame, still untrusted.
    Message(Value),
    /// A fatal error inside the sandbox.
    Fault(String),
    /// The sandbox stopped.
    Exited,
}

/// Inbound-frame and fatal-error handlers installed by the supervisor.
#[derive(Clone)]
pub struct SandboxEvents {
    id: SandboxId,
    domain: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for SandboxEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxEvents")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .finish()
    }
}

impl SandboxEvents {
    pub(crate) fn new(id: SandboxId, domain: &str, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            domain: domain.to_owned(),
            tx,
        }
    }

    /// Id of the sandbox these handlers belong to.
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Domain of the module running in the sandbox.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Report an inbound frame.
    pub fn message(&self, frame: Value) {
        self.emit(SandboxEvent::Message(frame));
    }

    /// Report a fatal error.
    pub fn fault(&self, error: impl Into<String>) {
        self.emit(SandboxEvent::Fault(error.into()));
    }

    /// Report that the sandbox stopped.
    pub fn exited(&self) {
        self.emit(SandboxEvent::Exited);
    }

    fn emit(&self, event: SandboxEvent) {
        let command = Command::Sandbox {
            id: self.id,
            domain: self.domain.clone(),
            event,
        };
        if self.tx.send(command).is_err() {
            debug!(sandbox = %self.id, "kernel stopped, dropping sandbox event");
        }
    }
}

/// A frame addressed to an external caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    /// Caller origin the frame is for.
    pub origin: String,
    /// The frame.
    pub frame: Frame,
}

/// [`CallerPort`] backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelPort {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelPort {
    /// Create a port and the receiver its frames arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CallerPort for ChannelPort {
    fn post(&self, origin: &str, frame: Frame) -> Result<(), HostError> {
        self.tx
            .send(Outbound {
                origin: origin.to_owned(),
                frame,
            })
            .map_err(|_| HostError::Closed)
    }
}
