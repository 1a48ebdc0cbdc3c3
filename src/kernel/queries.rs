//! Open-query table and nonce assignment.
//!
//! A query lives from the moment its call frame is posted to the destination
//! sandbox until exactly one terminal response is processed for it, or until
//! the reaper or the destination's exit closes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha512};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::credential::MasterKey;
use crate::frame::Frame;
use crate::host::{CallerPort, Sandbox, SandboxId};

/// Domain separator for query nonces.
const NONCE_SALT: &[u8] = b"kernelNonceSalt";

/// Reply channel for calls issued by the kernel itself.
pub(crate) type LocalReply = oneshot::Sender<Result<Value, Value>>;

/// Who a query's responses go back to.
pub(crate) enum Caller {
    /// A page or extension reached through a caller port.
    External {
        port: Arc<dyn CallerPort>,
        origin: String,
    },
    /// Another module.
    Sandbox {
        sandbox: Arc<dyn Sandbox>,
        id: SandboxId,
    },
    /// The kernel itself.
    Local(LocalReply),
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External { origin, .. } => write!(f, "External({origin})"),
            Self::Sandbox { id, .. } => write!(f, "Sandbox({id})"),
            Self::Local(_) => f.write_str("Local"),
        }
    }
}

impl Caller {
    /// Sandbox id when the caller is a module.
    pub(crate) fn sandbox_id(&self) -> Option<SandboxId> {
        match self {
            Self::Sandbox { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Origin when the caller is external.
    pub(crate) fn origin(&self) -> Option<&str> {
        match self {
            Self::External { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// Deliver a non-terminal frame. Local callers only see the terminal one.
    pub(crate) fn post(&self, frame: Frame) {
        let result = match self {
            Self::External { port, origin } => port.post(origin, frame),
            Self::Sandbox { sandbox, .. } => sandbox.post(frame),
            Self::Local(_) => return,
        };
        if let Err(e) = result {
            debug!(caller = ?self, error = %e, "caller is gone, frame dropped");
        }
    }

    /// Deliver the terminal response, consuming the caller.
    pub(crate) fn respond(self, frame: Frame) {
        match self {
            Self::Local(reply) => {
                let err = frame.err.unwrap_or(Value::Null);
                let result = if err.is_null() {
                    Ok(frame.data.unwrap_or(Value::Null))
                } else {
                    Err(err)
                };
                if reply.send(result).is_err() {
                    debug!("internal caller stopped waiting");
                }
            }
            other => other.post(frame),
        }
    }

    /// Answer with an error on the caller's own nonce.
    pub(crate) fn fail(self, caller_nonce: Value, message: impl Into<String>) {
        self.respond(Frame::error(caller_nonce, message));
    }
}

/// Correlation record for one in-flight call.
#[derive(Debug)]
pub(crate) struct OpenQuery {
    pub caller: Caller,
    pub caller_domain: String,
    /// Echoed back to the caller, never sent to the destination.
    pub caller_nonce: Value,
    pub dest: Arc<dyn Sandbox>,
    pub dest_id: SandboxId,
    pub dest_domain: String,
    pub opened_at: Instant,
}

/// Keyed, counter-driven nonce source.
///
/// Nonces are `base64(SHA-512(salt || master || counter))`, so a module that
/// does not hold the master key can neither predict nor forge one.
pub(crate) struct NonceGenerator {
    counter: u64,
    master: MasterKey,
}

impl NonceGenerator {
    pub(crate) fn new(master: MasterKey) -> Self {
        Self { counter: 0, master }
    }

    pub(crate) fn derive(&self, counter: u64) -> String {
        let mut hasher = Sha512::new();
        hasher.update(NONCE_SALT);
        hasher.update(self.master.expose());
        hasher.update(counter.to_le_bytes());
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    }

    pub(crate) fn next(&mut self) -> String {
        let nonce = self.derive(self.counter);
        self.counter = self.counter.wrapping_add(1);
        nonce
    }
}

/// The open-query table.
pub(crate) struct QueryTable {
    open: HashMap<String, OpenQuery>,
    nonces: NonceGenerator,
}

impl QueryTable {
    pub(crate) fn new(master: MasterKey) -> Self {
        Self {
            open: HashMap::new(),
            nonces: NonceGenerator::new(master),
        }
    }

    /// Assign a nonce not used by any open query and record the query.
    pub(crate) fn open(&mut self, query: OpenQuery) -> String {
        let mut nonce = self.nonces.next();
        while self.open.contains_key(&nonce) {
            nonce = self.nonces.next();
        }
        self.open.insert(nonce.clone(), query);
        nonce
    }

    pub(crate) fn get(&self, nonce: &str) -> Option<&OpenQuery> {
        self.open.get(nonce)
    }

    pub(crate) fn close(&mut self, nonce: &str) -> Option<OpenQuery> {
        self.open.remove(nonce)
    }

    /// Remove and return every query opened at or before `now - ttl`.
    pub(crate) fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<(String, OpenQuery)> {
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, q)| now.saturating_duration_since(q.opened_at) >= ttl)
            .map(|(nonce, _)| nonce.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|nonce| self.open.remove_entry(&nonce))
            .collect()
    }

    /// Remove and return every query whose destination is `id`.
    pub(crate) fn close_destined_for(&mut self, id: SandboxId) -> Vec<(String, OpenQuery)> {
        let doomed: Vec<String> = self
            .open
            .iter()
            .filter(|(_, q)| q.dest_id == id)
            .map(|(nonce, _)| nonce.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|nonce| self.open.remove_entry(&nonce))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = OpenQuery> + '_ {
        self.open.drain().map(|(_, q)| q)
    }
}
