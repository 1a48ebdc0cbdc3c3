//! Frame dispatch and relay.
//!
//! Everything here runs synchronously inside the kernel task. Inbound frames
//! are untrusted: they are decoded into the per-boundary message unions in
//! [`crate::frame`] and anything that does not fit is answered with an error
//! or dropped with a log line, never propagated.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use super::loader::{LoadState, Module, ModuleHealth, PendingCall, Published};
use super::queries::{Caller, LocalReply, OpenQuery};
use super::supervisor::{load_module, LoadError, LoadedModule};
use super::{Command, Kernel};
use crate::frame::{
    CallerMessage, Frame, LogRecord, ModuleCallRequest, SandboxMessage, MISSING_NONCE,
};
use crate::host::{CallerPort, SandboxEvent, SandboxId};
use crate::identifier::Identifier;

/// Caller domain used for calls the kernel issues itself.
const ROOT_DOMAIN: &str = "root";

impl Kernel {
    // ── Caller boundary ─────────────────────────────────────────

    pub(super) fn on_caller_frame(&mut self, port: Arc<dyn CallerPort>, origin: String, raw: Value) {
        let message = match Frame::decode(raw).and_then(CallerMessage::from_frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(%origin, error = %e, "dropping caller frame");
                return;
            }
        };

        match message {
            CallerMessage::Version { nonce } => {
                post_to(&*port, &origin, Frame::response(nonce, self.version_info()));
            }
            CallerMessage::CheckErrs { nonce } => {
                let errs: Vec<Value> = self
                    .diagnostics
                    .entries()
                    .map(|e| json!({ "at": e.at, "message": e.message }))
                    .collect();
                post_to(&*port, &origin, Frame::response(nonce, Value::Array(errs)));
            }
            CallerMessage::ModuleCall {
                nonce,
                domain,
                data,
                send_kernel_nonce,
            } => {
                let caller_domain = match self.caller_domain(&origin, domain.as_ref()) {
                    Ok(d) => d,
                    Err(msg) => {
                        warn!(%origin, reason = msg, "rejecting moduleCall");
                        post_to(&*port, &origin, Frame::error(nonce, msg));
                        return;
                    }
                };
                let request = match ModuleCallRequest::parse(data.as_ref()) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(%origin, error = %e, "rejecting moduleCall");
                        post_to(&*port, &origin, Frame::error(nonce, e.to_string()));
                        return;
                    }
                };
                self.route_call(PendingCall {
                    caller: Caller::External { port, origin },
                    caller_domain,
                    caller_nonce: nonce,
                    module: request.module,
                    method: request.method,
                    input: request.input,
                    send_kernel_nonce,
                });
            }
            CallerMessage::QueryUpdate { nonce, data } => {
                self.forward_query_update(&nonce, data, |caller| {
                    caller.origin() == Some(origin.as_str())
                });
            }
            CallerMessage::Unrecognized { nonce, method } => {
                debug!(%origin, %method, "unrecognized caller method");
                post_to(
                    &*port,
                    &origin,
                    Frame::error(nonce, format!("unrecognized method: {method}")),
                );
            }
        }
    }

    /// Domain a caller is acting as. Extensions declare it; pages get the
    /// host of their origin.
    fn caller_domain(&self, origin: &str, declared: Option<&Value>) -> Result<String, &'static str> {
        let url = Url::parse(origin).map_err(|_| "unable to parse caller origin")?;
        if self
            .settings
            .trusted_schemes
            .iter()
            .any(|s| s == url.scheme())
        {
            return declared
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .map(str::to_owned)
                .ok_or("extension caller must declare a domain");
        }
        url.host_str()
            .map(str::to_owned)
            .ok_or("caller origin has no host")
    }

    fn version_info(&self) -> Value {
        json!({
            "version": self.settings.version,
            "distribution": self.settings.distribution,
        })
    }

    // ── Internal bridge ─────────────────────────────────────────

    pub(super) fn on_internal_call(
        &mut self,
        module: Identifier,
        method: String,
        params: Value,
        reply: LocalReply,
    ) {
        self.route_call(PendingCall {
            caller: Caller::Local(reply),
            caller_domain: ROOT_DOMAIN.to_owned(),
            caller_nonce: Value::from(0),
            module,
            method,
            input: params,
            send_kernel_nonce: false,
        });
    }

    // ── Load coordination ───────────────────────────────────────

    /// Send a validated call towards its module, loading it if needed.
    fn route_call(&mut self, call: PendingCall) {
        let domain = call.module.as_str().to_owned();
        match self.modules.state(&domain) {
            LoadState::Ready => self.open_query(call),
            LoadState::Loading => {
                debug!(module = %domain, "module is loading, call parked");
                if let Err(call) = self.modules.attach(&domain, call) {
                    self.route_call(call);
                }
            }
            LoadState::Absent => self.start_load(&domain, call),
        }
    }

    fn start_load(&mut self, domain: &str, call: PendingCall) {
        info!(module = %domain, "loading module");
        let module = call.module.clone();
        self.modules.begin(domain, call);

        let resolver = self.resolver.clone();
        let store = Arc::clone(&self.store);
        let supervisor = Arc::clone(&self.supervisor);
        let mailbox = self.mailbox.clone();
        let domain = domain.to_owned();
        let limit = self.settings.load_timeout;
        tokio::spawn(async move {
            // A load that never settles would park its waiters forever.
            let load = load_module(module, resolver, store, supervisor);
            let result = tokio::time::timeout(limit, load)
                .await
                .unwrap_or(Err(LoadError::Timeout(limit)));
            if mailbox.send(Command::Loaded { domain, result }).is_err() {
                debug!("kernel stopped before load completed");
            }
        });
    }

    pub(super) fn on_loaded(&mut self, domain: &str, result: Result<LoadedModule, LoadError>) {
        let (waiters, elapsed) = match self.modules.finish(domain) {
            Some(load) => (load.waiters, load.started_at.elapsed()),
            None => (Vec::new(), Duration::ZERO),
        };
        // Exits recorded for this domain are settled by this outcome.
        let exited_early = match &result {
            Ok(loaded) => self.early_exits.remove(&loaded.launched.id).is_some(),
            Err(_) => false,
        };
        self.early_exits.retain(|_, d| d != domain);
        debug!(module = %domain, ?elapsed, waiters = waiters.len(), "load finished");

        let loaded = match result {
            Ok(loaded) => loaded,
            Err(e) => {
                let message = e.caller_message();
                warn!(module = %domain, error = %e, waiters = waiters.len(), "module load failed");
                for call in waiters {
                    call.caller.fail(call.caller_nonce, message.clone());
                }
                return;
            }
        };

        let LoadedModule { target, launched } = loaded;
        let health = if exited_early {
            ModuleHealth::Exited
        } else {
            ModuleHealth::Running
        };
        let module = Module {
            domain: domain.to_owned(),
            target,
            sandbox: launched.sandbox,
            id: launched.id,
            health,
        };

        // The cache may have changed while the load was suspended.
        match self.modules.publish(module) {
            Published::New => info!(module = %domain, "module published"),
            Published::AlreadyPresent(redundant) => {
                self.diagnostics.record(format!(
                    "race detected: module {domain} was published twice, keeping the existing sandbox"
                ));
                redundant.sandbox.terminate();
            }
        }

        for call in waiters {
            self.open_query(call);
        }
    }

    // ── Query dispatch ──────────────────────────────────────────

    fn open_query(&mut self, call: PendingCall) {
        let domain = call.module.as_str();
        let Some(module) = self.modules.get(domain) else {
            error!(module = %domain, "open_query on a module that is not published");
            call.caller
                .fail(call.caller_nonce, "module could not be loaded: module is not available");
            return;
        };
        if module.health == ModuleHealth::Exited {
            let message = format!("module {domain} has terminated");
            call.caller.fail(call.caller_nonce, message);
            return;
        }

        let dest = Arc::clone(&module.sandbox);
        let dest_id = module.id;
        let dest_domain = module.domain.clone();
        let nonce = self.queries.open(OpenQuery {
            caller: call.caller,
            caller_domain: call.caller_domain.clone(),
            caller_nonce: call.caller_nonce,
            dest: Arc::clone(&dest),
            dest_id,
            dest_domain,
            opened_at: Instant::now(),
        });

        let frame = Frame::call(&nonce, &call.caller_domain, &call.method, call.input);
        if let Err(e) = dest.post(frame) {
            if let Some(query) = self.queries.close(&nonce) {
                warn!(module = %domain, error = %e, "could not deliver call");
                query
                    .caller
                    .fail(query.caller_nonce, format!("unable to deliver call to module: {e}"));
            }
            return;
        }
        debug!(
            module = %domain,
            method = %call.method,
            caller = %call.caller_domain,
            "query opened"
        );

        if call.send_kernel_nonce {
            if let Some(query) = self.queries.get(&nonce) {
                query
                    .caller
                    .post(Frame::response_nonce(query.caller_nonce.clone(), &nonce));
            }
        }
    }

    /// Relay a `queryUpdate` from the caller side to the destination.
    fn forward_query_update(
        &self,
        nonce: &Value,
        data: Option<Value>,
        is_sender: impl Fn(&Caller) -> bool,
    ) {
        let Some((key, query)) = nonce.as_str().and_then(|n| self.queries.get(n).map(|q| (n, q)))
        else {
            // Benign: the query may have closed while the update was in flight.
            debug!(?nonce, "queryUpdate for unknown query dropped");
            return;
        };
        if !is_sender(&query.caller) {
            warn!(
                module = %query.dest_domain,
                "protocol violation: queryUpdate from a party that did not open the query"
            );
            return;
        }
        let Some(data) = data else {
            warn!(module = %query.dest_domain, "protocol violation: queryUpdate without data");
            return;
        };
        if let Err(e) = query
            .dest
            .post(Frame::update(Value::String(key.to_owned()), "queryUpdate", data))
        {
            debug!(module = %query.dest_domain, error = %e, "queryUpdate not delivered");
        }
    }

    // ── Sandbox boundary ────────────────────────────────────────

    pub(super) fn on_sandbox_event(&mut self, id: SandboxId, domain: &str, event: SandboxEvent) {
        match event {
            SandboxEvent::Message(raw) => self.on_sandbox_frame(id, domain, raw),
            SandboxEvent::Fault(reason) => {
                warn!(module = %domain, sandbox = %id, %reason, "sandbox fault");
                self.modules
                    .set_health(domain, id, ModuleHealth::Faulted(reason));
            }
            SandboxEvent::Exited => {
                if !self.modules.set_health(domain, id, ModuleHealth::Exited)
                    && self.modules.state(domain) == LoadState::Loading
                {
                    self.early_exits.insert(id, domain.to_owned());
                }
                let abandoned = self.queries.close_destined_for(id);
                warn!(
                    module = %domain,
                    sandbox = %id,
                    abandoned = abandoned.len(),
                    "sandbox exited"
                );
                for (_, query) in abandoned {
                    query.caller.fail(query.caller_nonce, "module terminated");
                }
            }
        }
    }

    fn on_sandbox_frame(&mut self, id: SandboxId, domain: &str, raw: Value) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(module = %domain, error = %e, "protocol violation: undecodable frame");
                return;
            }
        };
        let message = SandboxMessage::from_frame(frame);
        if let SandboxMessage::Log(record) = &message {
            log_module(domain, record);
            return;
        }

        let Some(module) = self.modules.get_sandbox(domain, id) else {
            debug!(module = %domain, sandbox = %id, "frame from unpublished sandbox dropped");
            return;
        };
        let sandbox = Arc::clone(&module.sandbox);
        let reply = |frame: Frame| {
            if let Err(e) = sandbox.post(frame) {
                debug!(module = %domain, error = %e, "reply to sandbox not delivered");
            }
        };

        match message {
            SandboxMessage::Log(_) => {}
            SandboxMessage::MalformedLog { nonce, reason } => {
                warn!(module = %domain, reason, "malformed log frame");
                reply(Frame::error(nonce, reason));
            }
            SandboxMessage::MissingNonce { method } => {
                warn!(module = %domain, %method, "sandbox frame without nonce");
                reply(Frame::error(
                    Value::String(MISSING_NONCE.to_owned()),
                    format!("{method} message has no nonce"),
                ));
            }
            SandboxMessage::Version { nonce } => {
                reply(Frame::response(nonce, self.version_info()));
            }
            SandboxMessage::ModuleCall {
                nonce,
                data,
                send_kernel_nonce,
            } => match ModuleCallRequest::parse(data.as_ref()) {
                Ok(request) => self.route_call(PendingCall {
                    caller: Caller::Sandbox {
                        sandbox: Arc::clone(&sandbox),
                        id,
                    },
                    caller_domain: domain.to_owned(),
                    caller_nonce: nonce,
                    module: request.module,
                    method: request.method,
                    input: request.input,
                    send_kernel_nonce,
                }),
                Err(e) => {
                    warn!(module = %domain, error = %e, "rejecting nested moduleCall");
                    reply(Frame::error(nonce, e.to_string()));
                }
            },
            SandboxMessage::QueryUpdate { nonce, data } => {
                self.forward_query_update(&nonce, data, |caller| caller.sandbox_id() == Some(id));
            }
            SandboxMessage::ResponseUpdate { nonce, data } => {
                self.forward_response_update(id, domain, &nonce, data);
            }
            SandboxMessage::Response { nonce, data, err } => {
                self.deliver_response(id, domain, &nonce, data, err);
            }
            SandboxMessage::Unrecognized { method } => {
                warn!(module = %domain, %method, "protocol violation: unrecognized method");
            }
        }
    }

    fn forward_response_update(
        &self,
        id: SandboxId,
        domain: &str,
        nonce: &Value,
        data: Option<Value>,
    ) {
        let Some(query) = nonce.as_str().and_then(|n| self.queries.get(n)) else {
            debug!(module = %domain, "responseUpdate for unknown query dropped");
            return;
        };
        if query.dest_id != id {
            warn!(module = %domain, "protocol violation: responseUpdate from a sandbox that does not serve the query");
            return;
        }
        let Some(data) = data else {
            warn!(module = %domain, "protocol violation: responseUpdate without data");
            return;
        };
        query.caller.post(Frame::update(
            query.caller_nonce.clone(),
            "responseUpdate",
            data,
        ));
    }

    fn deliver_response(
        &mut self,
        id: SandboxId,
        domain: &str,
        nonce: &Value,
        data: Option<Value>,
        err: Option<Value>,
    ) {
        let (Some(data), Some(err)) = (data, err) else {
            warn!(
                module = %domain,
                "protocol violation: response must carry both err and data fields"
            );
            return;
        };
        if data.is_null() == err.is_null() {
            warn!(
                module = %domain,
                "protocol violation: response must set exactly one of err and data"
            );
            return;
        }
        let Some(key) = nonce.as_str() else {
            warn!(module = %domain, ?nonce, "protocol violation: response with non-string nonce");
            return;
        };
        match self.queries.get(key) {
            None => {
                warn!(module = %domain, "protocol violation: response for unknown query");
                return;
            }
            Some(query) if query.dest_id != id => {
                warn!(module = %domain, "protocol violation: response from a sandbox that does not serve the query");
                return;
            }
            Some(_) => {}
        }

        // Closed before delivery: a replayed response finds nothing.
        let Some(query) = self.queries.close(key) else {
            return;
        };
        debug!(module = %domain, caller = %query.caller_domain, "query closed");
        query.caller.respond(Frame {
            nonce: Some(query.caller_nonce),
            domain: None,
            method: "response".to_owned(),
            data: Some(data),
            err: Some(err),
            send_kernel_nonce: false,
        });
    }

    // ── Reclamation ─────────────────────────────────────────────

    pub(super) fn reap_expired(&mut self, now: Instant) {
        let expired = self.queries.expire(now, self.settings.query_ttl);
        if expired.is_empty() {
            return;
        }
        info!(count = expired.len(), "closing expired queries");
        for (_, query) in expired {
            debug!(module = %query.dest_domain, caller = %query.caller_domain, "query timed out");
            query.caller.fail(query.caller_nonce, "query timed out");
        }
    }
}

fn post_to(port: &dyn CallerPort, origin: &str, frame: Frame) {
    if let Err(e) = port.post(origin, frame) {
        debug!(%origin, error = %e, "caller is gone, frame dropped");
    }
}

fn log_module(domain: &str, record: &LogRecord) {
    if record.is_err {
        warn!(module = %domain, message = %record.message, "module log");
    } else {
        info!(module = %domain, message = %record.message, "module log");
    }
}
