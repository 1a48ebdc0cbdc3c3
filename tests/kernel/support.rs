//! Fakes and a harness shared by the kernel integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use modkern::credential::MasterKey;
use modkern::frame::{Frame, PRESENT_KEY};
use modkern::host::{
    CallerPort, ChannelPort, CodeStore, HostError, Outbound, Sandbox, SandboxEvents, SandboxHost,
};
use modkern::identifier::Identifier;
use modkern::kernel::{self, CoreModules, KernelDeps, KernelHandle, RouterSettings};
use modkern::registry::{
    Ed25519Verifier, RegistryOverrides, RegistryTransport, ResolveError,
};

/// Decides what a fake module emits in reaction to a frame: `(domain, frame)`.
pub type Script = Arc<dyn Fn(&str, &Frame) -> Vec<Value> + Send + Sync>;

pub const PAGE_ORIGIN: &str = "https://example.com";

pub fn master_key() -> MasterKey {
    MasterKey::from_bytes([7u8; 32])
}

pub fn content_id(n: u8) -> Identifier {
    Identifier::content([n; 32], Some(u64::from(n)))
}

/// Answers every call with `{method, input, caller}`.
pub fn echo_script() -> Script {
    Arc::new(|_domain, frame| {
        match frame.method.as_str() {
            PRESENT_KEY | "hang" | "queryUpdate" | "response" | "responseUpdate"
            | "responseNonce" => return Vec::new(),
            _ => {}
        }
        vec![json!({
            "nonce": frame.nonce,
            "method": "response",
            "err": null,
            "data": {
                "method": frame.method,
                "input": frame.data,
                "caller": frame.domain,
            },
        })]
    })
}

/// Runs `special` first and falls back to [`echo_script`] when it returns `None`.
pub fn scripted(
    special: impl Fn(&str, &Frame) -> Option<Vec<Value>> + Send + Sync + 'static,
) -> Script {
    let echo = echo_script();
    Arc::new(move |domain, frame| special(domain, frame).unwrap_or_else(|| echo(domain, frame)))
}

// ── Fake sandbox host ───────────────────────────────────────────

pub struct FakeSandbox {
    pub events: SandboxEvents,
    posted: Mutex<Vec<Frame>>,
    script: Script,
    terminated: AtomicBool,
}

impl FakeSandbox {
    /// Every frame the kernel posted, in order.
    pub fn posted(&self) -> Vec<Frame> {
        self.posted.lock().expect("posted lock").clone()
    }

    /// Call frames only (credential excluded).
    pub fn calls(&self) -> Vec<Frame> {
        self.posted()
            .into_iter()
            .filter(|f| f.method != PRESENT_KEY)
            .collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Emit a raw frame as if the module wrote it.
    pub fn emit(&self, frame: Value) {
        self.events.message(frame);
    }

    pub fn exit(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.events.exited();
    }
}

impl Sandbox for FakeSandbox {
    fn post(&self, frame: Frame) -> Result<(), HostError> {
        if self.is_terminated() {
            return Err(HostError::Closed);
        }
        let replies = (self.script)(self.events.domain(), &frame);
        self.posted.lock().expect("posted lock").push(frame);
        for reply in replies {
            self.events.message(reply);
        }
        Ok(())
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

pub struct FakeHost {
    script: Script,
    delay: Duration,
    fail: AtomicBool,
    launches: AtomicUsize,
    sandboxes: Mutex<Vec<Arc<FakeSandbox>>>,
}

impl FakeHost {
    pub fn new(script: Script, delay: Duration) -> Self {
        Self {
            script,
            delay,
            fail: AtomicBool::new(false),
            launches: AtomicUsize::new(0),
            sandboxes: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn sandboxes(&self) -> Vec<Arc<FakeSandbox>> {
        self.sandboxes.lock().expect("sandboxes lock").clone()
    }

    pub fn sandbox_for(&self, domain: &str) -> Arc<FakeSandbox> {
        self.sandboxes()
            .into_iter()
            .find(|s| s.events.domain() == domain)
            .expect("no sandbox launched for domain")
    }
}

#[async_trait]
impl SandboxHost for FakeHost {
    async fn create_sandbox(
        &self,
        _code: Vec<u8>,
        events: SandboxEvents,
    ) -> Result<Arc<dyn Sandbox>, HostError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(HostError::Create("host refused".to_owned()));
        }
        let sandbox = Arc::new(FakeSandbox {
            events,
            posted: Mutex::new(Vec::new()),
            script: Arc::clone(&self.script),
            terminated: AtomicBool::new(false),
        });
        self.sandboxes
            .lock()
            .expect("sandboxes lock")
            .push(Arc::clone(&sandbox));
        Ok(sandbox)
    }
}

// ── Fake code store ─────────────────────────────────────────────

pub struct CountingStore {
    code: Mutex<HashMap<String, Vec<u8>>>,
    delay: Duration,
    fetches: AtomicUsize,
}

impl CountingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            code: Mutex::new(HashMap::new()),
            delay,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, id: &Identifier) {
        self.code
            .lock()
            .expect("code lock")
            .insert(id.as_str().to_owned(), format!("code for {id}").into_bytes());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeStore for CountingStore {
    async fn fetch_code(&self, id: &Identifier) -> Result<Vec<u8>, HostError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.code
            .lock()
            .expect("code lock")
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| HostError::NotFound(id.to_string()))
    }
}

// ── Fake registry transport ─────────────────────────────────────

pub struct StaticTransport {
    pub ready: bool,
    pub entry: Option<Vec<u8>>,
    lookups: AtomicUsize,
}

impl StaticTransport {
    pub fn new(ready: bool, entry: Option<Vec<u8>>) -> Self {
        Self {
            ready,
            entry,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryTransport for StaticTransport {
    async fn network_ready(&self) -> bool {
        self.ready
    }

    async fn get_registry_entry(&self, _public_key: &[u8; 32]) -> Result<Vec<u8>, ResolveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.entry
            .clone()
            .ok_or_else(|| ResolveError::Lookup("nothing published".to_owned()))
    }
}

// ── Harness ─────────────────────────────────────────────────────

pub struct Options {
    pub settings: RouterSettings,
    pub script: Script,
    pub host_delay: Duration,
    pub store_delay: Duration,
    pub overrides: RegistryOverrides,
    pub transport: Option<Arc<dyn RegistryTransport>>,
    pub core_modules: CoreModules,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            settings: RouterSettings::default(),
            script: echo_script(),
            host_delay: Duration::ZERO,
            store_delay: Duration::ZERO,
            overrides: RegistryOverrides::default(),
            transport: Some(Arc::new(StaticTransport::new(false, None))),
            core_modules: CoreModules::default(),
        }
    }
}

pub struct Harness {
    pub handle: KernelHandle,
    pub host: Arc<FakeHost>,
    pub store: Arc<CountingStore>,
    pub port: Arc<dyn CallerPort>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Harness {
    pub fn start(options: Options) -> Self {
        let host = Arc::new(FakeHost::new(options.script, options.host_delay));
        let store = Arc::new(CountingStore::new(options.store_delay));
        let handle = kernel::spawn(KernelDeps {
            settings: options.settings,
            master_key: master_key(),
            store: store.clone(),
            host: host.clone(),
            overrides: Arc::new(options.overrides),
            verifier: Arc::new(Ed25519Verifier),
            transport: options.transport,
            core_modules: options.core_modules,
        });
        let (port, outbound) = ChannelPort::new();
        Self {
            handle,
            host,
            store,
            port: Arc::new(port),
            outbound,
        }
    }

    pub fn send(&self, origin: &str, frame: Value) {
        self.handle
            .submit(Arc::clone(&self.port), origin, frame)
            .expect("kernel running");
    }

    pub fn call(&self, nonce: Value, module: &Identifier, method: &str, input: Value) {
        self.send(
            PAGE_ORIGIN,
            json!({
                "nonce": nonce,
                "method": "moduleCall",
                "data": {"module": module.as_str(), "method": method, "data": input},
            }),
        );
    }

    /// Next frame for any caller, failing the test after `within`.
    pub async fn next_within(&mut self, within: Duration) -> Outbound {
        tokio::time::timeout(within, self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("outbound channel closed")
    }

    pub async fn next(&mut self) -> Outbound {
        self.next_within(Duration::from_secs(5)).await
    }

    /// Whether no frame arrives within `within`.
    pub async fn quiet_for(&mut self, within: Duration) -> bool {
        tokio::time::timeout(within, self.outbound.recv()).await.is_err()
    }
}

/// Poll `condition` until it holds, failing after about five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// The `err` field of a response frame as text.
pub fn err_text(frame: &Frame) -> String {
    frame
        .err
        .as_ref()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}
