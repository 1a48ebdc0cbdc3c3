//! Calls issued by the kernel itself, and the core-module registry transport.

use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use serde_json::{json, Value};

use modkern::frame::Frame;
use modkern::identifier::Identifier;
use modkern::kernel::{CoreModules, KernelError};
use modkern::registry::entry::payload_for;
use modkern::registry::SignedRegistryEntry;

use crate::support::{content_id, err_text, scripted, Harness, Options};

#[tokio::test]
async fn internal_call_returns_the_module_result() {
    let h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);

    let result = h
        .handle
        .call_internal(&module, "ping", json!({"a": 1}))
        .await
        .expect("call succeeds");

    assert_eq!(
        result,
        json!({"method": "ping", "input": {"a": 1}, "caller": "root"})
    );
}

#[tokio::test]
async fn internal_call_surfaces_module_errors() {
    let script = scripted(|_, frame| {
        (frame.method == "fail").then(|| {
            vec![json!({"nonce": frame.nonce, "method": "response", "data": null, "err": {"code": 7}})]
        })
    });
    let h = Harness::start(Options {
        script,
        ..Options::default()
    });
    let module = content_id(1);
    h.store.insert(&module);

    let err = h
        .handle
        .call_internal(&module, "fail", json!({}))
        .await
        .expect_err("module error");
    assert!(matches!(err, KernelError::Module(ref v) if *v == json!({"code": 7})));
}

#[tokio::test]
async fn internal_call_reports_load_failures() {
    let h = Harness::start(Options::default());

    let err = h
        .handle
        .call_internal(&content_id(3), "ping", json!({}))
        .await
        .expect_err("nothing stored");
    match err {
        KernelError::Module(Value::String(text)) => {
            assert!(text.starts_with("module could not be loaded"), "got {text}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

/// Core modules answering readiness and entry lookups.
fn network_script(
    swarm: &Identifier,
    s5: &Identifier,
    entry: Vec<u8>,
    lookups: Arc<Mutex<Vec<Frame>>>,
) -> crate::support::Script {
    let swarm = swarm.as_str().to_owned();
    let s5 = s5.as_str().to_owned();
    scripted(move |domain, frame| {
        if domain == swarm && frame.method == "getRelays" {
            return Some(vec![
                json!({"nonce": frame.nonce, "method": "response", "data": ["relay-1"], "err": null}),
            ]);
        }
        if domain == s5 && frame.method == "getRegistryEntry" {
            lookups.lock().expect("lookups lock").push(frame.clone());
            return Some(vec![
                json!({"nonce": frame.nonce, "method": "response", "data": entry, "err": null}),
            ]);
        }
        None
    })
}

#[tokio::test]
async fn core_modules_resolve_registry_entries() {
    let key = SigningKey::from_bytes(&[9u8; 32]);
    let public_key = key.verifying_key().to_bytes();
    let resolver = Identifier::resolver(public_key);
    let target = content_id(5);
    let entry = SignedRegistryEntry::sign(&key, 3, payload_for(&target))
        .expect("payload fits")
        .encode();

    let swarm = content_id(10);
    let s5 = content_id(11);
    let lookups = Arc::new(Mutex::new(Vec::new()));
    let mut h = Harness::start(Options {
        script: network_script(&swarm, &s5, entry, Arc::clone(&lookups)),
        transport: None,
        core_modules: CoreModules {
            swarm: Some(swarm.clone()),
            s5: Some(s5.clone()),
        },
        ..Options::default()
    });
    for id in [&swarm, &s5, &target] {
        h.store.insert(id);
    }

    // Readiness only counts a swarm that is already running.
    let relays = h
        .handle
        .call_internal(&swarm, "getRelays", json!({}))
        .await
        .expect("swarm answers");
    assert_eq!(relays, json!(["relay-1"]));

    h.call(json!("r"), &resolver, "ping", json!({}));
    let out = h.next().await;
    assert_eq!(out.frame.err, Some(Value::Null));
    assert_eq!(out.frame.nonce, Some(json!("r")));

    let lookups = lookups.lock().expect("lookups lock").clone();
    assert_eq!(lookups.len(), 1);
    assert_eq!(lookups[0].domain, Some(json!("root")));
    let mut pubkey = vec![0xed_u8];
    pubkey.extend_from_slice(&public_key);
    assert_eq!(lookups[0].data, Some(json!({ "pubkey": pubkey })));

    let status = h.handle.status().await.expect("status");
    let module = status
        .modules
        .iter()
        .find(|m| m.domain == resolver.as_str())
        .expect("resolver module published");
    assert_eq!(module.target, target.as_str());
}

#[tokio::test]
async fn resolution_waits_for_a_running_swarm() {
    let swarm = content_id(10);
    let s5 = content_id(11);
    let lookups = Arc::new(Mutex::new(Vec::new()));
    let mut h = Harness::start(Options {
        script: network_script(&swarm, &s5, Vec::new(), Arc::clone(&lookups)),
        transport: None,
        core_modules: CoreModules {
            swarm: Some(swarm.clone()),
            s5: Some(s5.clone()),
        },
        ..Options::default()
    });
    h.store.insert(&swarm);
    h.store.insert(&s5);

    let resolver = Identifier::resolver([4u8; 32]);
    h.call(json!(1), &resolver, "ping", json!({}));
    let out = h.next().await;

    assert!(err_text(&out.frame).starts_with("registry entry for module is not found"));
    assert_eq!(h.host.launches(), 0);
    assert!(lookups.lock().expect("lookups lock").is_empty());
}

#[tokio::test]
async fn resolver_addressed_registry_module_fails_instead_of_waiting_on_itself() {
    let swarm = content_id(10);
    let s5 = Identifier::resolver([0x55; 32]);
    let lookups = Arc::new(Mutex::new(Vec::new()));
    let mut h = Harness::start(Options {
        script: network_script(&swarm, &s5, Vec::new(), Arc::clone(&lookups)),
        transport: None,
        core_modules: CoreModules {
            swarm: Some(swarm.clone()),
            s5: Some(s5.clone()),
        },
        ..Options::default()
    });
    h.store.insert(&swarm);
    h.handle
        .call_internal(&swarm, "getRelays", json!({}))
        .await
        .expect("swarm answers");

    h.call(json!("s5"), &s5, "ping", json!({}));
    let out = h.next().await;
    assert!(
        err_text(&out.frame).starts_with("registry entry for module is not found"),
        "got {:?}",
        out.frame.err
    );

    let status = h.handle.status().await.expect("status");
    assert!(status.loading.is_empty());
    assert!(lookups.lock().expect("lookups lock").is_empty());
}
