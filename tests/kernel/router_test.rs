//! Caller and sandbox frame routing.

use std::time::Duration;

use serde_json::{json, Value};

use modkern::frame::PRESENT_KEY;
use modkern::kernel::KERNEL_VERSION;

use crate::support::{
    content_id, err_text, master_key, scripted, wait_until, Harness, Options, PAGE_ORIGIN,
};

const QUIET: Duration = Duration::from_millis(150);

#[tokio::test]
async fn version_probe_reports_kernel_version() {
    let mut h = Harness::start(Options::default());
    h.send(PAGE_ORIGIN, json!({"nonce": 1, "method": "version"}));

    let out = h.next().await;
    assert_eq!(out.origin, PAGE_ORIGIN);
    assert_eq!(out.frame.nonce, Some(json!(1)));
    assert_eq!(
        out.frame.data,
        Some(json!({"version": KERNEL_VERSION, "distribution": "modkern"}))
    );
    assert_eq!(out.frame.err, Some(Value::Null));
}

#[tokio::test]
async fn check_errs_starts_empty() {
    let mut h = Harness::start(Options::default());
    h.send(PAGE_ORIGIN, json!({"nonce": "e", "method": "checkErrs"}));

    let out = h.next().await;
    assert_eq!(out.frame.data, Some(json!([])));
}

#[tokio::test]
async fn unknown_method_is_answered_with_an_error() {
    let mut h = Harness::start(Options::default());
    h.send(PAGE_ORIGIN, json!({"nonce": "a", "method": "requestOverride"}));

    let out = h.next().await;
    assert_eq!(out.frame.nonce, Some(json!("a")));
    assert_eq!(err_text(&out.frame), "unrecognized method: requestOverride");
}

#[tokio::test]
async fn caller_frames_without_nonce_are_dropped() {
    let mut h = Harness::start(Options::default());
    h.send(PAGE_ORIGIN, json!({"method": "version"}));
    h.send(PAGE_ORIGIN, json!("not a frame"));
    h.send(PAGE_ORIGIN, json!({"nonce": 2, "method": "version"}));

    let out = h.next().await;
    assert_eq!(out.frame.nonce, Some(json!(2)));
    assert!(h.quiet_for(QUIET).await);
}

#[tokio::test]
async fn call_is_relayed_and_answered_on_the_callers_nonce() {
    let mut h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!("c1"), &module, "ping", json!({"x": 1}));
    let out = h.next().await;

    assert_eq!(out.origin, PAGE_ORIGIN);
    assert_eq!(out.frame.method, "response");
    assert_eq!(out.frame.nonce, Some(json!("c1")));
    assert_eq!(out.frame.err, Some(Value::Null));
    assert_eq!(
        out.frame.data,
        Some(json!({"method": "ping", "input": {"x": 1}, "caller": "example.com"}))
    );
}

#[tokio::test]
async fn sandbox_sees_credential_first_and_never_the_caller_nonce() {
    let mut h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!("secret-caller-nonce"), &module, "ping", json!(null));
    h.next().await;

    let posted = h.host.sandbox_for(module.as_str()).posted();
    assert_eq!(posted.len(), 2);

    let credential = &posted[0];
    assert_eq!(credential.method, PRESENT_KEY);
    assert_eq!(credential.domain, Some(json!("root")));
    let expected = master_key().derive_module_key(module.as_str()).to_base64();
    assert_eq!(credential.data, Some(json!({ "key": expected })));

    let call = &posted[1];
    assert_eq!(call.method, "ping");
    let kernel_nonce = call.nonce_str().expect("kernel nonce is a string");
    assert_ne!(kernel_nonce, "secret-caller-nonce");
    assert!(!kernel_nonce.is_empty());
}

#[tokio::test]
async fn privileged_methods_are_rejected_before_loading() {
    let mut h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!(3), &module, "presentSeed", json!({}));
    let out = h.next().await;

    assert_eq!(
        err_text(&out.frame),
        "presentSeed is a privileged method, only root is allowed to use it"
    );
    assert_eq!(h.host.launches(), 0);
    assert_eq!(h.store.fetches(), 0);
}

#[tokio::test]
async fn malformed_module_identifier_is_rejected() {
    let mut h = Harness::start(Options::default());
    h.send(
        PAGE_ORIGIN,
        json!({
            "nonce": 4,
            "method": "moduleCall",
            "data": {"module": "not-an-identifier", "method": "ping", "data": {}},
        }),
    );

    let out = h.next().await;
    assert_eq!(
        err_text(&out.frame),
        "'module' field in moduleCall is expected to be a raw CID or a resolver CID"
    );
}

#[tokio::test]
async fn extension_callers_act_as_their_declared_domain() {
    let mut h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);
    let origin = "moz-extension://0f1e2d3c";

    h.send(
        origin,
        json!({
            "nonce": 1,
            "domain": "ext.example",
            "method": "moduleCall",
            "data": {"module": module.as_str(), "method": "ping", "data": 0},
        }),
    );
    let out = h.next().await;
    assert_eq!(out.origin, origin);
    assert_eq!(out.frame.data.expect("data")["caller"], json!("ext.example"));

    h.send(
        origin,
        json!({
            "nonce": 2,
            "method": "moduleCall",
            "data": {"module": module.as_str(), "method": "ping", "data": 0},
        }),
    );
    let out = h.next().await;
    assert_eq!(err_text(&out.frame), "extension caller must declare a domain");
}

#[tokio::test]
async fn send_kernel_nonce_discloses_the_query_nonce() {
    let mut h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);

    h.send(
        PAGE_ORIGIN,
        json!({
            "nonce": "n1",
            "method": "moduleCall",
            "sendKernelNonce": true,
            "data": {"module": module.as_str(), "method": "ping", "data": 1},
        }),
    );

    let disclosed = h.next().await;
    assert_eq!(disclosed.frame.method, "responseNonce");
    assert_eq!(disclosed.frame.nonce, Some(json!("n1")));
    let kernel_nonce = disclosed.frame.data.expect("data")["nonce"].clone();

    let calls = h.host.sandbox_for(module.as_str()).calls();
    assert_eq!(calls[0].nonce, Some(kernel_nonce));

    let response = h.next().await;
    assert_eq!(response.frame.method, "response");
    assert_eq!(response.frame.nonce, Some(json!("n1")));
}

#[tokio::test]
async fn invalid_and_duplicate_responses_are_dropped() {
    let script = scripted(|_, frame| {
        (frame.method == "noisy").then(|| {
            let nonce = frame.nonce.clone();
            vec![
                // Neither data nor err.
                json!({"nonce": nonce, "method": "response"}),
                // Both data and err.
                json!({"nonce": nonce, "method": "response", "data": 1, "err": "x"}),
                // Data without an err field.
                json!({"nonce": nonce, "method": "response", "data": "no-err"}),
                // Err without a data field.
                json!({"nonce": nonce, "method": "response", "err": "no-data"}),
                json!({"nonce": nonce, "method": "response", "data": "first", "err": null}),
                json!({"nonce": nonce, "method": "response", "data": "second", "err": null}),
            ]
        })
    });
    let mut h = Harness::start(Options {
        script,
        ..Options::default()
    });
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!(9), &module, "noisy", json!({}));
    let out = h.next().await;
    assert_eq!(out.frame.data, Some(json!("first")));
    assert!(h.quiet_for(QUIET).await);
}

#[tokio::test]
async fn error_responses_reach_the_caller() {
    let script = scripted(|_, frame| {
        (frame.method == "fail").then(|| {
            vec![json!({"nonce": frame.nonce, "method": "response", "data": null, "err": "nope"})]
        })
    });
    let mut h = Harness::start(Options {
        script,
        ..Options::default()
    });
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!(1), &module, "fail", json!({}));
    let out = h.next().await;
    assert_eq!(out.frame.data, Some(Value::Null));
    assert_eq!(err_text(&out.frame), "nope");
}

#[tokio::test]
async fn response_updates_stream_before_the_response() {
    let script = scripted(|_, frame| {
        (frame.method == "stream").then(|| {
            let nonce = frame.nonce.clone();
            vec![
                json!({"nonce": nonce, "method": "responseUpdate", "data": "partial-1"}),
                json!({"nonce": nonce, "method": "responseUpdate", "data": "partial-2"}),
                json!({"nonce": nonce, "method": "response", "data": "done", "err": null}),
            ]
        })
    });
    let mut h = Harness::start(Options {
        script,
        ..Options::default()
    });
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!("s"), &module, "stream", json!({}));
    for expected in ["partial-1", "partial-2"] {
        let update = h.next().await;
        assert_eq!(update.frame.method, "responseUpdate");
        assert_eq!(update.frame.nonce, Some(json!("s")));
        assert_eq!(update.frame.data, Some(json!(expected)));
    }
    let done = h.next().await;
    assert_eq!(done.frame.method, "response");
    assert_eq!(done.frame.data, Some(json!("done")));
}

#[tokio::test]
async fn query_updates_only_flow_from_the_opening_origin() {
    let mut h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);

    h.send(
        PAGE_ORIGIN,
        json!({
            "nonce": "q",
            "method": "moduleCall",
            "sendKernelNonce": true,
            "data": {"module": module.as_str(), "method": "hang", "data": {}},
        }),
    );
    let disclosed = h.next().await;
    let kernel_nonce = disclosed.frame.data.expect("data")["nonce"].clone();

    h.send(
        "https://intruder.example",
        json!({"nonce": kernel_nonce, "method": "queryUpdate", "data": "forged"}),
    );
    h.send(
        PAGE_ORIGIN,
        json!({"nonce": kernel_nonce, "method": "queryUpdate", "data": {"more": 1}}),
    );
    h.send(
        PAGE_ORIGIN,
        json!({"nonce": "no-such-query", "method": "queryUpdate", "data": 0}),
    );

    let sandbox = h.host.sandbox_for(module.as_str());
    wait_until(|| sandbox.calls().iter().any(|f| f.method == "queryUpdate")).await;
    tokio::time::sleep(QUIET).await;

    let updates: Vec<_> = sandbox
        .calls()
        .into_iter()
        .filter(|f| f.method == "queryUpdate")
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].nonce, Some(kernel_nonce));
    assert_eq!(updates[0].data, Some(json!({"more": 1})));
}

#[tokio::test]
async fn responses_from_a_sandbox_not_serving_the_query_are_dropped() {
    let mut h = Harness::start(Options::default());
    let serving = content_id(1);
    let other = content_id(2);
    h.store.insert(&serving);
    h.store.insert(&other);

    h.call(json!("warmup"), &other, "ping", json!({}));
    h.next().await;

    h.send(
        PAGE_ORIGIN,
        json!({
            "nonce": "target",
            "method": "moduleCall",
            "sendKernelNonce": true,
            "data": {"module": serving.as_str(), "method": "hang", "data": {}},
        }),
    );
    let kernel_nonce = h.next().await.frame.data.expect("data")["nonce"].clone();

    h.host.sandbox_for(other.as_str()).emit(
        json!({"nonce": kernel_nonce, "method": "response", "data": "hijacked", "err": null}),
    );
    assert!(h.quiet_for(QUIET).await);

    h.host.sandbox_for(serving.as_str()).emit(
        json!({"nonce": kernel_nonce, "method": "response", "data": "genuine", "err": null}),
    );
    let out = h.next().await;
    assert_eq!(out.frame.nonce, Some(json!("target")));
    assert_eq!(out.frame.data, Some(json!("genuine")));
}

#[tokio::test]
async fn modules_can_call_other_modules() {
    let outer = content_id(1);
    let inner = content_id(2);
    let outer_domain = outer.as_str().to_owned();
    let inner_text = inner.as_str().to_owned();

    // The outer module forwards to the inner one and relays its answer,
    // tracking the pending call in the nested nonce.
    let script = scripted(move |domain, frame| {
        if domain != outer_domain {
            return None;
        }
        match frame.method.as_str() {
            "relay" => Some(vec![json!({
                "nonce": format!("inner-{}", frame.nonce_str().unwrap_or_default()),
                "method": "moduleCall",
                "data": {"module": inner_text, "method": "ping", "data": frame.data},
            })]),
            "response" => {
                let nested = frame.nonce_str()?.strip_prefix("inner-")?;
                Some(vec![json!({
                    "nonce": nested,
                    "method": "response",
                    "data": frame.data,
                    "err": null,
                })])
            }
            _ => None,
        }
    });
    let mut h = Harness::start(Options {
        script,
        ..Options::default()
    });
    h.store.insert(&outer);
    h.store.insert(&inner);

    h.call(json!("top"), &outer, "relay", json!({"v": 7}));
    let out = h.next().await;

    assert_eq!(out.frame.nonce, Some(json!("top")));
    assert_eq!(
        out.frame.data,
        Some(json!({"method": "ping", "input": {"v": 7}, "caller": outer.as_str()}))
    );
    assert_eq!(h.host.launches(), 2);
}

#[tokio::test]
async fn sandbox_protocol_frames_are_answered_on_the_sandbox() {
    let mut h = Harness::start(Options::default());
    let module = content_id(1);
    h.store.insert(&module);
    h.call(json!(0), &module, "ping", json!({}));
    h.next().await;

    let sandbox = h.host.sandbox_for(module.as_str());
    sandbox.emit(json!({"nonce": "v", "method": "version"}));
    sandbox.emit(json!({"method": "queryUpdate", "data": 1}));
    sandbox.emit(json!({"method": "log", "data": {"message": "hello"}}));
    sandbox.emit(json!({"nonce": "l", "method": "log", "data": {"message": "x", "isErr": 1}}));

    wait_until(|| sandbox.posted().len() >= 5).await;
    let posted = sandbox.posted();

    let version = posted
        .iter()
        .find(|f| f.nonce == Some(json!("v")))
        .expect("version answer");
    assert_eq!(version.data.as_ref().expect("data")["distribution"], "modkern");

    let missing = posted
        .iter()
        .find(|f| f.nonce == Some(json!("N/A")))
        .expect("missing nonce answer");
    assert_eq!(err_text(missing), "queryUpdate message has no nonce");

    let bad_log = posted
        .iter()
        .find(|f| f.nonce == Some(json!("l")))
        .expect("malformed log answer");
    assert_eq!(
        err_text(bad_log),
        "received log message with invalid isErr field"
    );

    // Nothing leaks to the caller side.
    assert!(h.quiet_for(QUIET).await);
}
