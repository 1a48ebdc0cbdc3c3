//! Expiry of queries that never receive a response.

use std::time::Duration;

use serde_json::json;

use modkern::kernel::RouterSettings;

use crate::support::{content_id, err_text, Harness, Options};

fn short_ttl() -> Options {
    Options {
        settings: RouterSettings {
            query_ttl: Duration::from_secs(30),
            reap_interval: Duration::from_secs(1),
            ..RouterSettings::default()
        },
        ..Options::default()
    }
}

#[tokio::test(start_paused = true)]
async fn stale_query_is_closed_and_late_response_dropped() {
    let mut h = Harness::start(short_ttl());
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!("slow"), &module, "hang", json!({}));
    let out = h.next_within(Duration::from_secs(60)).await;
    assert_eq!(out.frame.nonce, Some(json!("slow")));
    assert_eq!(err_text(&out.frame), "query timed out");

    let sandbox = h.host.sandbox_for(module.as_str());
    let kernel_nonce = sandbox.calls()[0].nonce.clone();
    sandbox.emit(json!({"nonce": kernel_nonce, "method": "response", "data": "late", "err": null}));
    assert!(h.quiet_for(Duration::from_secs(5)).await);

    let status = h.handle.status().await.expect("status");
    assert_eq!(status.open_queries, 0);
}

#[tokio::test(start_paused = true)]
async fn young_queries_survive_a_reap() {
    let mut h = Harness::start(short_ttl());
    let module = content_id(1);
    h.store.insert(&module);

    h.call(json!("old"), &module, "hang", json!({}));
    tokio::time::sleep(Duration::from_secs(20)).await;
    h.call(json!("young"), &module, "hang", json!({}));

    let first = h.next_within(Duration::from_secs(20)).await;
    assert_eq!(first.frame.nonce, Some(json!("old")));
    assert_eq!(h.handle.status().await.expect("status").open_queries, 1);

    let second = h.next_within(Duration::from_secs(30)).await;
    assert_eq!(second.frame.nonce, Some(json!("young")));
    assert_eq!(err_text(&second.frame), "query timed out");
}
