// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped state client against an in-process store with version gating.

mod common;

use common::{FakeStateStore, refused_url};
use runfn_sdk::runfn_http::{HttpClientConfig, RetryingClient};
use runfn_sdk::{FunctionError, StateBinding, StateClient, StateScope};
use serde_json::{Value, json};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "secret";

fn client(base_url: &str) -> StateClient {
    let binding = StateBinding {
        base_url: base_url.to_string(),
        token: TOKEN.to_string(),
        organization_id: "o1".to_string(),
        project_id: "p1".to_string(),
        environment_id: "e1".to_string(),
    };
    StateClient::new(binding, RetryingClient::new(HttpClientConfig::default()).unwrap())
}

fn increment(old: Option<Value>) -> Result<Value, FunctionError> {
    Ok(json!(old.and_then(|v| v.as_i64()).unwrap_or(0) + 1))
}

#[tokio::test]
async fn test_get_missing_key_is_not_found() {
    let (_store, url) = FakeStateStore::start(TOKEN).await;
    let state = client(&url).with_env_scope().unwrap();

    let err = state.get("absent").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.message, "key not found: absent");
}

#[tokio::test]
async fn test_set_creates_then_updates() {
    let (store, url) = FakeStateStore::start(TOKEN).await;
    let state = client(&url).with_env_scope().unwrap();

    assert_eq!(state.set("counter", increment).await.unwrap(), json!(1));
    assert_eq!(state.set("counter", increment).await.unwrap(), json!(2));

    let entry = state.get("counter").await.unwrap();
    assert_eq!(entry.value, json!(2));
    assert_eq!(entry.version, 2);
    assert_eq!(
        store.entry(&StateScope::environment("o1", "p1", "e1"), "counter"),
        Some((json!(2), 2))
    );
}

#[tokio::test]
async fn test_stale_set_kv_is_rejected_without_mutation() {
    let (store, url) = FakeStateStore::start(TOKEN).await;
    let state = client(&url).with_project_scope().unwrap();

    state.set_kv("config", &json!({"mode": "a"}), 0).await.unwrap();

    let err = state.set_kv("config", &json!({"mode": "b"}), 0).await.unwrap_err();
    assert!(err.is_conflict());

    let entry = state.get("config").await.unwrap();
    assert_eq!(entry.value, json!({"mode": "a"}));
    assert_eq!(entry.version, 1);
    assert_eq!(
        store.entry(&StateScope::project("o1", "p1"), "config"),
        Some((json!({"mode": "a"}), 1))
    );
}

#[tokio::test]
async fn test_concurrent_sets_lose_no_update() {
    let (_store, url) = FakeStateStore::start(TOKEN).await;
    let state = client(&url).with_max_set_attempts(20).with_org_scope().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let state = state.clone();
        tasks.push(tokio::spawn(async move { state.set("hits", increment).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let entry = state.get("hits").await.unwrap();
    assert_eq!(entry.value, json!(8));
    assert_eq!(entry.version, 8);
}

#[tokio::test]
async fn test_scopes_are_isolated() {
    let (_store, url) = FakeStateStore::start(TOKEN).await;
    let client = client(&url);
    let org = client.with_org_scope().unwrap();
    let env = client.with_env_scope().unwrap();

    org.set_kv("shared", &json!("org"), 0).await.unwrap();
    env.set_kv("shared", &json!("env"), 0).await.unwrap();

    assert_eq!(org.get("shared").await.unwrap().value, json!("org"));
    assert_eq!(env.get("shared").await.unwrap().value, json!("env"));

    let other_env = client
        .with_custom_scope(StateScope::environment("o1", "p1", "e2"))
        .unwrap();
    assert!(other_env.get("shared").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_removes_key() {
    let (_store, url) = FakeStateStore::start(TOKEN).await;
    let state = client(&url).with_env_scope().unwrap();

    state.set_kv("temp", &json!(true), 0).await.unwrap();
    state.delete("temp").await.unwrap();
    assert!(state.get("temp").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_wrong_token_fails() {
    let (_store, url) = FakeStateStore::start("other-token").await;
    let state = client(&url).with_env_scope().unwrap();

    let err = state.get("counter").await.unwrap_err();
    assert!(err.is_failed(), "{err:?}");
}

#[tokio::test]
async fn test_update_error_aborts_set() {
    let (store, url) = FakeStateStore::start(TOKEN).await;
    let state = client(&url).with_env_scope().unwrap();

    let err = state
        .set("counter", |_| Err(FunctionError::failed("cannot compute")))
        .await
        .unwrap_err();
    assert!(err.is_failed());
    assert_eq!(store.entry(state.scope(), "counter"), None);
}

#[tokio::test]
async fn test_persistent_conflicts_become_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": 1, "version": 3})))
        .expect(5)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(409).set_body_string("version conflict"))
        .expect(5)
        .mount(&server)
        .await;

    let state = client(&format!("{}/kv", server.uri())).with_env_scope().unwrap();
    let err = state.set("counter", increment).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(err.message, "set failed after max retries due to version conflicts");
}

#[tokio::test]
async fn test_unexpected_status_is_failed_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
        .mount(&server)
        .await;

    let state = client(&format!("{}/kv", server.uri())).with_env_scope().unwrap();
    let err = state.set_kv("counter", &json!(1), 0).await.unwrap_err();

    assert!(err.is_failed());
    assert_eq!(err.message, "set failed: disk full");
}

#[tokio::test]
async fn test_unreachable_store_is_transient() {
    let state = client(&refused_url().await).with_env_scope().unwrap();

    let err = state.get("counter").await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}
