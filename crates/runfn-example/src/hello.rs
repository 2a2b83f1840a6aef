// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Greeting function used by the example host.
//!
//! Request fields:
//! - `previous.counter`: counter carried over from an `execute_again` round
//! - `count`: number of log lines to emit, one second apart
//! - `error`: `execute_again`, `transient`, `failed` or anything else for an
//!   unclassified error
//!
//! When the invocation is bound to a state store, `counter` is written and the
//! `payload` entry is incremented in the environment scope.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use runfn_sdk::types::{META_STATE_STORE_URL, METADATA_KEY};
use runfn_sdk::{FunctionError, FunctionHandler, InvocationContext, Logger, ObjectError, Request, Response};
use serde_json::{Map, Value, json};

pub struct HelloHandler;

#[async_trait]
impl FunctionHandler for HelloHandler {
    async fn handle(&self, ctx: InvocationContext, logger: Logger, request: Request) -> anyhow::Result<Response> {
        let counter = match request.get_f64(&["previous", "counter"]) {
            Ok(counter) => {
                logger.info(format_args!("previous counter {counter}"));
                counter
            }
            Err(ObjectError::KeyNotFound(_)) => 0.0,
            Err(err) => return Err(err).context("reading previous counter"),
        };

        let mut echoed = request.clone();
        echoed.remove(METADATA_KEY);
        logger.info(format_args!("received request {}", Value::from(echoed.clone())));

        let mut response = Response::new()
            .with("output", "Hello World")
            .with("request", echoed);

        if request.meta_str(META_STATE_STORE_URL).is_some() {
            let state = ctx.state(&request)?.with_env_scope()?;

            state
                .set("counter", |_| Ok::<_, FunctionError>(json!(counter)))
                .await
                .context("storing counter")?;
            response = response.with("counter", counter);

            let payload = state
                .set("payload", |old| {
                    let previous = old
                        .as_ref()
                        .and_then(|value| value.get("counter"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    Ok::<_, FunctionError>(json!({"counter": previous + 1.0}))
                })
                .await
                .context("updating payload")?;
            logger.info(format_args!("incremented counter within payload to {}", payload["counter"]));
            response = response.with("payload", payload["counter"].clone());
        }

        let count = match request.get_i64(&["count"]) {
            Ok(count) => count,
            Err(ObjectError::KeyNotFound(_)) => 0,
            Err(_) => return Err(FunctionError::failed("count is not an integer").into()),
        };
        for number in 0..count {
            logger.info(format_args!("log iteration number={number}"));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if let Some(kind) = request.get("error") {
            match kind.as_str().unwrap_or_default() {
                // A single re-run is enough to show the round trip
                "execute_again" if counter > 1.0 => {}
                "execute_again" => {
                    let mut data = Map::new();
                    data.insert("rkey".to_string(), json!("rvalue"));
                    data.insert("counter".to_string(), json!(counter + 1.0));
                    return Err(FunctionError::execute_again("execute_again", Some(data)).into());
                }
                "transient" => return Err(FunctionError::transient("transient").into()),
                "failed" => return Err(FunctionError::failed("failed").into()),
                other => anyhow::bail!("unknown error: {other}"),
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runfn_sdk::runfn_http::RetryingClient;
    use runfn_sdk::{ErrorKind, as_function_error};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> InvocationContext {
        InvocationContext::new(RetryingClient::new(Default::default()).unwrap())
    }

    async fn call(request: Value) -> anyhow::Result<Response> {
        HelloHandler
            .handle(context(), Logger::current(), Request::try_from(request).unwrap())
            .await
    }

    async fn call_err(request: Value) -> FunctionError {
        let err = call(request).await.unwrap_err();
        as_function_error(err.as_ref())
    }

    #[tokio::test]
    async fn test_greets_and_echoes_request() {
        let response = call(json!({"name": "world", "metadata": {"activityID": "a1"}}))
            .await
            .unwrap();
        assert_eq!(
            Value::from(response),
            json!({"output": "Hello World", "request": {"name": "world"}})
        );
    }

    #[tokio::test]
    async fn test_error_switch() {
        let err = call_err(json!({"error": "transient"})).await;
        assert_eq!((err.kind, err.message.as_str()), (ErrorKind::Transient, "transient"));
        assert_eq!(err.stack_trace, None);

        let err = call_err(json!({"error": "failed"})).await;
        assert_eq!(err.kind, ErrorKind::Failed);

        let err = call_err(json!({"error": "surprise"})).await;
        assert_eq!(err.kind, ErrorKind::Failed);
        assert_eq!(err.message, "unknown error: surprise");
    }

    #[tokio::test]
    async fn test_execute_again_carries_counter_until_second_round() {
        let err = call_err(json!({"error": "execute_again"})).await;
        assert_eq!(err.kind, ErrorKind::ExecuteAgain);
        let data = err.data.unwrap();
        assert_eq!(data["rkey"], json!("rvalue"));
        assert_eq!(data["counter"], json!(1.0));

        // The orchestrator re-invokes with the data as `previous`
        let response = call(json!({"error": "execute_again", "previous": {"counter": 2.0}}))
            .await
            .unwrap();
        assert_eq!(response["output"], json!("Hello World"));
    }

    #[tokio::test]
    async fn test_count_must_be_an_integer() {
        let err = call_err(json!({"count": "many"})).await;
        assert_eq!(err.kind, ErrorKind::Failed);
        assert_eq!(err.message, "count is not an integer");
    }

    #[tokio::test]
    async fn test_bound_state_records_counter_and_payload() {
        let store = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&store)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&store)
            .await;

        let response = call(json!({
            "previous": {"counter": 1.0},
            "metadata": {
                "stateStoreUrl": format!("{}/kv", store.uri()),
                "stateStoreToken": "secret",
                "organizationID": "o1",
                "projectID": "p1",
                "environmentID": "e1",
            },
        }))
        .await
        .unwrap();

        assert_eq!(response["counter"], json!(1.0));
        assert_eq!(response["payload"], json!(1.0));
    }
}
