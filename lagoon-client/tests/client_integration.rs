// Copyright 2025 Lagoon Contributors (https://github.com/lagoondb/lagoon)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end client scenarios against a scripted transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use lagoon_client::{
    AuthProvider, CircuitConfig, ClientConfig, LagoonClient, RetryPolicy, ServerPush, Transport,
    TransportRequest, TransportResponse, UpdateSource,
};
use lagoon_core::{wire, CacheKey, LagoonError, Result, Value};

/// Transport that replays a scripted list of outcomes and records every
/// request it was handed.
#[derive(Default)]
struct ScriptedTransport {
    requests: Mutex<Vec<TransportRequest>>,
    script: Mutex<VecDeque<Result<TransportResponse>>>,
}

impl ScriptedTransport {
    fn push_ok(&self, status: u16, body: String) {
        self.script
            .lock()
            .push_back(Ok(TransportResponse { status, body }));
    }

    fn push_network_failure(&self) {
        self.script.lock().push_back(Err(LagoonError::Network {
            message: "connection refused".into(),
        }));
    }

    fn sent(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        self.requests.lock().push(request);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(TransportResponse {
                status: 200,
                body: r#"{"status":"success","value":null}"#.into(),
            }))
    }
}

/// Auth provider that counts how often it is asked for headers.
#[derive(Default)]
struct CountingAuth {
    calls: Mutex<u32>,
}

#[async_trait]
impl AuthProvider for CountingAuth {
    async fn headers(&self, _cancel: &CancellationToken) -> Result<Vec<(String, String)>> {
        *self.calls.lock() += 1;
        Ok(vec![("Authorization".into(), "Bearer test".into())])
    }
}

fn success_body(value: &Value) -> String {
    serde_json::json!({ "status": "success", "value": wire::encode_json(value) }).to_string()
}

fn test_config() -> ClientConfig {
    ClientConfig::for_deployment("https://acme.lagoon.dev")
        .with_retry(RetryPolicy::constant(Duration::from_millis(10), 3))
}

fn client_with(
    transport: Arc<ScriptedTransport>,
    auth: Arc<CountingAuth>,
    config: ClientConfig,
) -> LagoonClient {
    LagoonClient::new(config, transport, auth)
}

#[tokio::test(start_paused = true)]
async fn query_updates_cache_and_notifies_subscribers() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_ok(
        200,
        success_body(&Value::object([("score", Value::Int64(3))])),
    );
    let client = client_with(
        transport.clone(),
        Arc::new(CountingAuth::default()),
        test_config(),
    );

    let args = Value::object([("id", Value::from("r1"))]);
    let key = CacheKey::new("rooms:get", &args);
    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = seen.clone();
    client.cache().subscribe(&key, move |v| sink.lock().push(v.clone()));

    let cancel = CancellationToken::new();
    let value = client
        .query("rooms:get")
        .args(args.clone())
        .call(&cancel)
        .await
        .unwrap();

    assert_eq!(value.get("score").and_then(Value::as_i64), Some(3));
    assert_eq!(client.cache().get(&key), Some(value));
    assert_eq!(seen.lock().len(), 1);

    // the envelope carried the canonical argument encoding
    let requests = transport.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "https://acme.lagoon.dev/api/query");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["path"], "rooms:get");
    assert_eq!(body["format"], "encoded_json");
    assert_eq!(body["args"][0]["id"], "r1");
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_then_succeed() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_network_failure();
    transport.push_network_failure();
    transport.push_ok(200, success_body(&Value::Int64(1)));
    let auth = Arc::new(CountingAuth::default());
    let client = client_with(transport.clone(), auth.clone(), test_config());

    let cancel = CancellationToken::new();
    let value = client.query("counts:get").call(&cancel).await.unwrap();

    assert_eq!(value, Value::Int64(1));
    assert_eq!(transport.sent(), 3);
    // auth headers were fetched fresh for every attempt, never cached
    assert_eq!(*auth.calls.lock(), 3);
}

#[tokio::test(start_paused = true)]
async fn application_error_is_not_retried() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_ok(
        560,
        r#"{"status":"error","errorMessage":"room is full"}"#.into(),
    );
    let client = client_with(
        transport.clone(),
        Arc::new(CountingAuth::default()),
        test_config(),
    );

    let cancel = CancellationToken::new();
    let err = client
        .mutation("rooms:join")
        .call(&cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, LagoonError::Function { .. }));
    assert_eq!(transport.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn mutation_failure_rolls_back_optimistic_writes() {
    let transport = Arc::new(ScriptedTransport::default());
    for _ in 0..3 {
        transport.push_network_failure();
    }
    let client = client_with(
        transport.clone(),
        Arc::new(CountingAuth::default()),
        test_config(),
    );

    let args = Value::object([("id", Value::from("r1"))]);
    let key = CacheKey::new("rooms:get", &args);
    client
        .cache()
        .set_and_notify(&key, Value::Int64(0), UpdateSource::ServerQuery);

    let cancel = CancellationToken::new();
    let err = client
        .mutation("rooms:increment")
        .args(args.clone())
        .optimistic({
            let args = args.clone();
            move |tx| tx.set_query("rooms:get", &args, Value::Int64(1))
        })
        .call(&cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, LagoonError::Network { .. }));
    // the rollback completed before the error surfaced
    assert_eq!(client.cache().get(&key), Some(Value::Int64(0)));
}

#[tokio::test(start_paused = true)]
async fn mutation_success_keeps_optimistic_value_until_server_truth() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push_ok(200, success_body(&Value::Null));
    let client = client_with(
        transport.clone(),
        Arc::new(CountingAuth::default()),
        test_config(),
    );

    let args = Value::empty_object();
    let key = CacheKey::new("counts:get", &args);

    let cancel = CancellationToken::new();
    client
        .mutation("counts:increment")
        .optimistic({
            let args = args.clone();
            move |tx| tx.set_query("counts:get", &args, Value::Int64(5))
        })
        .call(&cancel)
        .await
        .unwrap();

    // committed: the speculative value stays until the server supersedes it
    assert_eq!(client.cache().get(&key), Some(Value::Int64(5)));
    client.subscription_feed().apply(ServerPush {
        key: key.clone(),
        value: Value::Int64(6),
    });
    assert_eq!(client.cache().get(&key), Some(Value::Int64(6)));
}

/// The race scenario: optimistic write, server push for the same key, then
/// rollback. The server value must survive the rollback.
#[tokio::test(start_paused = true)]
async fn rollback_after_server_push_keeps_server_value() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = client_with(
        transport,
        Arc::new(CountingAuth::default()),
        test_config(),
    );

    let args = Value::object([("id", Value::from("r1"))]);
    let key = CacheKey::new("rooms:get", &args);

    let seen: Arc<Mutex<Vec<i64>>> = Arc::default();
    let sink = seen.clone();
    client.cache().subscribe(&key, move |v| {
        sink.lock().push(v.get("score").and_then(Value::as_i64).unwrap())
    });

    // speculative write: subscriber sees score 0 synchronously
    let tx = client.begin_optimistic();
    tx.set_query(
        "rooms:get",
        &args,
        Value::object([("score", Value::Int64(0))]),
    );
    assert_eq!(*seen.lock(), vec![0]);

    // server truth arrives over the subscription protocol
    client.subscription_feed().apply(ServerPush {
        key: key.clone(),
        value: Value::object([("score", Value::Int64(10))]),
    });
    assert_eq!(*seen.lock(), vec![0, 10]);

    // late rollback of the original transaction must not revert to 0
    tx.rollback();
    assert_eq!(
        client.cache().get(&key),
        Some(Value::object([("score", Value::Int64(10))]))
    );
    assert_eq!(*seen.lock(), vec![0, 10]);
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_repeated_failures_and_sheds_load() {
    let transport = Arc::new(ScriptedTransport::default());
    for _ in 0..4 {
        transport.push_network_failure();
    }
    let config = ClientConfig::for_deployment("https://acme.lagoon.dev")
        .with_retry(RetryPolicy::constant(Duration::from_millis(10), 2))
        .with_circuit(CircuitConfig {
            failure_threshold: 4,
            break_duration: Duration::from_secs(30),
        });
    let client = client_with(transport.clone(), Arc::new(CountingAuth::default()), config);
    let cancel = CancellationToken::new();

    // two calls, two attempts each: breaker trips at the fourth failure
    for _ in 0..2 {
        let _ = client.action("jobs:kick").call(&cancel).await;
    }
    assert_eq!(transport.sent(), 4);

    // backpressure: rejected without reaching the transport
    let err = client.action("jobs:kick").call(&cancel).await.unwrap_err();
    assert!(matches!(err, LagoonError::CircuitOpen { .. }));
    assert_eq!(transport.sent(), 4);
}

#[tokio::test(start_paused = true)]
async fn cancellation_surfaces_without_rolling_back_committed_writes() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = client_with(
        transport,
        Arc::new(CountingAuth::default()),
        test_config(),
    );

    let args = Value::empty_object();
    let key = CacheKey::new("counts:get", &args);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client
        .query("counts:get")
        .args(args.clone())
        .call(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LagoonError::Cancelled));

    // a committed optimistic transaction is untouched by the cancelled call
    let tx = client.begin_optimistic();
    tx.set_query("counts:get", &args, Value::Int64(1));
    tx.commit();
    let err = client
        .query("counts:get")
        .args(args.clone())
        .call(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LagoonError::Cancelled));
    assert_eq!(client.cache().get(&key), Some(Value::Int64(1)));
}
