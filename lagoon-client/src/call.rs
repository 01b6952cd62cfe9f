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

//! Call builders
//!
//! Orchestrate one remote call end to end: auth headers, request envelope,
//! resilience coordinator, response interpretation, cache update.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use lagoon_core::{CacheKey, LagoonError, Result, Value};
use lagoon_telemetry::ConnectionQualityMonitor;

use crate::cache::{ReactiveCache, UpdateSource};
use crate::config::ClientConfig;
use crate::optimistic::OptimisticTransaction;
use crate::resilience::{BreakerState, CircuitBreaker, Coordinator};
use crate::subscription::SubscriptionFeed;
use crate::transport::{
    interpret_response, AuthProvider, RequestEnvelope, Transport, TransportRequest,
};

struct ClientInner {
    config: ClientConfig,
    cache: Arc<ReactiveCache>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    coordinator: Coordinator,
    monitor: Arc<ConnectionQualityMonitor>,
}

/// Client-side reactive data layer for one Lagoon deployment.
///
/// Owns the live cache, the resilience state, and the connection quality
/// monitor; the transport and auth provider are supplied by the embedding
/// application.
#[derive(Clone)]
pub struct LagoonClient {
    inner: Arc<ClientInner>,
}

impl LagoonClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));
        let mut coordinator = Coordinator::new(config.retry.clone(), breaker);
        if let Some(timeout) = config.attempt_timeout {
            coordinator = coordinator.with_attempt_timeout(timeout);
        }
        Self {
            inner: Arc::new(ClientInner {
                config,
                cache: Arc::new(ReactiveCache::new()),
                transport,
                auth,
                coordinator,
                monitor: Arc::new(ConnectionQualityMonitor::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ReactiveCache> {
        &self.inner.cache
    }

    pub fn quality_monitor(&self) -> &Arc<ConnectionQualityMonitor> {
        &self.inner.monitor
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.coordinator.breaker().state()
    }

    /// Intake for server-pushed subscription updates.
    pub fn subscription_feed(&self) -> SubscriptionFeed {
        SubscriptionFeed::new(self.inner.cache.clone(), self.inner.monitor.clone())
    }

    /// Start a speculative unit of work over the cache.
    pub fn begin_optimistic(&self) -> OptimisticTransaction {
        OptimisticTransaction::new(self.inner.cache.clone())
    }

    pub fn query(&self, path: impl Into<String>) -> QueryBuilder<'_> {
        QueryBuilder {
            client: self,
            path: path.into(),
            args: Value::empty_object(),
            deadline: None,
        }
    }

    pub fn mutation(&self, path: impl Into<String>) -> MutationBuilder<'_> {
        MutationBuilder {
            client: self,
            path: path.into(),
            args: Value::empty_object(),
            deadline: None,
            optimistic: None,
        }
    }

    pub fn action(&self, path: impl Into<String>) -> ActionBuilder<'_> {
        ActionBuilder {
            client: self,
            path: path.into(),
            args: Value::empty_object(),
            deadline: None,
        }
    }

    /// One remote call through the coordinator. Telemetry is recorded per
    /// attempt; auth headers are fetched fresh before every attempt.
    async fn perform(
        &self,
        endpoint: &str,
        path: &str,
        args: &Value,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Value> {
        let inner = &self.inner;
        let envelope = RequestEnvelope::new(path, args, inner.config.component_path.clone());
        let body =
            serde_json::to_string(&envelope).map_err(|e| LagoonError::MalformedWireValue {
                path: "$".into(),
                reason: format!("failed to encode request envelope: {e}"),
            })?;
        let url = format!(
            "{}/api/{}",
            inner.config.deployment_url.trim_end_matches('/'),
            endpoint
        );
        let request_id = Uuid::new_v4().to_string();
        debug!(%path, %request_id, endpoint, "remote call");

        let operation = || {
            let transport = inner.transport.clone();
            let auth = inner.auth.clone();
            let monitor = inner.monitor.clone();
            let cancel = cancel.clone();
            let url = url.clone();
            let body = body.clone();
            let request_id = request_id.clone();
            async move {
                let headers = auth.headers(&cancel).await?;
                let started = Instant::now();
                let sent = transport
                    .send(TransportRequest {
                        url,
                        headers,
                        body,
                        request_id,
                    })
                    .await;
                match &sent {
                    Ok(_) => {
                        monitor.record_latency(started.elapsed().as_secs_f64() * 1000.0);
                        monitor.record_message();
                    }
                    Err(_) => monitor.record_error(),
                }
                let response = sent?;
                interpret_response(&response).map_err(|err| {
                    if err.is_transient() {
                        monitor.record_error();
                    }
                    err
                })
            }
        };

        inner.coordinator.execute(cancel, deadline, operation).await
    }
}

/// Read a query result from the server and reflect it into the cache.
pub struct QueryBuilder<'a> {
    client: &'a LagoonClient,
    path: String,
    args: Value,
    deadline: Option<Instant>,
}

impl QueryBuilder<'_> {
    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Overall deadline across the whole retry sequence.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn call(self, cancel: &CancellationToken) -> Result<Value> {
        let value = self
            .client
            .perform("query", &self.path, &self.args, cancel, self.deadline)
            .await?;
        let key = CacheKey::new(&self.path, &self.args);
        self.client
            .inner
            .cache
            .set_and_notify(&key, value.clone(), UpdateSource::ServerQuery);
        Ok(value)
    }
}

/// Execute a mutation, with an optional optimistic phase.
pub struct MutationBuilder<'a> {
    client: &'a LagoonClient,
    path: String,
    args: Value,
    deadline: Option<Instant>,
    optimistic: Option<Box<dyn FnOnce(&OptimisticTransaction) + Send + 'a>>,
}

impl<'a> MutationBuilder<'a> {
    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Apply speculative cache writes before the remote call. Subscribers
    /// see them immediately; they are committed on success and rolled back
    /// before the error is returned on failure.
    pub fn optimistic(mut self, update: impl FnOnce(&OptimisticTransaction) + Send + 'a) -> Self {
        self.optimistic = Some(Box::new(update));
        self
    }

    /// Run the mutation.
    ///
    /// A rolled-back failure means the write definitely did not take effect
    /// locally; a [`LagoonError::Network`] failure can still mean the server
    /// applied the write and only the confirmation was lost. Callers that
    /// need certainty must re-query.
    pub async fn call(self, cancel: &CancellationToken) -> Result<Value> {
        let tx = self.optimistic.map(|update| {
            let tx = OptimisticTransaction::new(self.client.inner.cache.clone());
            update(&tx);
            tx
        });

        let outcome = self
            .client
            .perform("mutation", &self.path, &self.args, cancel, self.deadline)
            .await;

        match outcome {
            Ok(value) => {
                if let Some(tx) = &tx {
                    tx.commit();
                }
                Ok(value)
            }
            Err(err) => {
                // rollback completes before the caller sees the error
                if let Some(tx) = &tx {
                    tx.rollback();
                }
                Err(err)
            }
        }
    }
}

/// Execute a side-effecting action; never touches the cache.
pub struct ActionBuilder<'a> {
    client: &'a LagoonClient,
    path: String,
    args: Value,
    deadline: Option<Instant>,
}

impl ActionBuilder<'_> {
    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn call(self, cancel: &CancellationToken) -> Result<Value> {
        self.client
            .perform("action", &self.path, &self.args, cancel, self.deadline)
            .await
    }
}
