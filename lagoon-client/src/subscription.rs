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

//! Subscription intake
//!
//! The push side of the protocol: the server sends `{ key, value }` frames
//! and the feed reflects each one into the cache with source
//! [`UpdateSource::ServerSubscription`], in arrival order.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::trace;

use lagoon_core::{wire, CacheKey, LagoonError, Result, Value};
use lagoon_telemetry::ConnectionQualityMonitor;

use crate::cache::{ReactiveCache, UpdateSource};

/// One server-pushed update.
#[derive(Debug, Clone)]
pub struct ServerPush {
    pub key: CacheKey,
    pub value: Value,
}

impl ServerPush {
    /// Parse a raw push frame: `{"key": "<canonical key>", "value": <wire>}`.
    pub fn from_frame(frame: &str) -> Result<ServerPush> {
        let json: serde_json::Value =
            serde_json::from_str(frame).map_err(|e| LagoonError::MalformedWireValue {
                path: "$".into(),
                reason: format!("invalid push frame: {e}"),
            })?;
        let key = json
            .get("key")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| LagoonError::MalformedWireValue {
                path: "$.key".into(),
                reason: "push frame missing string \"key\"".into(),
            })?;
        let value = json
            .get("value")
            .ok_or_else(|| LagoonError::MalformedWireValue {
                path: "$.value".into(),
                reason: "push frame missing \"value\"".into(),
            })?;
        Ok(ServerPush {
            key: CacheKey::from_raw(key),
            value: wire::decode_json(value)?,
        })
    }
}

/// Applies server pushes to the cache and feeds the quality monitor.
pub struct SubscriptionFeed {
    cache: Arc<ReactiveCache>,
    monitor: Arc<ConnectionQualityMonitor>,
}

impl SubscriptionFeed {
    pub fn new(cache: Arc<ReactiveCache>, monitor: Arc<ConnectionQualityMonitor>) -> Self {
        Self { cache, monitor }
    }

    /// Reflect one push into the cache.
    pub fn apply(&self, push: ServerPush) {
        trace!(key = %push.key, "subscription push");
        self.monitor.record_message();
        self.cache
            .set_and_notify(&push.key, push.value, UpdateSource::ServerSubscription);
    }

    /// Drain a stream of pushes in arrival order.
    pub async fn pump<S>(&self, mut pushes: S)
    where
        S: Stream<Item = ServerPush> + Unpin,
    {
        while let Some(push) = pushes.next().await {
            self.apply(push);
        }
    }
}
