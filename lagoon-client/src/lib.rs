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

//! Lagoon Client
//!
//! Reactive data layer for a hosted Lagoon deployment: a live local cache of
//! query results with subscriber fan-out, optimistic local mutations with
//! rollback, and retry/circuit-breaker resilience around every remote call.
//!
//! The transport itself is a collaborator supplied by the embedding
//! application through the [`transport::Transport`] trait; this crate only
//! produces request envelopes and interprets response envelopes.

pub mod cache;
pub mod call;
pub mod config;
pub mod optimistic;
pub mod resilience;
pub mod subscription;
pub mod transport;

pub use cache::{CacheEntry, ReactiveCache, SubscriberToken, UpdateSource};
pub use call::{ActionBuilder, LagoonClient, MutationBuilder, QueryBuilder};
pub use config::ClientConfig;
pub use optimistic::OptimisticTransaction;
pub use resilience::{
    Backoff, BreakerState, CircuitBreaker, CircuitConfig, Coordinator, RetryPolicy,
};
pub use subscription::{ServerPush, SubscriptionFeed};
pub use transport::{
    AuthProvider, NoAuth, RequestEnvelope, StaticTokenProvider, Transport, TransportRequest,
    TransportResponse,
};

pub use lagoon_core::{CacheKey, LagoonError, Result, Value};
