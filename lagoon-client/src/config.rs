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

//! Client configuration

use std::time::Duration;

use crate::resilience::{CircuitConfig, RetryPolicy};

/// Tuning for one [`crate::LagoonClient`] instance.
///
/// There is no process-wide registry; every client carries its own config,
/// cache, and breaker.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the deployment, e.g. `https://acme.lagoon.dev`
    pub deployment_url: String,
    /// Scopes every call to a sub-deployment when set
    pub component_path: Option<String>,
    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
    /// Time budget per attempt; retries each get a fresh budget
    pub attempt_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn for_deployment(url: impl Into<String>) -> Self {
        Self {
            deployment_url: url.into(),
            component_path: None,
            retry: RetryPolicy::exponential(),
            circuit: CircuitConfig::default(),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_component_path(mut self, path: impl Into<String>) -> Self {
        self.component_path = Some(path.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::for_deployment("http://127.0.0.1:8187")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_deployment_defaults() {
        let config = ClientConfig::for_deployment("https://acme.lagoon.dev");
        assert_eq!(config.deployment_url, "https://acme.lagoon.dev");
        assert_eq!(config.component_path, None);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit.failure_threshold, 5);
    }

    #[test]
    fn test_builder_style_overrides() {
        let config = ClientConfig::default()
            .with_component_path("chat")
            .with_retry(RetryPolicy::none());
        assert_eq!(config.component_path.as_deref(), Some("chat"));
        assert_eq!(config.retry.max_attempts, 1);
    }
}
