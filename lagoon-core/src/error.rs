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

//! Client error taxonomy
//!
//! Every failure the data layer can surface, partitioned into transient
//! errors (retried, counted by the circuit breaker) and permanent ones
//! (propagated immediately).

use std::time::Duration;

use thiserror::Error;

use crate::value::Value;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, LagoonError>;

/// Errors surfaced by the Lagoon client data layer
#[derive(Debug, Clone, Error)]
pub enum LagoonError {
    /// A tagged wire value could not be decoded. Fatal to the single call,
    /// never retried.
    #[error("malformed wire value at {path}: {reason}")]
    MalformedWireValue { path: String, reason: String },

    /// The remote function itself raised an application-level error
    #[error("function error: {message}")]
    Function {
        message: String,
        /// Application payload attached to the error, if the function
        /// supplied one
        data: Option<Value>,
    },

    /// The server rejected the call's arguments
    #[error("invalid argument: {message}")]
    Argument { message: String },

    /// Authentication was refused
    #[error("authentication refused: {message}")]
    Auth { message: String },

    /// The request failed at the transport level
    #[error("network error: {message}")]
    Network { message: String },

    /// A single attempt exceeded its time budget
    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The circuit breaker rejected the call without attempting it
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// The caller's cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,
}

impl LagoonError {
    /// Whether this failure is likely to succeed on retry.
    ///
    /// Only transient failures are retried and counted toward the circuit
    /// breaker; everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LagoonError::Network { .. } | LagoonError::Timeout { .. }
        )
    }

    /// Prefix the field path of a `MalformedWireValue` with one more
    /// segment as decoding unwinds. No-op for other variants.
    pub(crate) fn prepend_path(self, segment: &str) -> Self {
        match self {
            LagoonError::MalformedWireValue { path, reason } => {
                LagoonError::MalformedWireValue {
                    path: format!("{segment}{path}"),
                    reason,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LagoonError::Network {
            message: "connection reset".into()
        }
        .is_transient());
        assert!(LagoonError::Timeout {
            elapsed: Duration::from_secs(5)
        }
        .is_transient());

        assert!(!LagoonError::Function {
            message: "room full".into(),
            data: None
        }
        .is_transient());
        assert!(!LagoonError::Argument {
            message: "bad id".into()
        }
        .is_transient());
        assert!(!LagoonError::Auth {
            message: "expired".into()
        }
        .is_transient());
        assert!(!LagoonError::Cancelled.is_transient());
        assert!(!LagoonError::CircuitOpen {
            retry_after: Duration::from_secs(30)
        }
        .is_transient());
        assert!(!LagoonError::MalformedWireValue {
            path: "$.x".into(),
            reason: "bad base64".into()
        }
        .is_transient());
    }
}
