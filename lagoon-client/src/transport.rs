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

//! Transport and auth boundary
//!
//! The HTTP layer itself lives in the embedding application; this module
//! defines the request/response envelopes the core produces and consumes,
//! and how response status codes map onto the error taxonomy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use lagoon_core::{wire, LagoonError, Result, Value};

/// Status code the server uses for a valid response whose payload is an
/// application-level error. Parsed like a success response, never raised as
/// a network failure.
pub const APPLICATION_ERROR_STATUS: u16 = 560;

/// JSON body sent for every remote call.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope {
    /// Function identifier, e.g. `"rooms:get"`
    pub path: String,
    /// Always `"encoded_json"`; names the argument encoding
    pub format: String,
    /// Single wire-encoded argument object
    pub args: Vec<serde_json::Value>,
    /// Scopes the call to a sub-deployment
    #[serde(rename = "componentPath", skip_serializing_if = "Option::is_none")]
    pub component_path: Option<String>,
}

impl RequestEnvelope {
    pub fn new(path: &str, args: &Value, component_path: Option<String>) -> Self {
        Self {
            path: path.to_owned(),
            format: "encoded_json".to_owned(),
            args: vec![wire::encode_json(args)],
            component_path,
        }
    }
}

/// One request handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Absolute endpoint URL
    pub url: String,
    /// Auth headers from the provider plus anything the caller added
    pub headers: Vec<(String, String)>,
    /// Serialized [`RequestEnvelope`]
    pub body: String,
    /// Correlates traces across retries of the same logical call
    pub request_id: String,
}

/// What the transport delivered back.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Request/response transport supplied by the embedding application.
///
/// Implementations report connection-level failures as
/// [`LagoonError::Network`]; everything that produced an HTTP status is a
/// response, including [`APPLICATION_ERROR_STATUS`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// Supplies auth headers for each request. Called before every send; token
/// caching and expiry are the provider's responsibility, never the core's.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn headers(&self, cancel: &CancellationToken) -> Result<Vec<(String, String)>>;
}

/// No authentication.
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn headers(&self, _cancel: &CancellationToken) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

/// Fixed bearer token, for deploy keys and tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn headers(&self, _cancel: &CancellationToken) -> Result<Vec<(String, String)>> {
        Ok(vec![(
            "Authorization".to_owned(),
            format!("Bearer {}", self.token),
        )])
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    status: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
    #[serde(default, rename = "errorData")]
    error_data: Option<serde_json::Value>,
    #[serde(default, rename = "errorKind")]
    error_kind: Option<String>,
}

/// Map a transport response onto a decoded value or a classified error.
pub fn interpret_response(response: &TransportResponse) -> Result<Value> {
    match response.status {
        status if (200..300).contains(&status) || status == APPLICATION_ERROR_STATUS => {
            parse_envelope(&response.body)
        }
        400 => Err(LagoonError::Argument {
            message: body_or(&response.body, "bad request"),
        }),
        401 | 403 => Err(LagoonError::Auth {
            message: body_or(&response.body, "authentication refused"),
        }),
        status => Err(LagoonError::Network {
            message: format!("http status {status}"),
        }),
    }
}

fn parse_envelope(body: &str) -> Result<Value> {
    let envelope: ResponseEnvelope =
        serde_json::from_str(body).map_err(|e| LagoonError::MalformedWireValue {
            path: "$".into(),
            reason: format!("invalid response envelope: {e}"),
        })?;
    match envelope.status.as_str() {
        "success" => {
            let value = envelope.value.unwrap_or(serde_json::Value::Null);
            wire::decode_json(&value)
        }
        "error" => {
            let message = envelope
                .error_message
                .unwrap_or_else(|| "unspecified error".to_owned());
            let data = match envelope.error_data {
                Some(json) => Some(wire::decode_json(&json)?),
                None => None,
            };
            Err(classify_error(
                envelope.error_kind.as_deref(),
                message,
                data,
            ))
        }
        other => Err(LagoonError::MalformedWireValue {
            path: "$.status".into(),
            reason: format!("unknown response status {other:?}"),
        }),
    }
}

/// Server-declared error kinds feed the transient/non-transient decision.
/// Absent or unrecognized kinds are treated as function errors.
fn classify_error(kind: Option<&str>, message: String, data: Option<Value>) -> LagoonError {
    match kind {
        Some("ArgumentError") => LagoonError::Argument { message },
        Some("AuthError") => LagoonError::Auth { message },
        Some("NetworkError") => LagoonError::Network { message },
        _ => LagoonError::Function { message, data },
    }
}

fn body_or(body: &str, fallback: &str) -> String {
    if body.trim().is_empty() {
        fallback.to_owned()
    } else {
        body.trim().to_owned()
    }
}
