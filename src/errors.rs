//! Error types for the lifecycle manager and its RPC surface.
//!
//! [`ManagerError`] is what `Manager::start` and `Manager::stop` return.
//! [`RpcError`] is shared by the RPC transport, the RPC client and the HTTP
//! gateway: it implements [`axum::response::IntoResponse`] so handlers can
//! return it directly, and the client decodes the same JSON body back into
//! an `RpcError` on the other side of the wire.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manager::{LifecycleState, Subsystem};

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

// -- Configuration ------------------------------------------------------------

/// Node metadata did not carry a usable listen address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required metadata key is absent.
    #[error("node metadata is missing required key `{key}`")]
    MissingKey { key: &'static str },

    /// A required metadata key holds something other than a string.
    #[error("node metadata key `{key}` must be a string, found {found}")]
    NotAString {
        key: &'static str,
        found: &'static str,
    },

    /// A required metadata key holds an empty string.
    #[error("node metadata key `{key}` must not be empty")]
    EmptyValue { key: &'static str },
}

// -- Lifecycle ----------------------------------------------------------------

/// A subsystem operation that failed, paired with the subsystem it belongs to.
#[derive(Debug)]
pub struct SubsystemFailure {
    pub subsystem: Subsystem,
    pub error: anyhow::Error,
}

impl fmt::Display for SubsystemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.subsystem, self.error)
    }
}

/// Every teardown failure observed by a single `Manager::stop` call, in
/// teardown order.
#[derive(Debug, Error)]
#[error("{}", summarize(.failures))]
pub struct StopError {
    pub failures: Vec<SubsystemFailure>,
}

impl StopError {
    /// Subsystems that failed, in the order they were torn down.
    pub fn subsystems(&self) -> Vec<Subsystem> {
        self.failures.iter().map(|f| f.subsystem).collect()
    }
}

fn summarize(failures: &[SubsystemFailure]) -> String {
    let details = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} subsystem(s) failed to stop: {details}", failures.len())
}

/// Errors returned by the lifecycle manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The node metadata is unusable; nothing was constructed.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A subsystem could not be created; later subsystems were not created.
    #[error("failed to create {subsystem}: {source:#}")]
    Construct {
        subsystem: Subsystem,
        #[source]
        source: anyhow::Error,
    },

    /// A synchronously started subsystem failed to start.
    #[error("failed to start {subsystem}: {source:#}")]
    Start {
        subsystem: Subsystem,
        #[source]
        source: anyhow::Error,
    },

    /// A synchronously started subsystem did not report ready in time.
    #[error("{subsystem} did not start within {timeout:?}")]
    StartTimeout {
        subsystem: Subsystem,
        timeout: Duration,
    },

    /// The requested operation is not valid in the current lifecycle state.
    #[error("cannot {operation} a manager that is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// One or more subsystems failed during teardown.
    #[error(transparent)]
    Stop(#[from] StopError),
}

// -- RPC ----------------------------------------------------------------------

/// JSON error body exchanged between the RPC transport, the RPC client and
/// the HTTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub request_id: String,
}

/// Errors produced while serving or calling cluster RPCs.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The requested node or state key does not exist.
    #[error("{message}")]
    NotFound { message: String },

    /// The request was malformed (empty id, empty key, bad body).
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The callee cannot serve requests right now.
    #[error("{message}")]
    Unavailable { message: String },

    /// The call did not complete before its deadline.
    #[error("request timed out")]
    Timeout,

    /// The remote endpoint could not be reached or answered garbage.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Catch-all for unexpected failures on the serving side.
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl RpcError {
    pub fn not_found(message: impl Into<String>) -> Self {
        RpcError::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        RpcError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        RpcError::Unavailable {
            message: message.into(),
        }
    }

    /// Stable error code carried in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::NotFound { .. } => "NotFound",
            RpcError::InvalidArgument { .. } => "InvalidArgument",
            RpcError::Unavailable { .. } => "Unavailable",
            RpcError::Timeout => "Timeout",
            RpcError::Transport { .. } => "Transport",
            RpcError::Internal(_) => "Internal",
        }
    }

    /// HTTP status used when this error is rendered as a response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcError::NotFound { .. } => StatusCode::NOT_FOUND,
            RpcError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            RpcError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RpcError::Transport { .. } => StatusCode::BAD_GATEWAY,
            RpcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the JSON body, without the variant prefix.
    fn body_message(&self) -> String {
        match self {
            RpcError::Transport { message } => message.clone(),
            RpcError::Internal(err) => format!("{err:#}"),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a decoded response body.
    ///
    /// Unknown codes fall back to the HTTP status of the response.
    pub fn from_body(status: StatusCode, body: ErrorBody) -> Self {
        let ErrorBody { code, message, .. } = body;
        match code.as_str() {
            "NotFound" => RpcError::NotFound { message },
            "InvalidArgument" => RpcError::InvalidArgument { message },
            "Unavailable" => RpcError::Unavailable { message },
            "Timeout" => RpcError::Timeout,
            "Transport" => RpcError::Transport { message },
            "Internal" => RpcError::Internal(anyhow::anyhow!(message)),
            _ => match status {
                StatusCode::NOT_FOUND => RpcError::NotFound { message },
                StatusCode::BAD_REQUEST => RpcError::InvalidArgument { message },
                StatusCode::SERVICE_UNAVAILABLE => RpcError::Unavailable { message },
                StatusCode::GATEWAY_TIMEOUT => RpcError::Timeout,
                _ => RpcError::Internal(anyhow::anyhow!("{status}: {message}")),
            },
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.body_message(),
            request_id: generate_request_id(),
        };
        (status, Json(body)).into_response()
    }
}
