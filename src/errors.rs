//! OCPP-J error taxonomy — the fixed vocabulary carried in CALLERROR frames,
//! plus the handful of local-only conditions (timeout, queue-full, transport
//! closed) that never cross the wire as-is but still need a stable
//! discriminant for logging and metrics.

use thiserror::Error;

/// The 13 wire error codes defined by OCPP-J, plus two framework-local
/// additions (`RpcFrameworkError`, `OccurrenceConstraintViolation`'s
/// retired-spelling alias is intentionally not carried — only the current
/// spelling is emitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcppErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    FormatViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    MessageTypeNotSupported,
    RpcFrameworkError,
    Timeout,
}

impl OcppErrorCode {
    /// Parse a CALLERROR frame's `errorCode` string back into a typed
    /// variant. Unrecognized strings (a peer using a future or
    /// vendor-specific code) map to `GenericError` rather than failing —
    /// the frame itself is still well-formed.
    pub fn from_wire_str(s: &str) -> Self {
        match s {
            "NotImplemented" => OcppErrorCode::NotImplemented,
            "NotSupported" => OcppErrorCode::NotSupported,
            "InternalError" => OcppErrorCode::InternalError,
            "ProtocolError" => OcppErrorCode::ProtocolError,
            "SecurityError" => OcppErrorCode::SecurityError,
            "FormationViolation" => OcppErrorCode::FormationViolation,
            "FormatViolation" => OcppErrorCode::FormatViolation,
            "PropertyConstraintViolation" => OcppErrorCode::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => OcppErrorCode::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => OcppErrorCode::TypeConstraintViolation,
            "MessageTypeNotSupported" => OcppErrorCode::MessageTypeNotSupported,
            "RpcFrameworkError" => OcppErrorCode::RpcFrameworkError,
            "Timeout" => OcppErrorCode::Timeout,
            _ => OcppErrorCode::GenericError,
        }
    }

    /// The literal string written into a CALLERROR frame's `errorCode` field.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            OcppErrorCode::NotImplemented => "NotImplemented",
            OcppErrorCode::NotSupported => "NotSupported",
            OcppErrorCode::InternalError => "InternalError",
            OcppErrorCode::ProtocolError => "ProtocolError",
            OcppErrorCode::SecurityError => "SecurityError",
            OcppErrorCode::FormationViolation => "FormationViolation",
            OcppErrorCode::FormatViolation => "FormatViolation",
            OcppErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            OcppErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            OcppErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            OcppErrorCode::GenericError => "GenericError",
            OcppErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            OcppErrorCode::RpcFrameworkError => "RpcFrameworkError",
            OcppErrorCode::Timeout => "Timeout",
        }
    }
}

/// A typed CALLERROR payload — `code` crosses the wire, `description` and
/// `details` are caller-supplied and may be redacted before transmission
/// when `respondWithDetailedErrors` is off.
#[derive(Debug, Error, Clone)]
#[error("{code:?}: {description}")]
pub struct OcppError {
    pub code: OcppErrorCode,
    pub description: String,
    pub details: serde_json::Value,
}

impl OcppError {
    pub fn new(code: OcppErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::InternalError, description)
    }

    pub fn protocol(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::ProtocolError, description)
    }

    pub fn not_implemented(method: &str) -> Self {
        Self::new(
            OcppErrorCode::NotImplemented,
            format!("no handler registered for method '{method}'"),
        )
    }

    pub fn timeout(call_id: &str) -> Self {
        Self::new(
            OcppErrorCode::Timeout,
            format!("call '{call_id}' timed out waiting for a response"),
        )
    }
}

/// Local-only failures that never reach the wire but need to propagate out
/// of `call()` to the caller — mirrors how this codebase keeps a small,
/// typed error enum at API boundaries and an `anyhow` chain everywhere else.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("transport closed before a response arrived")]
    Disconnected,
    #[error("outbound call queue is full ({0} pending)")]
    QueueFull(usize),
    #[error("received a malformed response: {0}")]
    UnexpectedResponse(String),
    #[error("call cancelled by caller-supplied signal")]
    Cancelled,
    #[error(transparent)]
    Remote(#[from] OcppError),
}
