//! Error types for the Tessera bridge.
//!
//! Every error that can reach a caller maps onto one [`ErrorKind`], and the
//! kinds that cross the process boundary are carried as an [`ErrorDescriptor`]
//! holding only a kind, a message and an optional numeric code.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification shared by both sides of the bridge.
///
/// Serialized with the exact names the renderer code matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "UnknownChannelError")]
    UnknownChannel,
    #[serde(rename = "DuplicateChannelError")]
    DuplicateChannel,
    #[serde(rename = "HandlerError")]
    Handler,
    #[serde(rename = "SerializationError")]
    Serialization,
    #[serde(rename = "TransportError")]
    Transport,
    #[serde(rename = "TimeoutError")]
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownChannel => "UnknownChannelError",
            ErrorKind::DuplicateChannel => "DuplicateChannelError",
            ErrorKind::Handler => "HandlerError",
            ErrorKind::Serialization => "SerializationError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::Timeout => "TimeoutError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized error as it travels inside a failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// Main error type for bridge operations.
///
/// `Clone` because a single failed fetch is fanned out to every cache
/// subscriber of the key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("{message}")]
    UnknownChannel { message: String },

    #[error("{message}")]
    DuplicateChannel { message: String },

    /// A handler returned an error or panicked.
    #[error("{message}")]
    Handler { message: String, code: Option<i32> },

    #[error("{message}")]
    Serialization { message: String },

    #[error("{message}")]
    Transport { message: String },

    #[error("{message}")]
    Timeout { message: String },

    /// Rejected before anything was sent: the name can never be bound.
    #[error("Invalid channel name {channel:?}: {reason}")]
    InvalidChannel { channel: String, reason: String },
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport {
            message: err.to_string(),
        }
    }
}

impl BridgeError {
    pub fn unknown_channel(channel: &str) -> Self {
        BridgeError::UnknownChannel {
            message: format!("No handler registered for channel '{}'", channel),
        }
    }

    pub fn duplicate_channel(channel: &str) -> Self {
        BridgeError::DuplicateChannel {
            message: format!("Channel '{}' already has a handler", channel),
        }
    }

    /// Build a handler failure carrying an application-defined code.
    pub fn handler(message: impl Into<String>, code: Option<i32>) -> Self {
        BridgeError::Handler {
            message: message.into(),
            code,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        BridgeError::Serialization {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        BridgeError::Transport {
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        BridgeError::Timeout {
            message: format!("Request timed out after {:?}", after),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            // An invalid name can never be bound, so it surfaces as unknown.
            BridgeError::UnknownChannel { .. } | BridgeError::InvalidChannel { .. } => {
                ErrorKind::UnknownChannel
            }
            BridgeError::DuplicateChannel { .. } => ErrorKind::DuplicateChannel,
            BridgeError::Handler { .. } => ErrorKind::Handler,
            BridgeError::Serialization { .. } => ErrorKind::Serialization,
            BridgeError::Transport { .. } => ErrorKind::Transport,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Convert to a JSON-RPC style error code.
    ///
    /// - -32601: Unknown channel
    /// - -32602: Serialization (arguments or result could not cross)
    /// - -32603: Handler error without an application code
    /// - -32000: Transport
    /// - -32001: Timeout
    /// - -32010: Duplicate channel
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BridgeError::UnknownChannel { .. } | BridgeError::InvalidChannel { .. } => -32601,
            BridgeError::Serialization { .. } => -32602,
            BridgeError::Handler { code, .. } => code.unwrap_or(-32603),
            BridgeError::Transport { .. } => -32000,
            BridgeError::Timeout { .. } => -32001,
            BridgeError::DuplicateChannel { .. } => -32010,
        }
    }

    /// Check if the cache should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Handler { .. } | BridgeError::Transport { .. } | BridgeError::Timeout { .. }
        )
    }

    /// Wire form of this error.
    ///
    /// `code` is present only when a handler set one; receivers fall back to
    /// [`to_rpc_error_code`](Self::to_rpc_error_code) for the default.
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        let code = match self {
            BridgeError::Handler { code, .. } => *code,
            _ => None,
        };
        ErrorDescriptor {
            kind: self.kind(),
            message: self.to_string(),
            code,
        }
    }

    pub fn from_descriptor(descriptor: ErrorDescriptor) -> Self {
        let ErrorDescriptor {
            kind,
            message,
            code,
        } = descriptor;
        match kind {
            ErrorKind::UnknownChannel => BridgeError::UnknownChannel { message },
            ErrorKind::DuplicateChannel => BridgeError::DuplicateChannel { message },
            ErrorKind::Handler => BridgeError::Handler { message, code },
            ErrorKind::Serialization => BridgeError::Serialization { message },
            ErrorKind::Transport => BridgeError::Transport { message },
            ErrorKind::Timeout => BridgeError::Timeout { message },
        }
    }

    /// Normalize an error returned by a channel handler.
    ///
    /// A `BridgeError` raised inside the handler keeps its kind and code.
    /// Anything else becomes a `Handler` error holding only the outermost
    /// message, never the source chain or a backtrace.
    pub fn from_handler_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<BridgeError>() {
            Some(bridge) => bridge.clone(),
            None => BridgeError::Handler {
                message: err.to_string(),
                code: None,
            },
        }
    }
}
