//! Error and status code definitions for the RPC runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of status codes exposed to callers on both sides of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Status {
    /// Call completed successfully.
    Ok = 0,
    /// Unclassified failure, including handler panics.
    Unknown = 1,
    /// The caller cancelled its wait.
    Canceled = 2,
    /// The caller's deadline elapsed before a response arrived.
    DeadlineExceeded = 3,
    /// No node was available to serve the call.
    NodeUnavailable = 4,
    /// The node serving the call shut down while the call was pending.
    NodeShutdown = 5,
    /// The requested codec is not present in the codec registry.
    CodecNotRegistered = 6,
    /// The server is draining and no longer dispatches new requests.
    ServerClosed = 7,
    /// No action is registered under the requested (service, method).
    MethodNotFound = 8,
    /// An argument failed to decode into the declared parameter type.
    InvalidArgument = 9,
    /// The caller is not authorized for the requested action.
    Unauthorized = 10,
    /// Authentication handshake failed.
    LoginFailed = 11,
    /// The handler produced no result where one was required.
    NilResult = 12,
}

impl Status {
    /// Whether a call that failed with this status may be retried on
    /// another node (or the same node, under the fail-try policy).
    ///
    /// Only transport/availability failures are retryable. Application
    /// errors reached a handler and must never be replayed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Status::NodeUnavailable
                | Status::NodeShutdown
                | Status::CodecNotRegistered
                | Status::ServerClosed
        )
    }

    /// Maps a raw wire code back to a status, defaulting to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Status::Ok,
            2 => Status::Canceled,
            3 => Status::DeadlineExceeded,
            4 => Status::NodeUnavailable,
            5 => Status::NodeShutdown,
            6 => Status::CodecNotRegistered,
            7 => Status::ServerClosed,
            8 => Status::MethodNotFound,
            9 => Status::InvalidArgument,
            10 => Status::Unauthorized,
            11 => Status::LoginFailed,
            12 => Status::NilResult,
            _ => Status::Unknown,
        }
    }
}

/// Error payload carried inside a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedError {
    /// Numeric status code, see [`Status`].
    pub code: u32,
    /// Human-readable description of the failure.
    pub message: String,
}

/// Errors produced by the RPC runtime.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The caller cancelled its wait for the response.
    #[error("call canceled")]
    Canceled,

    /// The caller's deadline elapsed before the response arrived.
    #[error("call deadline exceeded")]
    DeadlineExceeded,

    /// The balancer had no node to hand out, or a dial failed.
    #[error("no node available{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    NodeUnavailable {
        /// Optional detail, e.g. the dial failure.
        detail: Option<String>,
    },

    /// The node shut down while the call was pending.
    #[error("node shut down")]
    NodeShutdown,

    /// The requested codec name has no entry in the codec registry.
    #[error("codec {name:?} is not registered")]
    CodecNotRegistered {
        /// The codec name that was looked up.
        name: String,
    },

    /// The server is draining and rejected the request.
    #[error("server is closed")]
    ServerClosed,

    /// `serve` was invoked on a server that is already serving.
    #[error("server is already serving")]
    AlreadyServing,

    /// No action is registered under (service, method).
    #[error("method {service}.{method} not found")]
    MethodNotFound {
        /// Requested service name.
        service: String,
        /// Requested method name.
        method: String,
    },

    /// An argument failed to decode into the declared parameter type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller is not authorized for the requested action.
    #[error("unauthorized")]
    Unauthorized,

    /// Authentication handshake failed.
    #[error("login failed")]
    LoginFailed,

    /// The handler produced no result where one was required.
    #[error("nil result")]
    NilResult,

    /// The handler returned an application-level error.
    #[error("{0}")]
    Handler(String),

    /// A frame failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// An error received from the remote peer, reconstructed from its
    /// wire code.
    #[error("{message}")]
    Remote {
        /// Status reconstructed from the wire code.
        status: Status,
        /// Message sent by the peer.
        message: String,
    },

    /// Transport-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Convenience constructor for a dial/availability failure.
    pub fn unavailable(detail: impl Into<String>) -> Self {
        RpcError::NodeUnavailable {
            detail: Some(detail.into()),
        }
    }

    /// The status code this error maps to.
    pub fn status(&self) -> Status {
        match self {
            RpcError::Canceled => Status::Canceled,
            RpcError::DeadlineExceeded => Status::DeadlineExceeded,
            RpcError::NodeUnavailable { .. } => Status::NodeUnavailable,
            RpcError::NodeShutdown => Status::NodeShutdown,
            RpcError::CodecNotRegistered { .. } => Status::CodecNotRegistered,
            RpcError::ServerClosed => Status::ServerClosed,
            RpcError::AlreadyServing => Status::Unknown,
            RpcError::MethodNotFound { .. } => Status::MethodNotFound,
            RpcError::InvalidArgument(_) => Status::InvalidArgument,
            RpcError::Unauthorized => Status::Unauthorized,
            RpcError::LoginFailed => Status::LoginFailed,
            RpcError::NilResult => Status::NilResult,
            RpcError::Handler(_) => Status::Unknown,
            RpcError::Codec(_) => Status::Unknown,
            RpcError::Remote { status, .. } => *status,
            // A broken connection surfaces as the node having gone away.
            RpcError::Io(_) => Status::NodeShutdown,
        }
    }

    /// Whether a call failing with this error may be retried per the
    /// client's fail mode.
    pub fn retryable(&self) -> bool {
        self.status().retryable()
    }

    /// Serializes this error into the wire representation.
    pub fn to_coded(&self) -> CodedError {
        CodedError {
            code: self.status() as u32,
            message: self.to_string(),
        }
    }
}

impl From<CodedError> for RpcError {
    fn from(coded: CodedError) -> Self {
        RpcError::Remote {
            status: Status::from_code(coded.code),
            message: coded.message,
        }
    }
}

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, RpcError>;
