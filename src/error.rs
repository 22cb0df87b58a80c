//! Error types for the relay tunnel client.
//!
//! This module defines the error types that can occur while running a tunnel:
//!
//! - [`TunnelError`]: The main error type encompassing all possible errors
//! - [`Result<T>`]: A convenience type alias for `std::result::Result<T, TunnelError>`
//!
//! Most of these never reach the caller of [`TunnelClient::run()`](crate::TunnelClient::run).
//! They are delivered to [`TunnelEvents::on_error()`](crate::TunnelEvents::on_error)
//! instead, and the client keeps going.

use http::StatusCode;
use std::sync::Arc;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur when using the relay tunnel client.
///
/// This enum uses `Arc<str>` for string fields to make cloning cheap,
/// since errors are handed to the event sink and logged from several tasks.
///
/// # Stability
///
/// This enum is marked `#[non_exhaustive]`, meaning new variants may be added
/// in future versions without a breaking change. When matching on this enum,
/// always include a wildcard arm (`_`) to handle unknown variants.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TunnelError {
    /// Failed to connect to the relay.
    ///
    /// This can happen if:
    /// - The relay is unreachable
    /// - TLS handshake failed
    /// - WebSocket upgrade was rejected
    #[error("Connection failed: {0}")]
    ConnectionFailed(Arc<str>),

    /// WebSocket protocol error on the control channel.
    #[error("WebSocket error: {0}")]
    WebSocketError(Arc<str>),

    /// The relay refused the WebSocket upgrade with 401/403.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Arc<str>),

    /// The relay answered the upgrade request with an HTTP error status.
    #[error("Server error: {status} - {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Error message from server
        message: Arc<str>,
    },

    /// The relay sent an `error` frame on an open control channel.
    #[error("Relay error: {0}")]
    RelayError(Arc<str>),

    /// A frame received from the relay could not be understood.
    #[error("Tunnel protocol violation: {0}")]
    ProtocolError(Arc<str>),

    /// I/O error on a local socket.
    #[error("I/O error: {0}")]
    IoError(Arc<str>),

    /// A user supplied request handler failed.
    #[error("Request handler failed: {0}")]
    HandlerFailed(Arc<str>),

    /// The provided configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(Arc<str>),

    /// The control channel was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// Nothing was received from the relay within the liveness window.
    #[error("Operation timed out")]
    Timeout,

    /// The client has been closed and will not reconnect.
    #[error("Tunnel client is closed")]
    ClientClosed,
}

impl TunnelError {
    /// Returns `true` if another connection attempt may succeed.
    ///
    /// Non-transient errors are still retried by the supervisor, but they are
    /// logged at a higher level since they usually need operator attention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectionFailed(_)
                | TunnelError::WebSocketError(_)
                | TunnelError::Timeout
                | TunnelError::ConnectionClosed
                | TunnelError::ProtocolError(_)
                | TunnelError::RelayError(_)
                | TunnelError::IoError(_)
                | TunnelError::ServerError { .. }
        )
    }

    pub(crate) fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        TunnelError::IoError(Arc::from(format!("{}: {}", context, err)))
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::IoError(Arc::from(err.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match &err {
            WsError::Http(res) => {
                let status = res.status();
                if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
                    return TunnelError::AuthenticationFailed(err.to_string().into());
                }
                TunnelError::ServerError {
                    status: status.as_u16(),
                    message: err.to_string().into(),
                }
            }
            WsError::Io(_) | WsError::Tls(_) | WsError::Url(_) => {
                TunnelError::ConnectionFailed(Arc::from(err.to_string()))
            }
            WsError::ConnectionClosed | WsError::AlreadyClosed => TunnelError::ConnectionClosed,
            _ => TunnelError::WebSocketError(Arc::from(err.to_string())),
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::ProtocolError(Arc::from(err.to_string()))
    }
}

impl From<base64::DecodeError> for TunnelError {
    fn from(err: base64::DecodeError) -> Self {
        TunnelError::ProtocolError(Arc::from(format!("invalid base64 payload: {}", err)))
    }
}

impl From<http::uri::InvalidUri> for TunnelError {
    fn from(err: http::uri::InvalidUri) -> Self {
        TunnelError::ConfigError(Arc::from(err.to_string()))
    }
}
