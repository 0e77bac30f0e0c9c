//! Errors surfaced to request callers.
//!
//! Transport and protocol failures are handled inside the engine (see
//! [`crate::channel::TransportError`] and [`crate::codec::DecodeError`]); the
//! types here are the only ones an application callback ever receives.

use crate::message::Message;

/// A request could not be handed to the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// No connected channel, or the session is not authenticated yet.
    #[error("connection not ready")]
    NotReady,
    /// The channel's outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The engine or client has been disposed.
    #[error("engine disposed")]
    Disposed,
    /// The channel's send loop has exited.
    #[error("channel closed")]
    ChannelClosed,
    /// The message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Final outcome delivered to a request callback on failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// The server answered with a non-retryable error code, or retries ran out.
    #[error("server returned error code {code}")]
    Application {
        /// Server error code.
        code: String,
        /// The full error response.
        response: Message,
    },
    /// The engine rejected the request locally.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Every transport was exhausted while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,
    /// No response arrived within the request timeout.
    #[error("request timed out")]
    Timeout,
    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The engine was disposed while the request was outstanding.
    #[error("engine disposed")]
    Disposed,
}

impl RequestError {
    /// Server error code, if this is an application error.
    pub fn code(&self) -> Option<&str> {
        match self {
            RequestError::Application { code, .. } => Some(code),
            _ => None,
        }
    }
}
