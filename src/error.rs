//! Transport error types.

use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by the transport.
///
/// Errors tied to a specific `send` reject that call and are also reported
/// through the `on_error` callback; errors from streams and reconnects flow
/// only through `on_error`. The enum is `Clone` so one failure can travel
/// both paths.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Non-2xx HTTP response with no protocol-level meaning
    #[error("{context} (HTTP {status}): {status_text}")]
    Http {
        /// Response status code
        status: u16,
        /// Reason phrase reported by the server, empty if none
        status_text: String,
        /// What the transport was doing when the status arrived
        context: String,
        /// Response body, when one was readable
        body: Option<String>,
    },

    /// 401 that the auth provider could not resolve silently; the caller
    /// must complete user-interactive authorization and retry
    #[error("unauthorized: user interaction required to obtain credentials")]
    Unauthorized,

    /// 200 response whose media type is neither JSON nor an event stream
    #[error("unexpected content type: {0}")]
    UnexpectedContentType(String),

    /// An SSE `data:` payload failed JSON-RPC parsing; the event is dropped
    /// and the stream continues
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation issued after `close()`, or in flight when `close()` ran
    #[error("connection closed")]
    ConnectionClosed,

    /// The resumption manager hit `max_retries`; the stream is abandoned
    #[error("event stream reconnection gave up after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// `start()` called on a transport that is already started
    #[error("transport already started")]
    AlreadyStarted,

    /// Request-level I/O failure from the HTTP performer
    #[error("network error: {0}")]
    Network(String),

    /// Outbound message could not be serialized
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Caller-supplied header name or value is not valid HTTP
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// OAuth flow failure other than a required user redirect
    #[error("authorization failed: {0}")]
    Auth(String),
}

impl TransportError {
    /// Build an [`TransportError::Http`] from response parts.
    pub fn http(
        context: impl Into<String>,
        status: u16,
        status_text: impl Into<String>,
        body: Option<String>,
    ) -> Self {
        Self::Http {
            status,
            status_text: status_text.into(),
            context: context.into(),
            body,
        }
    }

    /// Status code for HTTP errors, `None` otherwise.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_display_includes_verb_context() {
        let err = TransportError::http("Error POSTing to endpoint", 500, "Internal Server Error", None);
        assert!(err.to_string().contains("Error POSTing to endpoint (HTTP 500)"));
    }

    #[test]
    fn status_accessor() {
        let err = TransportError::http("Error POSTing to endpoint", 404, "Not Found", None);
        assert_eq!(err.status(), Some(404));
        assert_eq!(TransportError::Unauthorized.status(), None);
    }
}
