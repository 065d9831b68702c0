//! Per-request header composition.
//!
//! Headers are composed fresh for every outbound request so that caller
//! mutations of the [`RequestInit`] template between sends are always
//! picked up. Merge order, later wins: default Accept pair, caller headers,
//! Authorization, `mcp-session-id`, `Last-Event-ID`, `Content-Type`.

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::error::{TransportError, TransportResult};

/// Session identifier header, echoed on every request once captured.
pub const MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");

/// Resumption token header for reconnecting GET requests.
pub const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// Accept value advertising both inline JSON and SSE responses.
pub(crate) const ACCEPT_STREAMABLE: &str = "application/json, text/event-stream";

/// Shared per-request options template.
///
/// Clones share the same underlying header map: a header set through any
/// clone is visible on the next request the transport issues. The transport
/// itself never mutates the template.
#[derive(Clone, Debug, Default)]
pub struct RequestInit {
    headers: Arc<RwLock<HeaderMap>>,
}

impl RequestInit {
    /// Create an empty template.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value for the same
    /// (case-insensitive) name.
    pub fn set_header(&self, name: &str, value: &str) -> TransportResult<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
        self.headers.write().insert(name, value);
        Ok(())
    }

    /// Append an additional value for a header without removing existing ones.
    pub fn append_header(&self, name: &str, value: &str) -> TransportResult<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
        self.headers.write().append(name, value);
        Ok(())
    }

    /// Remove a header from the template.
    pub fn remove_header(&self, name: &str) {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            self.headers.write().remove(name);
        }
    }

    /// Current contents of the template.
    pub fn snapshot(&self) -> HeaderMap {
        self.headers.read().clone()
    }
}

/// Transport-controlled header inputs for one request.
#[derive(Debug, Default)]
pub(crate) struct HeaderContext<'a> {
    /// Advertise `application/json, text/event-stream` (POST and GET)
    pub accept: bool,
    /// Attach `Content-Type: application/json` (POST)
    pub json_body: bool,
    /// Bearer token from the auth provider
    pub auth_token: Option<&'a str>,
    /// Captured session identifier
    pub session_id: Option<&'a str>,
    /// Resumption token for reconnecting GETs
    pub last_event_id: Option<&'a str>,
}

/// Compose the full header set for one outbound request.
pub(crate) fn compose_headers(
    init: &RequestInit,
    ctx: HeaderContext<'_>,
) -> TransportResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    if ctx.accept {
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_STREAMABLE));
    }

    // Caller headers override the defaults; HeaderMap::extend replaces the
    // existing entry on a key's first occurrence and appends after that,
    // which preserves caller-side multi-valued headers.
    headers.extend(init.snapshot());

    if let Some(token) = ctx.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::InvalidHeader(format!("authorization: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }

    if let Some(session_id) = ctx.session_id {
        let value = HeaderValue::from_str(session_id)
            .map_err(|e| TransportError::InvalidHeader(format!("mcp-session-id: {e}")))?;
        headers.insert(MCP_SESSION_ID, value);
    }

    if let Some(event_id) = ctx.last_event_id {
        let value = HeaderValue::from_str(event_id)
            .map_err(|e| TransportError::InvalidHeader(format!("last-event-id: {e}")))?;
        headers.insert(LAST_EVENT_ID, value);
    }

    if ctx.json_body {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    Ok(headers)
}
