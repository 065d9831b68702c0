//! Client transport for the MCP Streamable HTTP protocol.
//!
//! One endpoint URL multiplexes JSON-RPC request/response, server
//! notifications, and resumable SSE streams. Every outbound message is a
//! POST whose response is classified as accepted (202), an inline JSON
//! reply, or an SSE stream read asynchronously; an optional standalone GET
//! stream carries server-initiated messages. Interrupted streams are
//! resumed with `Last-Event-ID` under an exponential backoff schedule, and
//! 401 responses drive the configured OAuth provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{self, AuthResult, OAuthClientProvider};
use crate::config::StreamableHttpConfig;
use crate::error::{TransportError, TransportResult};
use crate::fetch::{Fetch, HttpRequest, HttpResponse, ReqwestFetch};
use crate::headers::{HeaderContext, MCP_SESSION_ID, RequestInit, compose_headers};
use crate::retry::ReconnectionOptions;
use crate::sse::SseParser;

/// Callback receiving every JSON-RPC message the server delivers.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback receiving errors that surface outside a rejected operation.
pub type ErrorHandler = Arc<dyn Fn(TransportError) + Send + Sync>;

/// Callback invoked once when the transport closes.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_message: RwLock<Option<MessageHandler>>,
    on_error: RwLock<Option<ErrorHandler>>,
    on_close: RwLock<Option<CloseHandler>>,
}

impl Callbacks {
    fn message(&self, message: Value) {
        let handler = self.on_message.read().clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    fn error(&self, error: TransportError) {
        let handler = self.on_error.read().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    fn closed(&self) {
        let handler = self.on_close.read().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// What a stream is authoritative for.
#[derive(Debug)]
enum StreamKind {
    /// The long-lived GET stream for server-initiated messages
    Standalone,
    /// An SSE response to one POST, serving the listed request ids
    PerRequest { request_ids: Vec<String> },
}

/// Shared state of one active stream.
struct StreamState {
    kind: StreamKind,
    last_event_id: Mutex<Option<String>>,
    retry_hint: Mutex<Option<u64>>,
    saw_event: AtomicBool,
}

impl StreamState {
    fn standalone() -> Self {
        Self {
            kind: StreamKind::Standalone,
            last_event_id: Mutex::new(None),
            retry_hint: Mutex::new(None),
            saw_event: AtomicBool::new(false),
        }
    }

    fn per_request(request_ids: Vec<String>) -> Self {
        Self {
            kind: StreamKind::PerRequest { request_ids },
            last_event_id: Mutex::new(None),
            retry_hint: Mutex::new(None),
            saw_event: AtomicBool::new(false),
        }
    }

    /// The standalone stream always resumes; a per-request stream only once
    /// its first event has been seen (before that there is nothing to
    /// replay from).
    fn resumable(&self) -> bool {
        matches!(self.kind, StreamKind::Standalone) || self.saw_event.load(Ordering::Acquire)
    }

    fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().clone()
    }

    /// Request ids this stream is authoritative for (empty for standalone).
    fn request_ids(&self) -> &[String] {
        match &self.kind {
            StreamKind::Standalone => &[],
            StreamKind::PerRequest { request_ids } => request_ids,
        }
    }
}

/// Outbound body: one message or a batch serialized as a JSON array.
enum Payload {
    Single(Value),
    Batch(Vec<Value>),
}

impl Payload {
    fn to_bytes(&self) -> TransportResult<bytes::Bytes> {
        let vec = match self {
            Self::Single(message) => serde_json::to_vec(message)?,
            Self::Batch(messages) => serde_json::to_vec(messages)?,
        };
        Ok(bytes::Bytes::from(vec))
    }

    fn messages(&self) -> &[Value] {
        match self {
            Self::Single(message) => std::slice::from_ref(message),
            Self::Batch(messages) => messages,
        }
    }

    fn contains_initialize(&self) -> bool {
        self.messages().iter().any(|m| {
            m.get("method").and_then(Value::as_str) == Some("initialize") && m.get("id").is_some()
        })
    }

    fn request_ids(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter(|m| m.get("method").is_some())
            .filter_map(|m| m.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

/// How a stream body ended.
enum StreamEnd {
    /// Server closed the body cleanly
    Clean,
    /// The body broke mid-stream
    Failed(TransportError),
}

struct Inner {
    url: Url,
    request_init: RequestInit,
    reconnection: ReconnectionOptions,
    auth_provider: Option<Arc<dyn OAuthClientProvider>>,
    fetch: Arc<dyn Fetch>,
    started: AtomicBool,
    closed: AtomicBool,
    session_id: Mutex<Option<String>>,
    standalone_task: Mutex<Option<JoinHandle<()>>>,
    standalone_state: Mutex<Option<Arc<StreamState>>>,
    request_streams: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    callbacks: Callbacks,
}

/// Client-side MCP Streamable HTTP transport bound to one endpoint.
///
/// All operations take `&self`; concurrent `send` calls are independent and
/// do not serialize. Messages and stream errors arrive through the
/// callbacks, in server order per stream but unordered across streams.
pub struct StreamableHttpTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamableHttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpTransport")
            .field("url", &self.inner.url.as_str())
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .field("session_id", &self.inner.session_id.lock().clone())
            .finish_non_exhaustive()
    }
}

impl StreamableHttpTransport {
    /// Create a transport from its configuration. No network traffic occurs
    /// until the first operation.
    pub fn new(config: StreamableHttpConfig) -> Self {
        let fetch = config
            .fetch
            .unwrap_or_else(|| Arc::new(ReqwestFetch::new()) as Arc<dyn Fetch>);

        Self {
            inner: Arc::new(Inner {
                url: config.url,
                request_init: config.request_init,
                reconnection: config.reconnection_options,
                auth_provider: config.auth_provider,
                fetch,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                session_id: Mutex::new(None),
                standalone_task: Mutex::new(None),
                standalone_state: Mutex::new(None),
                request_streams: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                callbacks: Callbacks::default(),
            }),
        }
    }

    /// Set the handler for delivered JSON-RPC messages.
    pub fn set_on_message(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        *self.inner.callbacks.on_message.write() = Some(Arc::new(handler));
    }

    /// Set the handler for errors surfaced outside rejected operations.
    pub fn set_on_error(&self, handler: impl Fn(TransportError) + Send + Sync + 'static) {
        *self.inner.callbacks.on_error.write() = Some(Arc::new(handler));
    }

    /// Set the handler invoked when the transport closes.
    pub fn set_on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.inner.callbacks.on_close.write() = Some(Arc::new(handler));
    }

    /// Mark the transport started. Opens no connection by itself; fails if
    /// already started or closed.
    pub async fn start(&self) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        debug!(url = %self.inner.url, "transport started");
        Ok(())
    }

    /// Send one JSON-RPC message.
    ///
    /// Resolves once the response has been classified; messages from a
    /// streaming response arrive through `on_message` afterwards (or
    /// concurrently).
    pub async fn send(&self, message: Value) -> TransportResult<()> {
        self.dispatch(Payload::Single(message)).await
    }

    /// Send a batch; the JSON array is the HTTP body.
    pub async fn send_batch(&self, messages: Vec<Value>) -> TransportResult<()> {
        self.dispatch(Payload::Batch(messages)).await
    }

    /// Open (or replace) the standalone GET stream for server-initiated
    /// messages, optionally resuming from a prior event id.
    ///
    /// A 405 means the server offers no such stream and is not an error.
    pub async fn open_standalone_stream(
        &self,
        resumption_token: Option<String>,
    ) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let inner = self.inner.clone();
        let result = tokio::select! {
            () = self.inner.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            result = Inner::start_standalone(&inner, resumption_token) => result,
        };

        self.report(&result);
        result
    }

    /// Terminate the session, if one is established.
    ///
    /// Resolves immediately when no session id is held. A 2xx or 405
    /// response is success and clears the session id; anything else rejects
    /// and preserves it.
    pub async fn terminate_session(&self) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let inner = self.inner.clone();
        let result = tokio::select! {
            () = self.inner.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            result = Inner::delete_session(&inner) => result,
        };

        self.report(&result);
        result
    }

    /// Close the transport: abort every active stream, cancel pending
    /// reconnects, and reject in-flight sends with `ConnectionClosed`.
    /// Idempotent; further operations fail.
    pub async fn close(&self) -> TransportResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cancel.cancel();
        if let Some(task) = self.inner.standalone_task.lock().take() {
            task.abort();
        }
        for task in self.inner.request_streams.lock().drain(..) {
            task.abort();
        }

        debug!(url = %self.inner.url, "transport closed");
        self.inner.callbacks.closed();
        Ok(())
    }

    /// The session id captured from the last `initialize` exchange, if any.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().clone()
    }

    /// The standalone stream's most recent event id, usable as a resumption
    /// token across transport instances.
    pub fn last_event_id(&self) -> Option<String> {
        let state = self.inner.standalone_state.lock().clone();
        state.and_then(|s| s.last_event_id())
    }

    /// The server's most recent `retry:` hint on the standalone stream, in
    /// milliseconds. Informational; the configured schedule governs timing.
    pub fn server_retry_hint(&self) -> Option<u64> {
        let state = self.inner.standalone_state.lock().clone();
        state.and_then(|s| *s.retry_hint.lock())
    }

    /// Shared handle to the per-request options template.
    pub fn request_init(&self) -> RequestInit {
        self.inner.request_init.clone()
    }

    /// Whether `close()` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Complete a pending OAuth authorization with the code delivered to the
    /// redirect URI, exchanging it for tokens via the configured provider.
    pub async fn finish_auth(&self, authorization_code: &str) -> TransportResult<()> {
        let provider = self
            .inner
            .auth_provider
            .as_ref()
            .ok_or_else(|| TransportError::Auth("no auth provider configured".into()))?;
        auth::exchange_authorization(provider, &self.inner.fetch, &self.inner.url, authorization_code)
            .await
    }

    async fn dispatch(&self, payload: Payload) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let inner = self.inner.clone();
        let result = tokio::select! {
            () = self.inner.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            result = Inner::post(&inner, &payload) => result,
        };

        self.report(&result);
        result
    }

    /// Errors tied to an awaited operation also flow through `on_error`;
    /// close-induced rejections do not (the close callback already fired).
    fn report(&self, result: &TransportResult<()>) {
        if let Err(err) = result
            && !matches!(err, TransportError::ConnectionClosed)
        {
            self.inner.callbacks.error(err.clone());
        }
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.standalone_task.lock().take() {
            task.abort();
        }
        for task in self.inner.request_streams.lock().drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    /// Compose the header set for one request, re-reading the caller
    /// template, auth token, and session id.
    async fn compose(
        &self,
        accept: bool,
        json_body: bool,
        last_event_id: Option<&str>,
    ) -> TransportResult<HeaderMap> {
        let auth_token = match &self.auth_provider {
            Some(provider) => provider.tokens().await.map(|t| t.access_token),
            None => None,
        };
        let session_id = self.session_id.lock().clone();

        compose_headers(
            &self.request_init,
            HeaderContext {
                accept,
                json_body,
                auth_token: auth_token.as_deref(),
                session_id: session_id.as_deref(),
                last_event_id,
            },
        )
    }

    /// Issue one POST and classify the response, retrying once after a
    /// successful silent re-authorization.
    async fn post(self: &Arc<Self>, payload: &Payload) -> TransportResult<()> {
        let body = payload.to_bytes()?;
        let mut auth_retried = false;

        loop {
            let headers = self.compose(true, true, None).await?;
            let request =
                HttpRequest::new(Method::POST, self.url.clone(), headers).with_body(body.clone());
            let response = self.fetch.fetch(request).await?;

            // Session id capture is gated on the payload actually carrying
            // an initialize request.
            if payload.contains_initialize()
                && let Some(session_id) = response.header(MCP_SESSION_ID.as_str())
            {
                debug!(session_id, "captured session id");
                *self.session_id.lock() = Some(session_id.to_string());
            }

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if !auth_retried && let Some(provider) = &self.auth_provider {
                    auth_retried = true;
                    match auth::authenticate(provider, &self.fetch, &self.url).await? {
                        AuthResult::Authorized => continue,
                        AuthResult::Redirect => return Err(TransportError::Unauthorized),
                    }
                }
                return Err(TransportError::Unauthorized);
            }

            if status == StatusCode::ACCEPTED {
                return Ok(());
            }

            if status.is_success() {
                // A 200 without a content-type is treated as JSON.
                let content_type = response
                    .content_type()
                    .unwrap_or_else(|| "application/json".to_string());
                return match content_type.as_str() {
                    "application/json" => self.deliver_json_body(response).await,
                    "text/event-stream" => {
                        self.spawn_request_stream(response, payload.request_ids());
                        Ok(())
                    }
                    other => Err(TransportError::UnexpectedContentType(other.to_string())),
                };
            }

            // Includes 404 on an expired session: surfaced, never auto-reset.
            return Err(Self::http_error("Error POSTing to endpoint", response).await);
        }
    }

    /// Deliver an inline JSON reply (single message or array).
    async fn deliver_json_body(&self, response: HttpResponse) -> TransportResult<()> {
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(());
        }

        let value: Value =
            serde_json::from_slice(&body).map_err(|e| TransportError::Parse(e.to_string()))?;
        match value {
            Value::Array(messages) => {
                for message in messages {
                    self.callbacks.message(message);
                }
            }
            message => self.callbacks.message(message),
        }
        Ok(())
    }

    /// Hand an SSE response body to a background reader task.
    fn spawn_request_stream(self: &Arc<Self>, response: HttpResponse, request_ids: Vec<String>) {
        debug!(?request_ids, "response is an event stream");
        let state = Arc::new(StreamState::per_request(request_ids));
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            inner.run_stream(Some(response), state).await;
        });

        let mut streams = self.request_streams.lock();
        streams.retain(|task| !task.is_finished());
        streams.push(handle);
    }

    /// Open the standalone GET stream and hand it to a reader task,
    /// replacing any previous standalone stream.
    async fn start_standalone(
        self: &Arc<Self>,
        resumption_token: Option<String>,
    ) -> TransportResult<()> {
        let state = Arc::new(StreamState::standalone());
        if let Some(token) = resumption_token {
            *state.last_event_id.lock() = Some(token);
        }

        match self
            .open_get(state.last_event_id(), "Error opening event stream")
            .await?
        {
            Some(response) => {
                let inner = self.clone();
                let task_state = state.clone();
                let handle = tokio::spawn(async move {
                    inner.run_stream(Some(response), task_state).await;
                });
                if let Some(previous) = self.standalone_task.lock().replace(handle) {
                    previous.abort();
                }
                *self.standalone_state.lock() = Some(state);
                Ok(())
            }
            None => {
                debug!("server offers no standalone event stream (HTTP 405)");
                Ok(())
            }
        }
    }

    /// Issue a GET for a new or resumed stream. `Ok(None)` means 405: the
    /// server offers no stream, which is not an error.
    async fn open_get(
        &self,
        last_event_id: Option<String>,
        context: &str,
    ) -> TransportResult<Option<HttpResponse>> {
        let mut auth_retried = false;

        loop {
            let headers = self.compose(true, false, last_event_id.as_deref()).await?;
            let request = HttpRequest::new(Method::GET, self.url.clone(), headers);
            let response = self.fetch.fetch(request).await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if !auth_retried && let Some(provider) = &self.auth_provider {
                    auth_retried = true;
                    match auth::authenticate(provider, &self.fetch, &self.url).await? {
                        AuthResult::Authorized => continue,
                        AuthResult::Redirect => return Err(TransportError::Unauthorized),
                    }
                }
                return Err(TransportError::Unauthorized);
            }

            if status == StatusCode::METHOD_NOT_ALLOWED {
                return Ok(None);
            }

            if !status.is_success() {
                return Err(Self::http_error(context, response).await);
            }

            return match response.content_type().as_deref() {
                Some("text/event-stream") => Ok(Some(response)),
                other => Err(TransportError::UnexpectedContentType(
                    other.unwrap_or("<missing>").to_string(),
                )),
            };
        }
    }

    /// Drive one stream to completion, resuming interruptions under the
    /// configured backoff schedule.
    async fn run_stream(self: Arc<Self>, initial: Option<HttpResponse>, state: Arc<StreamState>) {
        let mut next_response = initial;
        let mut attempt: u32 = 0;

        loop {
            let response = match next_response.take() {
                Some(response) => response,
                None => loop {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    if attempt >= self.reconnection.max_retries {
                        self.callbacks
                            .error(TransportError::ReconnectExhausted { attempts: attempt });
                        return;
                    }

                    let delay = self.reconnection.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling stream reconnect");
                    tokio::time::sleep(delay).await;
                    attempt += 1;

                    match self
                        .open_get(state.last_event_id(), "Error reconnecting event stream")
                        .await
                    {
                        Ok(Some(response)) => break response,
                        Ok(None) => {
                            debug!("server stopped offering the event stream (HTTP 405)");
                            return;
                        }
                        Err(err) => {
                            warn!(error = %err, "stream reconnect failed");
                        }
                    }
                },
            };

            // The body began streaming without error: the attempt counter
            // starts over for the next interruption.
            attempt = 0;

            match self.read_stream(response, &state).await {
                StreamEnd::Clean => {
                    debug!(kind = ?state.kind, "event stream closed by server");
                    return;
                }
                StreamEnd::Failed(err) => {
                    if !state.resumable() {
                        warn!(
                            request_ids = ?state.request_ids(),
                            error = %err,
                            "event stream failed before its first event; abandoning"
                        );
                        self.callbacks.error(err);
                        return;
                    }
                    warn!(error = %err, "event stream interrupted, resuming");
                }
            }
        }
    }

    /// Parse one stream body, delivering messages until it ends.
    async fn read_stream(&self, response: HttpResponse, state: &StreamState) -> StreamEnd {
        let mut parser = SseParser::new();
        let mut body = response.into_body();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return StreamEnd::Failed(err),
            };

            for event in parser.feed(&chunk) {
                state.saw_event.store(true, Ordering::Release);

                // The resumption token must be current before delivery so a
                // failure right after still replays from the correct point.
                if let Some(id) = &event.id {
                    *state.last_event_id.lock() = Some(id.clone());
                }
                if let Some(retry_ms) = event.retry {
                    *state.retry_hint.lock() = Some(retry_ms);
                }

                match serde_json::from_str::<Value>(&event.data) {
                    Ok(message) if message.is_object() => self.callbacks.message(message),
                    Ok(_) => {
                        warn!("dropping event: data is not a JSON-RPC message object");
                        self.callbacks.error(TransportError::Parse(
                            "event data is not a JSON-RPC message object".into(),
                        ));
                    }
                    Err(err) => {
                        warn!(error = %err, "dropping unparseable event");
                        self.callbacks.error(TransportError::Parse(err.to_string()));
                    }
                }
            }
        }

        StreamEnd::Clean
    }

    /// Issue the DELETE that ends the session.
    async fn delete_session(self: &Arc<Self>) -> TransportResult<()> {
        if self.session_id.lock().is_none() {
            return Ok(());
        }

        let mut auth_retried = false;
        loop {
            let headers = self.compose(false, false, None).await?;
            let request = HttpRequest::new(Method::DELETE, self.url.clone(), headers);
            let response = self.fetch.fetch(request).await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if !auth_retried && let Some(provider) = &self.auth_provider {
                    auth_retried = true;
                    match auth::authenticate(provider, &self.fetch, &self.url).await? {
                        AuthResult::Authorized => continue,
                        AuthResult::Redirect => return Err(TransportError::Unauthorized),
                    }
                }
                return Err(TransportError::Unauthorized);
            }

            // 405 means the server does not implement explicit termination;
            // the session is finished from the client's perspective either way.
            if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
                *self.session_id.lock() = None;
                debug!("session terminated");
                return Ok(());
            }

            return Err(Self::http_error("Failed to terminate session", response).await);
        }
    }

    /// Build an HTTP error from a response, reading the body when possible.
    async fn http_error(context: &str, response: HttpResponse) -> TransportError {
        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let body = match response.bytes().await {
            Ok(bytes) if !bytes.is_empty() => Some(String::from_utf8_lossy(&bytes).into_owned()),
            _ => None,
        };
        TransportError::http(context, status.as_u16(), status_text, body)
    }
}
