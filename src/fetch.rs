//! Pluggable HTTP performer.
//!
//! The transport issues every exchange, including the OAuth token requests,
//! through the [`Fetch`] trait. The default implementation wraps a shared
//! [`reqwest::Client`]; callers substitute their own for proxying, custom
//! TLS, or instrumentation. Header composition happens before the hand-off,
//! so a custom performer sees the finished request.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::error::{TransportError, TransportResult};

// Wire types appearing in the `Fetch` signatures, re-exported so custom
// performers do not need a direct dependency.
pub use bytes::Bytes;
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode};

/// One outbound HTTP exchange, fully composed.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP verb
    pub method: Method,
    /// Target endpoint
    pub url: Url,
    /// Composed headers
    pub headers: HeaderMap,
    /// JSON or form payload; absent for GET and DELETE
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Create a bodyless request.
    pub fn new(method: Method, url: Url, headers: HeaderMap) -> Self {
        Self {
            method,
            url,
            headers,
            body: None,
        }
    }

    /// Attach a request body.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// An HTTP response whose body streams in as byte chunks.
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: BoxStream<'static, TransportResult<Bytes>>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Build a response from parts; the body may yield chunks lazily.
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: impl Stream<Item = TransportResult<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            status,
            headers,
            body: body.boxed(),
        }
    }

    /// Response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// All response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A response header as a string, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The response media type, lowercased, with parameters stripped.
    ///
    /// `Content-Type: Text/Event-Stream; charset=utf-8` yields
    /// `text/event-stream`.
    pub fn content_type(&self) -> Option<String> {
        let value = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        let essence = value.split(';').next().unwrap_or(value).trim();
        Some(essence.to_ascii_lowercase())
    }

    /// Consume the response and collect the full body.
    pub async fn bytes(self) -> TransportResult<Bytes> {
        let mut body = self.body;
        let mut collected = BytesMut::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }

    /// Consume the response and take the body stream.
    pub fn into_body(self) -> BoxStream<'static, TransportResult<Bytes>> {
        self.body
    }
}

/// Capability interface for performing HTTP exchanges.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Perform one exchange and return the response with a streaming body.
    async fn fetch(&self, request: HttpRequest) -> TransportResult<HttpResponse>;
}

/// Default performer backed by a shared [`reqwest::Client`].
#[derive(Clone, Debug, Default)]
pub struct ReqwestFetch {
    client: Client,
}

impl ReqwestFetch {
    /// Create a performer with a fresh client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing client (custom timeouts, proxies, TLS roots).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for ReqwestFetch {
    async fn fetch(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Network(e.to_string())));

        Ok(HttpResponse::new(status, headers, body))
    }
}
