//! Transport configuration.

use std::sync::Arc;

use url::Url;

use crate::auth::OAuthClientProvider;
use crate::fetch::Fetch;
use crate::headers::RequestInit;
use crate::retry::ReconnectionOptions;

/// Configuration for [`StreamableHttpTransport`](crate::StreamableHttpTransport).
///
/// The endpoint URL is immutable after construction. Everything else is a
/// capability or template the transport consults per request.
#[derive(Clone)]
pub struct StreamableHttpConfig {
    /// The single MCP endpoint every request targets
    pub url: Url,
    /// Per-request options template; header mutations between sends apply
    /// to the next request
    pub request_init: RequestInit,
    /// Backoff schedule for interrupted event streams
    pub reconnection_options: ReconnectionOptions,
    /// Optional OAuth provider driven on 401 responses
    pub auth_provider: Option<Arc<dyn OAuthClientProvider>>,
    /// Optional replacement HTTP performer; defaults to a shared reqwest
    /// client
    pub fetch: Option<Arc<dyn Fetch>>,
}

impl std::fmt::Debug for StreamableHttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpConfig")
            .field("url", &self.url.as_str())
            .field("request_init", &self.request_init)
            .field("reconnection_options", &self.reconnection_options)
            .field("auth_provider", &self.auth_provider.is_some())
            .field("fetch", &self.fetch.is_some())
            .finish()
    }
}

impl StreamableHttpConfig {
    /// Configuration with defaults for the given endpoint.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            request_init: RequestInit::new(),
            reconnection_options: ReconnectionOptions::default(),
            auth_provider: None,
            fetch: None,
        }
    }

    /// Start building a configuration fluently.
    pub fn builder(url: Url) -> StreamableHttpConfigBuilder {
        StreamableHttpConfigBuilder::new(url)
    }
}

/// Builder for [`StreamableHttpConfig`].
pub struct StreamableHttpConfigBuilder {
    config: StreamableHttpConfig,
}

impl std::fmt::Debug for StreamableHttpConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl StreamableHttpConfigBuilder {
    /// Create a builder with defaults for the given endpoint.
    pub fn new(url: Url) -> Self {
        Self {
            config: StreamableHttpConfig::new(url),
        }
    }

    /// Use an existing per-request options template (share a clone with the
    /// caller to mutate headers between sends).
    pub fn with_request_init(mut self, request_init: RequestInit) -> Self {
        self.config.request_init = request_init;
        self
    }

    /// Set the reconnection schedule.
    pub fn with_reconnection_options(mut self, options: ReconnectionOptions) -> Self {
        self.config.reconnection_options = options;
        self
    }

    /// Attach an OAuth provider for 401 recovery.
    pub fn with_auth_provider(mut self, provider: Arc<dyn OAuthClientProvider>) -> Self {
        self.config.auth_provider = Some(provider);
        self
    }

    /// Replace the HTTP performer.
    pub fn with_fetch(mut self, fetch: Arc<dyn Fetch>) -> Self {
        self.config.fetch = Some(fetch);
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> StreamableHttpConfig {
        self.config
    }
}
