//! OAuth recovery for 401 responses.
//!
//! The transport never inspects token internals; it reads `access_token`
//! for the `Authorization` header and hands everything else to a pluggable
//! [`OAuthClientProvider`]. On a 401 the coordinator first tries a silent
//! refresh with stored credentials; failing that it builds a PKCE
//! authorization URL and asks the provider to redirect the user.
//!
//! Token and authorization endpoints derive from the transport endpoint's
//! origin (`/token`, `/authorize`); server metadata discovery is out of
//! scope. Token requests travel through the transport's own [`Fetch`], so a
//! caller-supplied performer also covers the auth dance.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use oauth2::{CsrfToken, PkceCodeChallenge};
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{TransportError, TransportResult};
use crate::fetch::{Fetch, HttpRequest};

/// Token record as persisted by the provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Bearer token attached to outbound requests
    pub access_token: String,
    /// Token type, normally `Bearer`
    pub token_type: String,
    /// Lifetime in seconds, when the server reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Refresh credential enabling silent re-authorization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Registered OAuth client credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthClientInformation {
    /// Client identifier issued at registration
    pub client_id: String,
    /// Client secret for confidential clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Static client metadata for the authorization dance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OAuthClientMetadata {
    /// Human-readable client name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Redirect URIs registered for this client
    pub redirect_uris: Vec<String>,
    /// Scope requested during authorization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Persistence and redirect hooks supplied by the application.
///
/// The provider owns token storage and the user-facing consent flow; the
/// transport drives it through these hooks when a 401 arrives.
#[async_trait]
pub trait OAuthClientProvider: Send + Sync {
    /// Redirect URI the authorization response returns to.
    fn redirect_url(&self) -> Url;

    /// Static client metadata.
    fn client_metadata(&self) -> OAuthClientMetadata;

    /// Registered client credentials, if registration happened.
    async fn client_information(&self) -> Option<OAuthClientInformation>;

    /// Currently stored tokens.
    async fn tokens(&self) -> Option<OAuthTokens>;

    /// Persist rotated or newly issued tokens.
    async fn save_tokens(&self, tokens: OAuthTokens);

    /// PKCE verifier saved when the authorization URL was built.
    async fn code_verifier(&self) -> Option<String>;

    /// Persist the PKCE verifier for the pending authorization.
    async fn save_code_verifier(&self, verifier: String);

    /// Send the user to the authorization URL, out of band.
    async fn redirect_to_authorization(&self, authorization_url: Url);
}

/// Outcome of a 401 recovery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthResult {
    /// Fresh tokens are stored; the failed request can be retried once
    Authorized,
    /// User interaction is required; the redirect has been triggered
    Redirect,
}

/// Recover from a 401: silent refresh when possible, redirect otherwise.
pub(crate) async fn authenticate(
    provider: &Arc<dyn OAuthClientProvider>,
    fetch: &Arc<dyn Fetch>,
    endpoint: &Url,
) -> TransportResult<AuthResult> {
    let tokens = provider.tokens().await;
    let refresh_token = tokens.and_then(|t| t.refresh_token);

    if let Some(refresh_token) = refresh_token
        && let Some(info) = provider.client_information().await
    {
        match refresh_tokens(fetch, endpoint, &refresh_token, &info).await {
            Ok(rotated) => {
                provider.save_tokens(rotated).await;
                return Ok(AuthResult::Authorized);
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed, falling back to authorization redirect");
            }
        }
    }

    begin_authorization(provider, endpoint).await?;
    Ok(AuthResult::Redirect)
}

/// Exchange an authorization code delivered to the redirect URI.
///
/// Called by the application after the user completed the consent flow;
/// consumes the PKCE verifier saved when the redirect was issued.
pub(crate) async fn exchange_authorization(
    provider: &Arc<dyn OAuthClientProvider>,
    fetch: &Arc<dyn Fetch>,
    endpoint: &Url,
    authorization_code: &str,
) -> TransportResult<()> {
    let info = provider
        .client_information()
        .await
        .ok_or_else(|| TransportError::Auth("no client registration available".into()))?;
    let verifier = provider
        .code_verifier()
        .await
        .ok_or_else(|| TransportError::Auth("no code verifier saved for pending authorization".into()))?;

    let form = {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "authorization_code")
            .append_pair("code", authorization_code)
            .append_pair("code_verifier", &verifier)
            .append_pair("redirect_uri", provider.redirect_url().as_str())
            .append_pair("client_id", &info.client_id);
        if let Some(secret) = &info.client_secret {
            form.append_pair("client_secret", secret);
        }
        form.finish()
    };

    let tokens = token_request(fetch, endpoint, form).await?;
    provider.save_tokens(tokens).await;
    Ok(())
}

/// Rotate tokens with a `refresh_token` grant.
async fn refresh_tokens(
    fetch: &Arc<dyn Fetch>,
    endpoint: &Url,
    refresh_token: &str,
    info: &OAuthClientInformation,
) -> TransportResult<OAuthTokens> {
    let form = {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .append_pair("client_id", &info.client_id);
        if let Some(secret) = &info.client_secret {
            form.append_pair("client_secret", secret);
        }
        form.finish()
    };

    token_request(fetch, endpoint, form).await
}

/// POST a form to the token endpoint and parse the token response.
async fn token_request(
    fetch: &Arc<dyn Fetch>,
    endpoint: &Url,
    form: String,
) -> TransportResult<OAuthTokens> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let request = HttpRequest::new(Method::POST, endpoint_with_path(endpoint, "/token"), headers)
        .with_body(Bytes::from(form));
    let response = fetch.fetch(request).await?;

    if !response.status().is_success() {
        return Err(TransportError::Auth(format!(
            "token endpoint returned HTTP {}",
            response.status().as_u16()
        )));
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body)
        .map_err(|e| TransportError::Auth(format!("malformed token response: {e}")))
}

/// Build the PKCE authorization URL and hand the user off to it.
async fn begin_authorization(
    provider: &Arc<dyn OAuthClientProvider>,
    endpoint: &Url,
) -> TransportResult<()> {
    let info = provider
        .client_information()
        .await
        .ok_or_else(|| TransportError::Auth("no client registration available".into()))?;

    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    provider
        .save_code_verifier(verifier.secret().clone())
        .await;

    let mut url = endpoint_with_path(endpoint, "/authorize");
    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("response_type", "code")
            .append_pair("client_id", &info.client_id)
            .append_pair("redirect_uri", provider.redirect_url().as_str())
            .append_pair("code_challenge", challenge.as_str())
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", CsrfToken::new_random().secret());
        if let Some(scope) = provider.client_metadata().scope {
            pairs.append_pair("scope", &scope);
        }
    }

    provider.redirect_to_authorization(url).await;
    Ok(())
}

/// Endpoint origin with a conventional OAuth path.
fn endpoint_with_path(endpoint: &Url, path: &str) -> Url {
    let mut url = endpoint.clone();
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingProvider {
        tokens: Mutex<Option<OAuthTokens>>,
        info: Mutex<Option<OAuthClientInformation>>,
        saved_tokens: Mutex<Option<OAuthTokens>>,
        saved_verifier: Mutex<Option<String>>,
        redirects: AtomicUsize,
        last_redirect: Mutex<Option<Url>>,
    }

    #[async_trait]
    impl OAuthClientProvider for RecordingProvider {
        fn redirect_url(&self) -> Url {
            Url::parse("http://localhost:9999/callback").unwrap()
        }

        fn client_metadata(&self) -> OAuthClientMetadata {
            OAuthClientMetadata {
                client_name: Some("test-client".into()),
                redirect_uris: vec!["http://localhost:9999/callback".into()],
                scope: Some("mcp".into()),
            }
        }

        async fn client_information(&self) -> Option<OAuthClientInformation> {
            self.info.lock().clone()
        }

        async fn tokens(&self) -> Option<OAuthTokens> {
            self.tokens.lock().clone()
        }

        async fn save_tokens(&self, tokens: OAuthTokens) {
            *self.saved_tokens.lock() = Some(tokens);
        }

        async fn code_verifier(&self) -> Option<String> {
            self.saved_verifier.lock().clone()
        }

        async fn save_code_verifier(&self, verifier: String) {
            *self.saved_verifier.lock() = Some(verifier);
        }

        async fn redirect_to_authorization(&self, authorization_url: Url) {
            self.redirects.fetch_add(1, Ordering::SeqCst);
            *self.last_redirect.lock() = Some(authorization_url);
        }
    }

    struct JsonFetch(&'static str);

    #[async_trait]
    impl Fetch for JsonFetch {
        async fn fetch(&self, _request: HttpRequest) -> TransportResult<crate::fetch::HttpResponse> {
            let body = Bytes::from_static(self.0.as_bytes());
            Ok(crate::fetch::HttpResponse::new(
                StatusCode::OK,
                HeaderMap::new(),
                stream::once(async move { Ok(body) }),
            ))
        }
    }

    struct CapturingFetch {
        response_body: &'static str,
        requests: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl Fetch for CapturingFetch {
        async fn fetch(&self, request: HttpRequest) -> TransportResult<crate::fetch::HttpResponse> {
            self.requests.lock().push(request);
            let body = Bytes::from_static(self.response_body.as_bytes());
            Ok(crate::fetch::HttpResponse::new(
                StatusCode::OK,
                HeaderMap::new(),
                stream::once(async move { Ok(body) }),
            ))
        }
    }

    fn stored_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "old-access".into(),
            token_type: "Bearer".into(),
            expires_in: Some(3600),
            refresh_token: Some("refresh-1".into()),
            scope: None,
        }
    }

    #[tokio::test]
    async fn silent_refresh_saves_rotated_tokens() {
        let provider = Arc::new(RecordingProvider::default());
        *provider.tokens.lock() = Some(stored_tokens());
        *provider.info.lock() = Some(OAuthClientInformation {
            client_id: "cid".into(),
            client_secret: None,
        });

        let fetch: Arc<dyn Fetch> = Arc::new(JsonFetch(
            r#"{"access_token":"new-access","token_type":"Bearer","refresh_token":"refresh-2"}"#,
        ));
        let provider_dyn: Arc<dyn OAuthClientProvider> = provider.clone();
        let endpoint = Url::parse("http://localhost:8080/mcp").unwrap();

        let result = authenticate(&provider_dyn, &fetch, &endpoint).await.unwrap();
        assert_eq!(result, AuthResult::Authorized);
        let saved = provider.saved_tokens.lock().clone().unwrap();
        assert_eq!(saved.access_token, "new-access");
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(provider.redirects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_refresh_credentials_trigger_redirect_once() {
        let provider = Arc::new(RecordingProvider::default());
        *provider.info.lock() = Some(OAuthClientInformation {
            client_id: "cid".into(),
            client_secret: None,
        });

        let fetch: Arc<dyn Fetch> = Arc::new(JsonFetch("{}"));
        let provider_dyn: Arc<dyn OAuthClientProvider> = provider.clone();
        let endpoint = Url::parse("http://localhost:8080/mcp").unwrap();

        let result = authenticate(&provider_dyn, &fetch, &endpoint).await.unwrap();
        assert_eq!(result, AuthResult::Redirect);
        assert_eq!(provider.redirects.load(Ordering::SeqCst), 1);

        let url = provider.last_redirect.lock().clone().unwrap();
        assert_eq!(url.path(), "/authorize");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.iter().any(|(k, _)| k == "code_challenge"));
        assert!(
            pairs
                .iter()
                .any(|(k, v)| k == "code_challenge_method" && v == "S256")
        );
        assert!(pairs.iter().any(|(k, v)| k == "client_id" && v == "cid"));
        assert!(provider.saved_verifier.lock().is_some());
    }

    #[tokio::test]
    async fn exchange_sends_verifier_and_code() {
        let provider = Arc::new(RecordingProvider::default());
        *provider.info.lock() = Some(OAuthClientInformation {
            client_id: "cid".into(),
            client_secret: Some("shh".into()),
        });
        *provider.saved_verifier.lock() = Some("verifier-123".into());

        let fetch_impl = Arc::new(CapturingFetch {
            response_body: r#"{"access_token":"granted","token_type":"Bearer"}"#,
            requests: Mutex::new(Vec::new()),
        });
        let fetch: Arc<dyn Fetch> = fetch_impl.clone();
        let provider_dyn: Arc<dyn OAuthClientProvider> = provider.clone();
        let endpoint = Url::parse("http://localhost:8080/mcp").unwrap();

        exchange_authorization(&provider_dyn, &fetch, &endpoint, "code-xyz")
            .await
            .unwrap();
        assert_eq!(
            provider.saved_tokens.lock().clone().unwrap().access_token,
            "granted"
        );

        let requests = fetch_impl.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/token");
        let form = String::from_utf8(requests[0].body.clone().unwrap().to_vec()).unwrap();
        assert!(form.contains("grant_type=authorization_code"));
        assert!(form.contains("code=code-xyz"));
        assert!(form.contains("code_verifier=verifier-123"));
        assert!(form.contains("client_secret=shh"));
    }

    #[tokio::test]
    async fn exchange_without_verifier_fails() {
        let provider = Arc::new(RecordingProvider::default());
        *provider.info.lock() = Some(OAuthClientInformation {
            client_id: "cid".into(),
            client_secret: None,
        });

        let fetch: Arc<dyn Fetch> = Arc::new(JsonFetch("{}"));
        let provider_dyn: Arc<dyn OAuthClientProvider> = provider.clone();
        let endpoint = Url::parse("http://localhost:8080/mcp").unwrap();

        let result = exchange_authorization(&provider_dyn, &fetch, &endpoint, "code").await;
        assert!(matches!(result, Err(TransportError::Auth(_))));
    }

    #[test]
    fn token_records_round_trip_through_serde() {
        let tokens = stored_tokens();
        let json = serde_json::to_string(&tokens).unwrap();
        let back: OAuthTokens = serde_json::from_str(&json).unwrap();
        assert_eq!(back.access_token, tokens.access_token);
        assert_eq!(back.refresh_token, tokens.refresh_token);
    }
}
