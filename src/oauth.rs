use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::assertion::deserialize_flexible_bool;
use crate::error::Error;

/// Default outbound request bound for provider calls.
pub const DEFAULT_OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ERROR_DETAIL: usize = 512;

/// OAuth client secret.
///
/// Write-only: it is sent to the token endpoint and nowhere else. `Debug`
/// is redacted and there is no `Display`.
#[derive(Clone)]
pub struct ClientSecret(String);

impl ClientSecret {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientSecret(<redacted>)")
    }
}

/// OAuth2 provider configuration.
///
/// Required fields are constructor parameters; optional ones have `with_*` setters.
/// Endpoint defaults target Google.
///
/// ```rust,ignore
/// use session_gate::{ClientSecret, OAuthConfig};
///
/// let config = OAuthConfig::new(
///     "my-client-id",
///     ClientSecret::new("my-secret"),
///     "https://my-app.com/api/auth/callback".parse()?,
/// )
/// .with_token_url("https://idp.example.com/token".parse()?);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OAuthConfig {
    pub(crate) client_id: String,
    pub(crate) client_secret: ClientSecret,
    pub(crate) auth_url: Url,
    pub(crate) token_url: Url,
    pub(crate) userinfo_url: Option<Url>,
    pub(crate) redirect_uri: Url,
    pub(crate) scopes: Vec<String>,
    pub(crate) timeout: Duration,
}

impl OAuthConfig {
    /// Create a new OAuth2 configuration.
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: ClientSecret, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            redirect_uri,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth"
                .parse()
                .expect("valid default URL"),
            token_url: "https://oauth2.googleapis.com/token"
                .parse()
                .expect("valid default URL"),
            userinfo_url: None,
            scopes: vec!["openid".into(), "email".into(), "profile".into()],
            timeout: DEFAULT_OUTBOUND_TIMEOUT,
        }
    }

    /// Override the provider authorization endpoint.
    #[must_use]
    pub fn with_auth_url(mut self, url: Url) -> Self {
        self.auth_url = url;
        self
    }

    /// Override the provider token endpoint.
    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    /// Enable profile enrichment from the provider userinfo endpoint.
    #[must_use]
    pub fn with_userinfo_url(mut self, url: Url) -> Self {
        self.userinfo_url = Some(url);
        self
    }

    /// Override the OAuth2 scopes (default: `["openid", "email", "profile"]`).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Bound for each outbound provider request.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn auth_url(&self) -> &Url {
        &self.auth_url
    }

    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    #[must_use]
    pub fn userinfo_url(&self) -> Option<&Url> {
        self.userinfo_url.as_ref()
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the provider authorization URL for a signed `state` value.
    #[must_use]
    pub fn authorization_url(&self, state: &str) -> Url {
        let scope = self.scopes.join(" ");
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", &scope)
            .append_pair("state", state);
        url
    }
}

/// Token response from the provider token endpoint.
///
/// Only `id_token` survives the callback; the rest is dropped after use.
#[derive(Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl TokenResponse {
    /// Construct a response carrying an ID token (tests and custom exchangers).
    #[must_use]
    pub fn with_id_token(access_token: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: Some("Bearer".into()),
            expires_in: None,
            refresh_token: None,
            id_token: Some(id_token.into()),
        }
    }
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Profile claims from the provider userinfo endpoint.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct UserInfo {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_bool")]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Exchanges an authorization code at the provider token endpoint.
///
/// Implemented by [`ProviderClient`]; tests inject fakes.
pub trait TokenExchanger: Send + Sync + 'static {
    /// Exchange a single-use authorization code. Never retried.
    fn exchange(
        &self,
        code: &str,
        redirect_uri: &Url,
    ) -> impl Future<Output = Result<TokenResponse, Error>> + Send;

    /// Fetch profile claims with the access token, if a userinfo endpoint is configured.
    fn user_info(
        &self,
        _access_token: &str,
    ) -> impl Future<Output = Result<Option<UserInfo>, Error>> + Send {
        async { Ok(None) }
    }
}

/// `OAuth2` client for the provider's token and userinfo endpoints.
pub struct ProviderClient {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl ProviderClient {
    /// Create a provider client whose requests are bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be initialised.
    pub fn new(config: OAuthConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { config, http })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let mut detail = response.text().await.unwrap_or_default();
        if detail.len() > MAX_ERROR_DETAIL {
            let mut cut = MAX_ERROR_DETAIL;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
        }
        Err(Error::Provider {
            operation,
            status: Some(status),
            detail,
        })
    }
}

impl TokenExchanger for ProviderClient {
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure or timeout, or
    /// [`Error::Provider`] if the token endpoint returns an error.
    async fn exchange(&self, code: &str, redirect_uri: &Url) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose()),
        ];

        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(&params)
            .send()
            .await?;

        let response = Self::ensure_success(response, "token exchange").await?;
        response.json::<TokenResponse>().await.map_err(Into::into)
    }

    async fn user_info(&self, access_token: &str) -> Result<Option<UserInfo>, Error> {
        let Some(url) = self.config.userinfo_url.clone() else {
            return Ok(None);
        };

        let response = self.http.get(url).bearer_auth(access_token).send().await?;

        let response = Self::ensure_success(response, "userinfo request").await?;
        response.json::<UserInfo>().await.map(Some).map_err(Into::into)
    }
}
