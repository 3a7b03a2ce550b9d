use std::time::Duration;

use url::Url;

use super::error::AuthError;
use super::state::AuthState;
use crate::assertion::AssertionVerifier;
use crate::backend::IdentityBackend;
use crate::flow::{FlowController, FlowSettings};
use crate::oauth::{ClientSecret, OAuthConfig, ProviderClient};
use crate::state::StateKey;

const DEFAULT_ISSUER: &str = "https://accounts.google.com";
const DEFAULT_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// How ID tokens are verified.
#[derive(Debug, Clone)]
pub enum IdTokenKeys {
    /// HS256 with the client secret.
    ClientSecret,
    /// Asymmetric keys from the provider JWKS endpoint.
    Jwks(Url),
}

/// Session authentication configuration.
///
/// Required fields are constructor parameters. Use
/// [`from_env()`](AuthConfig::from_env) for convention-based setup,
/// or [`new()`](AuthConfig::new) with `with_*` methods for full control.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub(super) flow: FlowSettings,
    pub(super) auth_path: String,
    pub(super) issuers: Vec<String>,
    pub(super) id_token_keys: IdTokenKeys,
}

impl AuthConfig {
    /// Create config from the provider settings and the state key.
    ///
    /// Defaults: Google issuer and JWKS, routes under `/api/auth`.
    #[must_use]
    pub fn new(oauth: OAuthConfig, state_key: StateKey) -> Self {
        Self {
            flow: FlowSettings::new(oauth, state_key),
            auth_path: "/api/auth".into(),
            issuers: vec![DEFAULT_ISSUER.into()],
            id_token_keys: IdTokenKeys::Jwks(
                DEFAULT_JWKS_URL.parse().expect("valid default URL"),
            ),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `OAUTH_CLIENT_ID`: OAuth2 client ID
    /// - `OAUTH_CLIENT_SECRET`: OAuth2 client secret
    /// - `OAUTH_REDIRECT_URI`: OAuth2 callback URI (must be a valid URL)
    ///
    /// # Optional env vars
    /// - `OAUTH_AUTH_URL`, `OAUTH_TOKEN_URL`, `OAUTH_USERINFO_URL`: endpoint overrides
    /// - `OAUTH_ISSUER`: comma-separated accepted ID-token issuers
    /// - `OAUTH_JWKS_URL`: provider signing keys
    /// - `OAUTH_ID_TOKEN_HS256`: `"1"` or `"true"` to verify ID tokens with the client secret
    /// - `OAUTH_SCOPES`: comma-separated OAuth2 scopes
    /// - `APP_BASE_URL`: absolute base URL of the application
    /// - `SESSION_TTL_DAYS`: session lifetime in days (default 5)
    /// - `COOKIE_DOMAIN`: parent domain shared by all subdomains
    /// - `STATE_KEY`: 64 hex chars; a random key is generated when unset
    /// - `HTTP_TIMEOUT_SECS`: bound on outbound calls (default 10)
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if required env vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, AuthError> {
        let required = |name: &str| {
            var(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AuthError::Config(format!("{name} is required")))
        };
        let url = |name: &str| -> Result<Option<Url>, AuthError> {
            var(name)
                .map(|s| {
                    s.parse()
                        .map_err(|e| AuthError::Config(format!("{name}: {e}")))
                })
                .transpose()
        };
        let number = |name: &str| -> Result<Option<u64>, AuthError> {
            var(name)
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|e| AuthError::Config(format!("{name}: {e}")))
                })
                .transpose()
        };

        let client_id = required("OAUTH_CLIENT_ID")?;
        let client_secret = ClientSecret::new(required("OAUTH_CLIENT_SECRET")?);
        let redirect_uri: Url = required("OAUTH_REDIRECT_URI")?
            .parse()
            .map_err(|e| AuthError::Config(format!("OAUTH_REDIRECT_URI: {e}")))?;

        let mut oauth = OAuthConfig::new(client_id, client_secret, redirect_uri);
        if let Some(u) = url("OAUTH_AUTH_URL")? {
            oauth = oauth.with_auth_url(u);
        }
        if let Some(u) = url("OAUTH_TOKEN_URL")? {
            oauth = oauth.with_token_url(u);
        }
        if let Some(u) = url("OAUTH_USERINFO_URL")? {
            oauth = oauth.with_userinfo_url(u);
        }
        if let Some(scopes) = var("OAUTH_SCOPES") {
            oauth = oauth.with_scopes(split_list(&scopes));
        }
        let timeout = number("HTTP_TIMEOUT_SECS")?.map(Duration::from_secs);
        if let Some(t) = timeout {
            oauth = oauth.with_timeout(t);
        }

        let state_key = match var("STATE_KEY") {
            Some(k) => StateKey::from_hex(&k).map_err(|_| {
                AuthError::Config(
                    "STATE_KEY is set but invalid (must be 64 hex characters). \
                     Remove the env var to use an ephemeral key, or provide a valid key."
                        .into(),
                )
            })?,
            None => {
                tracing::warn!(
                    "STATE_KEY not set; using an ephemeral key (sign-ins in progress fail across restarts and instances)"
                );
                StateKey::generate()
            }
        };

        let mut config = Self::new(oauth, state_key);

        if let Some(issuers) = var("OAUTH_ISSUER") {
            config = config.with_issuers(split_list(&issuers));
        }
        if matches!(var("OAUTH_ID_TOKEN_HS256").as_deref(), Some("1") | Some("true")) {
            config = config.with_id_token_keys(IdTokenKeys::ClientSecret);
        } else if let Some(u) = url("OAUTH_JWKS_URL")? {
            config = config.with_id_token_keys(IdTokenKeys::Jwks(u));
        }
        if let Some(u) = url("APP_BASE_URL")? {
            config = config.with_app_base_url(u);
        }
        if let Some(days) = number("SESSION_TTL_DAYS")? {
            let seconds = days
                .checked_mul(24 * 60 * 60)
                .filter(|s| *s > 0)
                .ok_or_else(|| {
                    AuthError::Config(format!(
                        "SESSION_TTL_DAYS must be a positive number of days, got {days}"
                    ))
                })?;
            config = config.with_session_ttl(Duration::from_secs(seconds));
        }
        if let Some(domain) = var("COOKIE_DOMAIN").filter(|d| !d.is_empty()) {
            config = config.with_cookie_domain(domain);
        }
        if let Some(t) = timeout {
            config = config.with_outbound_timeout(t);
        }

        Ok(config)
    }

    /// Build the provider client, ID-token verifier and flow controller.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if an HTTP client cannot be initialised.
    pub fn into_state<B: IdentityBackend>(
        self,
        backend: B,
    ) -> Result<AuthState<ProviderClient, B>, AuthError> {
        let oauth = self.flow.oauth().clone();
        let verifier = match self.id_token_keys {
            IdTokenKeys::ClientSecret => AssertionVerifier::with_client_secret(
                self.issuers,
                oauth.client_id(),
                oauth.client_secret.clone(),
            ),
            IdTokenKeys::Jwks(url) => {
                AssertionVerifier::with_jwks(self.issuers, oauth.client_id(), url, oauth.timeout())
                    .map_err(|e| AuthError::Config(e.to_string()))?
            }
        };
        let client = ProviderClient::new(oauth).map_err(|e| AuthError::Config(e.to_string()))?;

        let flow = self.flow.with_state_cookie_path(self.auth_path.clone());

        Ok(AuthState::new(
            self.auth_path,
            FlowController::new(flow, client, verifier, backend),
        ))
    }

    #[must_use]
    pub fn with_auth_path(mut self, path: impl Into<String>) -> Self {
        self.auth_path = path.into();
        self
    }

    #[must_use]
    pub fn with_issuers(mut self, issuers: Vec<String>) -> Self {
        self.issuers = issuers;
        self
    }

    #[must_use]
    pub fn with_id_token_keys(mut self, keys: IdTokenKeys) -> Self {
        self.id_token_keys = keys;
        self
    }

    #[must_use]
    pub fn with_app_base_url(mut self, url: Url) -> Self {
        self.flow = self.flow.with_app_base_url(url);
        self
    }

    #[must_use]
    pub fn with_login_redirect(mut self, path: impl Into<String>) -> Self {
        self.flow = self.flow.with_login_redirect(path);
        self
    }

    #[must_use]
    pub fn with_error_redirect(mut self, path: impl Into<String>) -> Self {
        self.flow = self.flow.with_error_redirect(path);
        self
    }

    #[must_use]
    pub fn with_state_key(mut self, key: StateKey) -> Self {
        self.flow = self.flow.with_state_key(key);
        self
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.flow = self.flow.with_session_ttl(ttl);
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.flow = self.flow.with_cookie_domain(Some(domain.into()));
        self
    }

    #[must_use]
    pub fn with_outbound_timeout(mut self, limit: Duration) -> Self {
        self.flow = self.flow.with_outbound_timeout(limit);
        self
    }

    #[must_use]
    pub fn flow(&self) -> &FlowSettings {
        &self.flow
    }

    #[must_use]
    pub fn auth_path(&self) -> &str {
        &self.auth_path
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
