//! OAuth flow controller.
//!
//! One flow instance moves through
//! `Idle → AwaitingProvider → CallbackReceived → SessionIssued`, or ends in
//! `Failed` from any stage. The instance is never held in memory: `start`
//! encodes everything the server needs into the signed `state` parameter,
//! so the controller is stateless between requests and every operation can
//! run concurrently with any other. The browser holds the only other half:
//! the state nonce, in a cookie set by `start` and consumed by `callback`.
//!
//! Session delivery is two-phase. [`FlowController::callback`] yields a
//! [`SessionIssued`] that the HTTP layer returns as a `200` document carrying
//! the cookie; navigation to the landing page is a separate request the
//! browser makes after that document has loaded.

use std::future::Future;
use std::time::Duration;

use axum_extra::extract::cookie::Cookie;
use derive_more::Display;
use serde::Deserialize;
use tokio::time::timeout;
use url::Url;

use crate::assertion::AssertionVerifier;
use crate::backend::{BackendError, IdentityBackend};
use crate::cookie::{DEFAULT_SESSION_TTL, SessionCookieCodec, StateCookieCodec};
use crate::error::Error;
use crate::oauth::{DEFAULT_OUTBOUND_TIMEOUT, OAuthConfig, TokenExchanger};
use crate::state::{self, StateKey, sanitize_return_path};
use crate::types::{AuthenticatedUser, SessionCredential};

/// Stage of one authorization flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FlowStage {
    #[display("idle")]
    Idle,
    #[display("awaiting_provider")]
    AwaitingProvider,
    #[display("callback_received")]
    CallbackReceived,
    #[display("session_issued")]
    SessionIssued,
    #[display("failed")]
    Failed,
}

/// Why a flow instance ended in [`FlowStage::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// User declined consent or the provider reported an error.
    #[error("Provider returned error: {error}")]
    ProviderDenied { error: String },

    /// `state` missing, forged, tampered with, expired, or not issued to
    /// this browser.
    #[error("Authorization state rejected")]
    StateMismatch,

    /// Callback carried a valid `state` but no `code`.
    #[error("Authorization code missing")]
    MissingCode,

    /// `state` could not be issued.
    #[error("Could not start authorization: {0}")]
    Start(#[source] Error),

    #[error("Token exchange failed: {0}")]
    TokenExchange(#[source] Error),

    #[error("Identity assertion rejected: {0}")]
    InvalidAssertion(#[source] Error),

    /// The identity backend could not mint a session.
    #[error("Session could not be issued: {0}")]
    SessionUnavailable(String),
}

impl FlowError {
    /// Error code placed on the failure redirect.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProviderDenied { error } if error == "access_denied" => "access_denied",
            Self::ProviderDenied { .. } => "provider_error",
            Self::StateMismatch => "state_mismatch",
            Self::MissingCode => "missing_code",
            Self::Start(_) => "start_failed",
            Self::TokenExchange(_) => "token_exchange_failed",
            Self::InvalidAssertion(_) => "invalid_identity",
            Self::SessionUnavailable(_) => "session_unavailable",
        }
    }

    /// Stage the flow had reached when it failed.
    #[must_use]
    pub fn stage(&self) -> FlowStage {
        match self {
            Self::Start(_) => FlowStage::Idle,
            Self::ProviderDenied { .. } | Self::StateMismatch => FlowStage::AwaitingProvider,
            Self::MissingCode
            | Self::TokenExchange(_)
            | Self::InvalidAssertion(_)
            | Self::SessionUnavailable(_) => FlowStage::CallbackReceived,
        }
    }

    /// Anti-forgery failures are security events, never generic errors.
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::StateMismatch)
    }

    /// "Temporarily unavailable", as opposed to "not who you say".
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::SessionUnavailable(_) | Self::Start(_) => true,
            Self::TokenExchange(e) => e.is_transient(),
            _ => false,
        }
    }

    /// A genuine client error rather than a flow failure.
    #[must_use]
    pub fn is_malformed_request(&self) -> bool {
        matches!(self, Self::MissingCode)
    }
}

/// Query parameters of the provider redirect to the callback.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Result of `start`: where to send the browser, and the cookie binding the
/// state to it.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: Url,
    pub cookie: Cookie<'static>,
}

/// Result of a successful callback.
///
/// Phase one delivers `cookie` in a normal document load; phase two is the
/// browser's own navigation to `landing`.
#[derive(Debug, Clone)]
pub struct SessionIssued {
    pub cookie: Cookie<'static>,
    pub landing: Url,
    pub user: AuthenticatedUser,
}

/// Result of verify-session. Absence of a session is not an error.
#[derive(Debug, Clone)]
pub enum Verification {
    Authenticated(AuthenticatedUser),
    Unauthenticated {
        /// Best-effort removal of a cookie that will never verify again.
        clear: Option<Cookie<'static>>,
    },
}

impl Verification {
    #[must_use]
    pub fn user(&self) -> Option<&AuthenticatedUser> {
        match self {
            Self::Authenticated(user) => Some(user),
            Self::Unauthenticated { .. } => None,
        }
    }
}

/// Result of logout. The cookie is cleared whether or not revocation succeeded.
#[derive(Debug, Clone)]
pub struct LoggedOut {
    pub cookie: Cookie<'static>,
    pub revoked: bool,
}

/// Immutable flow configuration, built once at process start.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub(crate) oauth: OAuthConfig,
    pub(crate) state_key: StateKey,
    pub(crate) app_base_url: Url,
    pub(crate) login_redirect: String,
    pub(crate) error_redirect: String,
    pub(crate) session_ttl: Duration,
    pub(crate) cookie_domain: Option<String>,
    pub(crate) state_cookie_path: String,
    pub(crate) outbound_timeout: Duration,
}

impl FlowSettings {
    /// Settings with defaults: landing `/`, failure page `/login`, 5-day
    /// sessions, host-only cookie, application served at the redirect URI's origin.
    #[must_use]
    pub fn new(oauth: OAuthConfig, state_key: StateKey) -> Self {
        let mut app_base_url = oauth.redirect_uri().clone();
        app_base_url.set_path("/");
        app_base_url.set_query(None);
        app_base_url.set_fragment(None);

        Self {
            oauth,
            state_key,
            app_base_url,
            login_redirect: "/".into(),
            error_redirect: "/login".into(),
            session_ttl: DEFAULT_SESSION_TTL,
            cookie_domain: None,
            state_cookie_path: "/".into(),
            outbound_timeout: DEFAULT_OUTBOUND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_app_base_url(mut self, url: Url) -> Self {
        self.app_base_url = url;
        self
    }

    /// Default landing path after sign-in when `start` had no return path.
    #[must_use]
    pub fn with_login_redirect(mut self, path: impl Into<String>) -> Self {
        self.login_redirect = path.into();
        self
    }

    /// Recoverable failure page; receives `?error=<code>`.
    #[must_use]
    pub fn with_error_redirect(mut self, path: impl Into<String>) -> Self {
        self.error_redirect = path.into();
        self
    }

    /// Replace the key that signs `state`. Share it across instances.
    #[must_use]
    pub fn with_state_key(mut self, key: StateKey) -> Self {
        self.state_key = key;
        self
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain;
        self
    }

    /// Path the state cookie is scoped to; the prefix of `start` and `callback`.
    #[must_use]
    pub fn with_state_cookie_path(mut self, path: impl Into<String>) -> Self {
        self.state_cookie_path = path.into();
        self
    }

    /// Bound on every provider and backend call.
    #[must_use]
    pub fn with_outbound_timeout(mut self, limit: Duration) -> Self {
        self.outbound_timeout = limit;
        self
    }

    #[must_use]
    pub fn oauth(&self) -> &OAuthConfig {
        &self.oauth
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    fn resolve(&self, path: &str) -> Url {
        self.app_base_url
            .join(path)
            .unwrap_or_else(|_| self.app_base_url.clone())
    }
}

/// Orchestrates start, callback, verify and logout.
pub struct FlowController<X, B> {
    settings: FlowSettings,
    codec: SessionCookieCodec,
    state_codec: StateCookieCodec,
    exchanger: X,
    verifier: AssertionVerifier,
    backend: B,
}

impl<X: TokenExchanger, B: IdentityBackend> FlowController<X, B> {
    #[must_use]
    pub fn new(settings: FlowSettings, exchanger: X, verifier: AssertionVerifier, backend: B) -> Self {
        let codec = SessionCookieCodec::new(settings.cookie_domain.clone(), settings.session_ttl);
        let state_codec = StateCookieCodec::new(settings.state_cookie_path.clone());
        Self {
            settings,
            codec,
            state_codec,
            exchanger,
            verifier,
            backend,
        }
    }

    #[must_use]
    pub fn codec(&self) -> &SessionCookieCodec {
        &self.codec
    }

    #[must_use]
    pub fn state_codec(&self) -> &StateCookieCodec {
        &self.state_codec
    }

    #[must_use]
    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Absolute failure destination for `error`, with the error code attached.
    #[must_use]
    pub fn failure_destination(&self, error: &FlowError) -> Url {
        let mut url = self.settings.resolve(&self.settings.error_redirect);
        url.set_query(Some(&format!("error={}", urlencoding::encode(error.code()))));
        url
    }

    /// Begin a flow: issue a signed `state`, build the provider URL and the
    /// cookie that binds the state to the calling browser.
    ///
    /// An unsafe `return_path` is dropped rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Start`] if the state token cannot be issued.
    pub fn start(&self, return_path: Option<&str>) -> Result<AuthorizationRedirect, FlowError> {
        let return_path = return_path.and_then(|raw| {
            let safe = sanitize_return_path(raw);
            if safe.is_none() {
                tracing::debug!("Dropping unsafe return path");
            }
            safe
        });

        let issued =
            state::issue(&self.settings.state_key, return_path.as_deref()).map_err(FlowError::Start)?;
        let url = self.settings.oauth.authorization_url(&issued.token);

        tracing::debug!(stage = %FlowStage::AwaitingProvider, "Redirecting to provider");
        Ok(AuthorizationRedirect {
            url,
            cookie: self.state_codec.encode(&issued.nonce),
        })
    }

    /// Complete a flow from the provider redirect.
    ///
    /// `state` is checked before anything else is trusted, and its nonce must
    /// equal `browser_nonce`, the value of the state cookie `start` set. On
    /// mismatch the token exchange is never attempted. The code is exchanged
    /// exactly once.
    ///
    /// # Errors
    ///
    /// Returns the [`FlowError`] that moved the instance to `Failed`. No
    /// session exists and no cookie is produced.
    pub async fn callback(
        &self,
        params: CallbackParams,
        browser_nonce: Option<&str>,
    ) -> Result<SessionIssued, FlowError> {
        if let Some(error) = params.error {
            let desc = params.error_description.as_deref().unwrap_or("Unknown error");
            tracing::warn!(error = %error, description = %desc, "OAuth2 error from provider");
            return Err(FlowError::ProviderDenied { error });
        }

        let raw_state = params
            .state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                tracing::warn!("OAuth callback without state");
                FlowError::StateMismatch
            })?;

        let auth_state = state::verify(&self.settings.state_key, &raw_state).map_err(|e| {
            tracing::warn!(error = %e, "OAuth state mismatch");
            FlowError::StateMismatch
        })?;

        if browser_nonce != Some(auth_state.nonce.as_str()) {
            tracing::warn!(
                cookie_present = browser_nonce.is_some(),
                "OAuth state not issued to this browser"
            );
            return Err(FlowError::StateMismatch);
        }

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or(FlowError::MissingCode)?;

        tracing::debug!(stage = %FlowStage::CallbackReceived, "Exchanging authorization code");

        let tokens = self
            .bounded(
                "token exchange",
                self.exchanger.exchange(&code, self.settings.oauth.redirect_uri()),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Token exchange failed");
                FlowError::TokenExchange(e)
            })?;

        let id_token = tokens.id_token.as_deref().ok_or_else(|| {
            FlowError::InvalidAssertion(Error::Assertion(
                "token response carried no id_token".into(),
            ))
        })?;

        let mut assertion = self
            .bounded("assertion verification", self.verifier.verify(id_token))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Identity assertion rejected");
                FlowError::InvalidAssertion(e)
            })?;

        if assertion.lacks_profile() {
            match self
                .bounded("userinfo request", self.exchanger.user_info(&tokens.access_token))
                .await
            {
                Ok(Some(info)) => assertion.merge_user_info(info).map_err(|e| {
                    tracing::warn!(error = %e, "Userinfo rejected");
                    FlowError::InvalidAssertion(e)
                })?,
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Userinfo unavailable; continuing without profile"),
            }
        }
        drop(tokens);

        let credential = match timeout(
            self.settings.outbound_timeout,
            self.backend.mint(&assertion, self.settings.session_ttl),
        )
        .await
        {
            Ok(Ok(credential)) => credential,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Session creation failed");
                return Err(FlowError::SessionUnavailable(e.to_string()));
            }
            Err(_) => {
                tracing::error!("Session creation timed out");
                return Err(FlowError::SessionUnavailable("timed out".into()));
            }
        };

        let landing = self.settings.resolve(
            auth_state
                .return_path
                .as_deref()
                .unwrap_or(&self.settings.login_redirect),
        );

        tracing::info!(
            subject = %assertion.subject,
            stage = %FlowStage::SessionIssued,
            "OAuth2 login successful"
        );

        Ok(SessionIssued {
            cookie: self.codec.encode(&credential),
            landing,
            user: assertion.to_user(),
        })
    }

    /// Verify the session credential from the request cookie.
    ///
    /// Always checks revocation. Invalid, expired and revoked credentials all
    /// look the same to the caller; only the logs tell them apart.
    pub async fn verify(&self, credential: Option<&SessionCredential>) -> Verification {
        let Some(credential) = credential else {
            tracing::debug!("No session cookie");
            return Verification::Unauthenticated { clear: None };
        };

        match timeout(
            self.settings.outbound_timeout,
            self.backend.verify(credential, true),
        )
        .await
        {
            Ok(Ok(user)) => Verification::Authenticated(user),
            Ok(Err(BackendError::Revoked)) => {
                tracing::warn!("Revoked session credential presented");
                Verification::Unauthenticated {
                    clear: Some(self.codec.clear()),
                }
            }
            Ok(Err(e @ (BackendError::Expired | BackendError::Invalid))) => {
                tracing::debug!(reason = %e, "Session credential rejected");
                Verification::Unauthenticated {
                    clear: Some(self.codec.clear()),
                }
            }
            // The credential may still be good; keep the cookie.
            Ok(Err(e @ BackendError::Unavailable(_))) => {
                tracing::error!(error = %e, "Session verification failed");
                Verification::Unauthenticated { clear: None }
            }
            Err(_) => {
                tracing::error!("Session verification timed out");
                Verification::Unauthenticated { clear: None }
            }
        }
    }

    /// Revoke every credential of the cookie's subject and clear the cookie.
    ///
    /// Idempotent. The subject is recovered even from an expired credential.
    /// The clearing cookie is returned even when revocation fails.
    pub async fn logout(&self, credential: Option<&SessionCredential>) -> LoggedOut {
        let mut revoked = false;

        if let Some(credential) = credential {
            match timeout(
                self.settings.outbound_timeout,
                self.backend.decode_subject(credential),
            )
            .await
            {
                Ok(Ok(subject)) => {
                    match timeout(
                        self.settings.outbound_timeout,
                        self.backend.revoke_all(&subject),
                    )
                    .await
                    {
                        Ok(Ok(())) => {
                            revoked = true;
                            tracing::info!(subject = %subject, "Sessions revoked on logout");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Session revocation failed during logout");
                        }
                        Err(_) => tracing::warn!("Session revocation timed out during logout"),
                    }
                }
                Ok(Err(e)) => tracing::debug!(reason = %e, "Logout with unidentifiable credential"),
                Err(_) => tracing::warn!("Credential decoding timed out during logout"),
            }
        }

        LoggedOut {
            cookie: self.codec.clear(),
            revoked,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        timeout(self.settings.outbound_timeout, call)
            .await
            .unwrap_or(Err(Error::Timeout { operation }))
    }
}
