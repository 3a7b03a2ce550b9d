//! Identity backend: mints, verifies and revokes session credentials.
//!
//! The flow controller only talks to [`IdentityBackend`]. [`LocalIdentityBackend`]
//! is an in-process implementation: credentials are PASETO `v4.local` tokens
//! and revocation is a per-subject "valid after" watermark, so revoking a
//! subject invalidates every credential issued to it before that instant.
//!
//! Credentials carry no PASETO `exp`. Their lifetime is the custom
//! `expires_at` claim, checked in `verify` only, so that an expired
//! credential still authenticates far enough to be revoked on logout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::keys::SymmetricKey;
use pasetors::token::UntrustedToken;
use pasetors::version4::V4;
use pasetors::{Local, local};
use rand::Rng;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::RwLock;

use crate::assertion::IdentityAssertion;
use crate::error::Error;
use crate::state::{generate_nonce, parse_key_hex};
use crate::types::{AuthenticatedUser, SessionCredential, Subject};

const SESSION_AUDIENCE: &str = "session";
const IMPLICIT_ASSERTION: &[u8] = b"session-gate:session-credential";
const DEFAULT_ISSUER: &str = "session-gate";

/// Identity backend failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Malformed, forged, or minted under another key.
    #[error("Session credential invalid")]
    Invalid,

    /// TTL elapsed.
    #[error("Session credential expired")]
    Expired,

    /// Subject's credentials were revoked after this one was issued.
    #[error("Session credential revoked")]
    Revoked,

    /// Backend could not be reached or failed internally.
    #[error("Identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Session credential issuance and verification service.
///
/// # Example
///
/// ```rust,ignore
/// impl IdentityBackend for MyBackend {
///     async fn mint(&self, assertion: &IdentityAssertion, ttl: Duration)
///         -> Result<SessionCredential, BackendError> {
///         self.api.create_session_cookie(&assertion.subject, ttl).await
///     }
///     // ...
/// }
/// ```
pub trait IdentityBackend: Send + Sync + 'static {
    /// Mint a credential bound to the assertion's subject with a fixed TTL.
    fn mint(
        &self,
        assertion: &IdentityAssertion,
        ttl: Duration,
    ) -> impl Future<Output = Result<SessionCredential, BackendError>> + Send;

    /// Decode and validate a credential. With `check_revoked`, credentials
    /// issued before the subject's last revocation are rejected.
    fn verify(
        &self,
        credential: &SessionCredential,
        check_revoked: bool,
    ) -> impl Future<Output = Result<AuthenticatedUser, BackendError>> + Send;

    /// Authenticate the credential and return its subject, ignoring expiry.
    fn decode_subject(
        &self,
        credential: &SessionCredential,
    ) -> impl Future<Output = Result<Subject, BackendError>> + Send;

    /// Revoke every outstanding credential of `subject`.
    fn revoke_all(&self, subject: &Subject)
    -> impl Future<Output = Result<(), BackendError>> + Send;
}

struct OpenedCredential {
    user: AuthenticatedUser,
    expires_at: OffsetDateTime,
    issued_at_ns: i128,
}

/// In-process identity backend with PASETO credentials.
pub struct LocalIdentityBackend {
    key: [u8; 32],
    issuer: String,
    valid_after_ns: RwLock<HashMap<Subject, i128>>,
}

impl LocalIdentityBackend {
    /// Backend with a random key. Credentials die with the process.
    #[must_use]
    pub fn generate() -> Self {
        Self::with_key(rand::rng().random())
    }

    /// Parses a hex-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Key` if the hex is invalid or the key is not 32 bytes.
    pub fn from_hex(key_hex: &str) -> Result<Self, Error> {
        Ok(Self::with_key(parse_key_hex(key_hex)?))
    }

    fn with_key(key: [u8; 32]) -> Self {
        Self {
            key,
            issuer: DEFAULT_ISSUER.into(),
            valid_after_ns: RwLock::new(HashMap::new()),
        }
    }

    /// Override the `iss` claim stamped into credentials.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    fn symmetric(&self) -> Result<SymmetricKey<V4>, BackendError> {
        SymmetricKey::<V4>::from(&self.key[..])
            .map_err(|e| BackendError::Unavailable(format!("session key: {e}")))
    }

    fn now_ns() -> i128 {
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    }

    /// Decrypts and authenticates a credential without checking expiry.
    fn open(&self, credential: &SessionCredential) -> Result<OpenedCredential, BackendError> {
        let untrusted = UntrustedToken::<Local, V4>::try_from(credential.expose())
            .map_err(|_| BackendError::Invalid)?;

        let mut rules = ClaimsValidationRules::new();
        rules.allow_non_expiring();
        rules.validate_issuer_with(&self.issuer);
        rules.validate_audience_with(SESSION_AUDIENCE);

        let trusted = local::decrypt(
            &self.symmetric()?,
            &untrusted,
            &rules,
            None,
            Some(IMPLICIT_ASSERTION),
        )
        .map_err(|_| BackendError::Invalid)?;

        let claims = trusted.payload_claims().ok_or(BackendError::Invalid)?;
        let text = |name: &str| {
            claims
                .get_claim(name)
                .and_then(|v| v.as_str())
                .map(str::to_owned)
        };

        let subject = text("sub").ok_or(BackendError::Invalid)?;
        let expires_at = text("expires_at")
            .and_then(|s| OffsetDateTime::parse(&s, &Rfc3339).ok())
            .ok_or(BackendError::Invalid)?;
        let issued_at_ns = text("issued_at_ns")
            .and_then(|s| s.parse::<i128>().ok())
            .ok_or(BackendError::Invalid)?;

        let user = AuthenticatedUser {
            subject: Subject(subject),
            email: text("email"),
            display_name: text("name"),
            picture: text("picture"),
            email_verified: claims
                .get_claim("email_verified")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };

        Ok(OpenedCredential {
            user,
            expires_at,
            issued_at_ns,
        })
    }
}

impl std::fmt::Debug for LocalIdentityBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentityBackend")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

fn claim_error(e: pasetors::errors::Error) -> BackendError {
    BackendError::Unavailable(format!("claims: {e}"))
}

impl IdentityBackend for LocalIdentityBackend {
    async fn mint(
        &self,
        assertion: &IdentityAssertion,
        ttl: Duration,
    ) -> Result<SessionCredential, BackendError> {
        let user = assertion.to_user();
        let issued_at = OffsetDateTime::now_utc();
        let expires_at = time::Duration::try_from(ttl)
            .ok()
            .and_then(|ttl| issued_at.checked_add(ttl))
            .ok_or_else(|| BackendError::Unavailable("session ttl out of range".into()))?
            .format(&Rfc3339)
            .map_err(|e| BackendError::Unavailable(format!("expires_at: {e}")))?;

        let mut claims = Claims::new().map_err(claim_error)?;
        claims.non_expiring();
        claims.issuer(&self.issuer).map_err(claim_error)?;
        claims.audience(SESSION_AUDIENCE).map_err(claim_error)?;
        claims.subject(user.subject.as_str()).map_err(claim_error)?;
        claims
            .token_identifier(&generate_nonce())
            .map_err(claim_error)?;
        claims
            .add_additional("expires_at", expires_at)
            .map_err(claim_error)?;
        claims
            .add_additional("issued_at_ns", issued_at.unix_timestamp_nanos().to_string())
            .map_err(claim_error)?;
        claims
            .add_additional("email_verified", user.email_verified)
            .map_err(claim_error)?;
        for (name, value) in [
            ("email", user.email),
            ("name", user.display_name),
            ("picture", user.picture),
        ] {
            if let Some(value) = value {
                claims.add_additional(name, value).map_err(claim_error)?;
            }
        }

        local::encrypt(&self.symmetric()?, &claims, None, Some(IMPLICIT_ASSERTION))
            .map(SessionCredential::new)
            .map_err(claim_error)
    }

    async fn verify(
        &self,
        credential: &SessionCredential,
        check_revoked: bool,
    ) -> Result<AuthenticatedUser, BackendError> {
        let opened = self.open(credential)?;

        if opened.expires_at <= OffsetDateTime::now_utc() {
            return Err(BackendError::Expired);
        }

        if check_revoked {
            let watermarks = self.valid_after_ns.read().await;
            if let Some(&valid_after) = watermarks.get(&opened.user.subject) {
                if opened.issued_at_ns <= valid_after {
                    return Err(BackendError::Revoked);
                }
            }
        }

        Ok(opened.user)
    }

    async fn decode_subject(&self, credential: &SessionCredential) -> Result<Subject, BackendError> {
        self.open(credential).map(|opened| opened.user.subject)
    }

    async fn revoke_all(&self, subject: &Subject) -> Result<(), BackendError> {
        let now = Self::now_ns();
        let mut watermarks = self.valid_after_ns.write().await;
        let entry = watermarks.entry(subject.clone()).or_insert(now);
        *entry = (*entry).max(now);
        Ok(())
    }
}

// Lets the application keep a handle on a backend it also hands to the router.
impl<B: IdentityBackend> IdentityBackend for Arc<B> {
    fn mint(
        &self,
        assertion: &IdentityAssertion,
        ttl: Duration,
    ) -> impl Future<Output = Result<SessionCredential, BackendError>> + Send {
        (**self).mint(assertion, ttl)
    }

    fn verify(
        &self,
        credential: &SessionCredential,
        check_revoked: bool,
    ) -> impl Future<Output = Result<AuthenticatedUser, BackendError>> + Send {
        (**self).verify(credential, check_revoked)
    }

    fn decode_subject(
        &self,
        credential: &SessionCredential,
    ) -> impl Future<Output = Result<Subject, BackendError>> + Send {
        (**self).decode_subject(credential)
    }

    fn revoke_all(&self, subject: &Subject) -> impl Future<Output = Result<(), BackendError>> + Send {
        (**self).revoke_all(subject)
    }
}
