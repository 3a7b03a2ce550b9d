use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Provider subject identifier (the `sub` claim of the identity assertion).
///
/// Stable per user at the provider. It is the only identity key the session
/// credential is bound to and the unit of revocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct Subject(pub String);

impl Subject {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque session credential minted by the identity backend.
///
/// The application stores, transmits and revokes it but never parses it.
/// `Debug` is redacted so the credential cannot leak through logs.
#[derive(Clone, PartialEq, Eq, From, Into)]
pub struct SessionCredential(String);

impl SessionCredential {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw credential value, for the cookie codec and the backend only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCredential(<redacted>)")
    }
}

/// Identity claims returned to callers of verify-session.
///
/// Derived from the session credential on every verification; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub subject: Subject,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
}

impl AuthenticatedUser {
    /// Create a view with only the required `subject`.
    #[must_use]
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            email: None,
            display_name: None,
            picture: None,
            email_verified: false,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.email = Some(email.into());
        self.email_verified = verified;
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_picture(mut self, picture: impl Into<String>) -> Self {
        self.picture = Some(picture.into());
        self
    }
}
