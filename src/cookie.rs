use std::time::Duration;

use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};

use crate::state::STATE_TTL;
use crate::types::SessionCredential;

/// Session cookie name on the wire.
pub const SESSION_COOKIE_NAME: &str = "session";

/// Fixed session lifetime: 5 days, no refresh.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Session cookie codec.
///
/// Every cookie it writes carries the same attribute set: `HttpOnly`,
/// `Secure`, `SameSite=Lax`, `Path=/`, and the configured `Domain`. Clearing
/// differs only in the empty value and `Max-Age=0`; a browser ignores a
/// removal whose attributes do not match the original.
#[derive(Debug, Clone)]
pub struct SessionCookieCodec {
    name: String,
    domain: Option<String>,
    ttl: Duration,
}

impl SessionCookieCodec {
    /// `domain` is the registrable parent domain shared by all subdomains,
    /// or `None` for a host-only cookie.
    #[must_use]
    pub fn new(domain: Option<String>, ttl: Duration) -> Self {
        Self {
            name: SESSION_COOKIE_NAME.into(),
            domain: domain
                .map(|d| d.trim_start_matches('.').to_owned())
                .filter(|d| !d.is_empty()),
            ttl,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn build(&self, value: String, max_age: time::Duration) -> Cookie<'static> {
        let mut builder = Cookie::build((self.name.clone(), value))
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(max_age);
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Cookie carrying the credential for the session TTL.
    #[must_use]
    pub fn encode(&self, credential: &SessionCredential) -> Cookie<'static> {
        let seconds = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        self.build(
            credential.expose().to_owned(),
            time::Duration::seconds(seconds),
        )
    }

    /// Credential from the request cookies, if present and non-empty.
    #[must_use]
    pub fn decode(&self, jar: &CookieJar) -> Option<SessionCredential> {
        jar.get(&self.name)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
            .map(SessionCredential::new)
    }

    /// Cookie that expires the session immediately.
    #[must_use]
    pub fn clear(&self) -> Cookie<'static> {
        self.build(String::new(), time::Duration::ZERO)
    }
}

/// Name of the cookie binding a pending `state` to the browser that started it.
pub const STATE_COOKIE_NAME: &str = "session_gate_state";

/// Short-lived cookie carrying the `state` nonce between `start` and `callback`.
///
/// Host-only and scoped to the auth routes, so it never accompanies
/// application requests.
#[derive(Debug, Clone)]
pub struct StateCookieCodec {
    path: String,
}

impl StateCookieCodec {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path: if path.is_empty() { "/".into() } else { path },
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn build(&self, value: String, max_age: time::Duration) -> Cookie<'static> {
        Cookie::build((STATE_COOKIE_NAME, value))
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
            .path(self.path.clone())
            .max_age(max_age)
            .build()
    }

    /// Cookie holding `nonce` for as long as the state itself is accepted.
    #[must_use]
    pub fn encode(&self, nonce: &str) -> Cookie<'static> {
        let seconds = i64::try_from(STATE_TTL.as_secs()).unwrap_or(i64::MAX);
        self.build(nonce.to_owned(), time::Duration::seconds(seconds))
    }

    #[must_use]
    pub fn decode(&self, jar: &CookieJar) -> Option<String> {
        jar.get(STATE_COOKIE_NAME)
            .map(|c| c.value().to_owned())
            .filter(|v| !v.is_empty())
    }

    #[must_use]
    pub fn clear(&self) -> Cookie<'static> {
        self.build(String::new(), time::Duration::ZERO)
    }
}
