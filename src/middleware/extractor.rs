use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, OptionalFromRequestParts};
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;

use super::error::AuthError;
use crate::backend::IdentityBackend;
use crate::cookie::SessionCookieCodec;
use crate::flow::{FlowController, Verification};
use crate::oauth::TokenExchanger;
use crate::types::{AuthenticatedUser, SessionCredential};

/// Authenticated user extracted from the session cookie.
///
/// Use as an Axum extractor in route handlers. Returns `401 Unauthorized`
/// if no valid session exists. Revocation is checked on every request.
///
/// # Example
///
/// ```rust,ignore
/// async fn protected(AuthUser(user): AuthUser) -> impl IntoResponse {
///     format!("Hello, {}", user.subject)
/// }
///
/// // Optional: accessible to both authenticated and anonymous users
/// async fn public(user: Option<AuthUser>) -> impl IntoResponse {
///     match user {
///         Some(AuthUser(u)) => format!("Hello, {}", u.subject),
///         None => "Hello, guest".to_string(),
///     }
/// }
///
/// let app = Router::new()
///     .route("/me", get(protected))
///     .with_state(auth_state.guard());
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser(pub AuthenticatedUser);

/// Type-erased session verifier for application routes.
///
/// Obtained from [`AuthState::guard`](super::AuthState::guard); implement
/// `FromRef<YourState>` for it to use [`AuthUser`] with your own state.
#[derive(Clone)]
pub struct SessionGuard {
    verifier: Arc<dyn SessionVerifierDyn>,
    codec: SessionCookieCodec,
}

impl SessionGuard {
    pub(super) fn new<X: TokenExchanger, B: IdentityBackend>(
        controller: Arc<FlowController<X, B>>,
    ) -> Self {
        let codec = controller.codec().clone();
        Self {
            verifier: controller,
            codec,
        }
    }

    /// Verify the session cookie in `jar`.
    pub async fn resolve(&self, jar: &CookieJar) -> Verification {
        let credential = self.codec.decode(jar);
        self.verifier.verify_dyn(credential.as_ref()).await
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    SessionGuard: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let guard = SessionGuard::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);

        match guard.resolve(&jar).await {
            Verification::Authenticated(user) => Ok(Self(user)),
            Verification::Unauthenticated { .. } => Err(AuthError::Unauthenticated),
        }
    }
}

impl<S> OptionalFromRequestParts<S> for AuthUser
where
    SessionGuard: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        let guard = SessionGuard::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        Ok(guard.resolve(&jar).await.user().cloned().map(Self))
    }
}

/// Object-safe wrapper for the flow controller's verify (needed for Arc<dyn>).
pub(super) trait SessionVerifierDyn: Send + Sync {
    fn verify_dyn<'a>(
        &'a self,
        credential: Option<&'a SessionCredential>,
    ) -> Pin<Box<dyn Future<Output = Verification> + Send + 'a>>;
}

impl<X: TokenExchanger, B: IdentityBackend> SessionVerifierDyn for FlowController<X, B> {
    fn verify_dyn<'a>(
        &'a self,
        credential: Option<&'a SessionCredential>,
    ) -> Pin<Box<dyn Future<Output = Verification> + Send + 'a>> {
        Box::pin(self.verify(credential))
    }
}
