use std::sync::Arc;

use axum::extract::FromRef;

use super::extractor::SessionGuard;
use crate::backend::IdentityBackend;
use crate::flow::FlowController;
use crate::oauth::TokenExchanger;

/// Shared state for auth route handlers.
pub struct AuthState<X, B> {
    pub(super) controller: Arc<FlowController<X, B>>,
    pub(super) auth_path: String,
}

impl<X: TokenExchanger, B: IdentityBackend> AuthState<X, B> {
    /// Mount `controller` under `auth_path` (e.g. `/api/auth`).
    #[must_use]
    pub fn new(auth_path: impl Into<String>, controller: FlowController<X, B>) -> Self {
        Self {
            controller: Arc::new(controller),
            auth_path: auth_path.into(),
        }
    }

    /// Handle for protecting application routes with [`AuthUser`](super::AuthUser).
    #[must_use]
    pub fn guard(&self) -> SessionGuard {
        SessionGuard::new(self.controller.clone())
    }

    #[must_use]
    pub fn controller(&self) -> &FlowController<X, B> {
        &self.controller
    }
}

// Manual Clone: avoid derive adding `X: Clone, B: Clone` bounds.
impl<X, B> Clone for AuthState<X, B> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            auth_path: self.auth_path.clone(),
        }
    }
}

impl<X: TokenExchanger, B: IdentityBackend> FromRef<AuthState<X, B>> for SessionGuard {
    fn from_ref(state: &AuthState<X, B>) -> Self {
        state.guard()
    }
}
