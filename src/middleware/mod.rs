//! Axum integration: auth routes, session guard and extractor.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use session_gate::LocalIdentityBackend;
//! use session_gate::middleware::{AuthConfig, AuthUser, auth_routes};
//!
//! // 1. Configure from environment
//! let config = AuthConfig::from_env()?;
//!
//! // 2. Pick an identity backend
//! let state = config.into_state(LocalIdentityBackend::generate())?;
//!
//! // 3. Mount auth routes and protect your own
//! let app = axum::Router::new()
//!     .route("/api/me", get(|AuthUser(user): AuthUser| async move { Json(user) }))
//!     .with_state(state.guard())
//!     .merge(auth_routes(state));
//! ```

mod config;
mod error;
mod extractor;
mod landing;
mod routes;
mod state;

pub use config::{AuthConfig, IdTokenKeys};
pub use error::AuthError;
pub use extractor::{AuthUser, SessionGuard};
pub use routes::auth_routes;
pub use state::AuthState;
