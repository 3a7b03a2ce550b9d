#![doc = include_str!("../README.md")]

pub mod assertion;
pub mod backend;
pub mod cookie;
pub mod error;
pub mod flow;
pub mod middleware;
pub mod oauth;
pub mod state;
pub mod types;

// Re-exports for convenient access
pub use assertion::{AssertionVerifier, IdentityAssertion};
pub use backend::{BackendError, IdentityBackend, LocalIdentityBackend};
pub use cookie::{
    DEFAULT_SESSION_TTL, SESSION_COOKIE_NAME, STATE_COOKIE_NAME, SessionCookieCodec, StateCookieCodec,
};
pub use error::Error;
pub use flow::{
    CallbackParams, FlowController, FlowError, FlowSettings, FlowStage, LoggedOut, SessionIssued,
    Verification,
};
pub use oauth::{ClientSecret, OAuthConfig, ProviderClient, TokenExchanger, TokenResponse, UserInfo};
pub use state::StateKey;
pub use types::{AuthenticatedUser, SessionCredential, Subject};
