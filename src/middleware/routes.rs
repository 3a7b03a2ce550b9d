use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, REFERRER_POLICY};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};

use super::error::AuthError;
use super::landing::landing_document;
use super::state::AuthState;
use crate::backend::IdentityBackend;
use crate::flow::{CallbackParams, Verification};
use crate::oauth::TokenExchanger;
use crate::types::AuthenticatedUser;

const NO_STORE: (axum::http::HeaderName, &str) = (CACHE_CONTROL, "no-store");

/// Create the session authentication router.
///
/// Mounts `start`, `callback`, `verify-session` and `logout` under the
/// configured auth path.
pub fn auth_routes<X, B>(state: AuthState<X, B>) -> Router
where
    X: TokenExchanger,
    B: IdentityBackend,
{
    let auth_path = state.auth_path.clone();

    Router::new()
        .route(&format!("{auth_path}/start"), get(start::<X, B>))
        .route(&format!("{auth_path}/callback"), get(callback::<X, B>))
        .route(
            &format!("{auth_path}/verify-session"),
            post(verify_session::<X, B>),
        )
        .route(&format!("{auth_path}/logout"), post(logout::<X, B>))
        .with_state(state)
}

// ── Start ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StartParams {
    return_to: Option<String>,
}

async fn start<X: TokenExchanger, B: IdentityBackend>(
    State(state): State<AuthState<X, B>>,
    jar: CookieJar,
    Query(params): Query<StartParams>,
) -> Result<impl IntoResponse, AuthError> {
    let controller = &state.controller;
    let redirect = controller
        .start(params.return_to.as_deref())
        .map_err(|error| AuthError::Flow {
            destination: controller.failure_destination(&error),
            error,
        })?;

    Ok((
        jar.add(redirect.cookie),
        [NO_STORE],
        Redirect::to(redirect.url.as_str()),
    ))
}

// ── Callback ───────────────────────────────────────────────────────

async fn callback<X: TokenExchanger, B: IdentityBackend>(
    State(state): State<AuthState<X, B>>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    let controller = &state.controller;
    let browser_nonce = controller.state_codec().decode(&jar);

    // The state cookie is single-use whatever the outcome.
    let jar = jar.add(controller.state_codec().clear());

    match controller.callback(params, browser_nonce.as_deref()).await {
        Ok(issued) => (
            jar.add(issued.cookie),
            [NO_STORE, (REFERRER_POLICY, "no-referrer")],
            Html(landing_document(&issued.landing)),
        )
            .into_response(),
        Err(error) => {
            let destination = controller.failure_destination(&error);
            (jar, AuthError::Flow { error, destination }).into_response()
        }
    }
}

// ── Verify session ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SessionStatus {
    authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<AuthenticatedUser>,
}

async fn verify_session<X: TokenExchanger, B: IdentityBackend>(
    State(state): State<AuthState<X, B>>,
    jar: CookieJar,
) -> impl IntoResponse {
    let controller = &state.controller;
    let credential = controller.codec().decode(&jar);

    let (jar, status) = match controller.verify(credential.as_ref()).await {
        Verification::Authenticated(user) => (
            jar,
            SessionStatus {
                authenticated: true,
                user: Some(user),
            },
        ),
        Verification::Unauthenticated { clear } => {
            let jar = match clear {
                Some(cookie) => jar.add(cookie),
                None => jar,
            };
            (
                jar,
                SessionStatus {
                    authenticated: false,
                    user: None,
                },
            )
        }
    };

    (jar, [NO_STORE], Json(status))
}

// ── Logout ─────────────────────────────────────────────────────────

async fn logout<X: TokenExchanger, B: IdentityBackend>(
    State(state): State<AuthState<X, B>>,
    jar: CookieJar,
) -> impl IntoResponse {
    let controller = &state.controller;
    let credential = controller.codec().decode(&jar);
    let out = controller.logout(credential.as_ref()).await;

    // `add`, not `remove`: the clearing cookie must carry the same
    // attributes as the one that set the session.
    (
        jar.add(out.cookie),
        [NO_STORE],
        Json(serde_json::json!({ "success": true })),
    )
}
