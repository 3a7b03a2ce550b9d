//! Standalone sign-in server.
//!
//! Serves the auth routes plus `GET /api/me`, which returns the signed-in
//! user or `401`.

use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use session_gate::middleware::{AuthConfig, AuthUser, auth_routes};
use session_gate::{AuthenticatedUser, LocalIdentityBackend};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

async fn me(AuthUser(user): AuthUser) -> Json<AuthenticatedUser> {
    Json(user)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("session_gate=info,tower_http=info")),
        )
        .init();

    let config = AuthConfig::from_env().context("loading auth configuration")?;

    let backend = match std::env::var("SESSION_KEY") {
        Ok(key) => LocalIdentityBackend::from_hex(&key).context("SESSION_KEY")?,
        Err(_) => {
            tracing::warn!("SESSION_KEY not set; sessions will not survive a restart");
            LocalIdentityBackend::generate()
        }
    };

    let state = config.into_state(backend)?;

    let app = Router::new()
        .route("/api/me", get(me))
        .with_state(state.guard())
        .merge(auth_routes(state))
        .layer(TraceLayer::new_for_http());

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!("session-gate listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutting down server");
        })
        .await?;

    Ok(())
}
