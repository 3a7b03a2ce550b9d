#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{Request, Response, StatusCode};
use axum::routing::get;
use axum::Json;
use axum_extra::extract::cookie::Cookie;
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use session_gate::middleware::{AuthConfig, AuthUser, IdTokenKeys, auth_routes};
use session_gate::{
    AuthenticatedUser, ClientSecret, DEFAULT_SESSION_TTL, LocalIdentityBackend, OAuthConfig,
    STATE_COOKIE_NAME, StateKey,
};
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ISSUER: &str = "https://accounts.example.com";
pub const CLIENT_ID: &str = "client-1";
pub const SECRET: &str = "client-secret";
pub const REDIRECT_URI: &str = "https://app.example.com/api/auth/callback";

pub struct TestApp {
    pub router: Router,
    pub provider: MockServer,
    /// The router's own backend, for minting credentials out of band.
    pub backend: Arc<LocalIdentityBackend>,
}

/// What a browser holds after `/start`: the `state` on the provider URL and
/// the value of the state cookie.
pub struct Started {
    pub state: String,
    pub nonce: String,
}

pub fn id_token(subject: &str) -> String {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    encode(
        &Header::new(Algorithm::HS256),
        &json!({
            "sub": subject,
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "iat": now,
            "exp": now + 3600,
            "email": format!("{subject}@example.com"),
            "email_verified": true,
            "name": "Test User",
        }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn me(AuthUser(user): AuthUser) -> Json<AuthenticatedUser> {
    Json(user)
}

impl TestApp {
    /// App whose token endpoint accepts `code` values mapped to subjects.
    pub async fn spawn(codes: &[(&str, &str)]) -> Self {
        Self::spawn_with_ttl(codes, DEFAULT_SESSION_TTL).await
    }

    pub async fn spawn_with_ttl(codes: &[(&str, &str)], session_ttl: Duration) -> Self {
        let provider = MockServer::start().await;

        for (code, subject) in codes {
            Mock::given(method("POST"))
                .and(path("/token"))
                .and(body_string_contains(format!("code={code}&")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": format!("at-{subject}"),
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "id_token": id_token(subject),
                })))
                .with_priority(1)
                .mount(&provider)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .with_priority(10)
            .mount(&provider)
            .await;

        let base: Url = provider.uri().parse().unwrap();
        let oauth = OAuthConfig::new(
            CLIENT_ID,
            ClientSecret::new(SECRET),
            REDIRECT_URI.parse().unwrap(),
        )
        .with_token_url(base.join("/token").unwrap())
        .with_userinfo_url(base.join("/userinfo").unwrap());

        let backend = Arc::new(LocalIdentityBackend::generate());
        let state = AuthConfig::new(oauth, StateKey::generate())
            .with_issuers(vec![ISSUER.into()])
            .with_id_token_keys(IdTokenKeys::ClientSecret)
            .with_cookie_domain("example.com")
            .with_session_ttl(session_ttl)
            .into_state(backend.clone())
            .unwrap();

        let router = Router::new()
            .route("/api/me", get(me))
            .with_state(state.guard())
            .merge(auth_routes(state));

        Self {
            router,
            provider,
            backend,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post(&self, uri: &str, session: Option<&str>) -> Response<Body> {
        let mut builder = Request::post(uri);
        if let Some(value) = session {
            builder = builder.header(COOKIE, format!("session={value}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn start(&self, return_to: Option<&str>) -> Started {
        let uri = match return_to {
            Some(r) => format!("/api/auth/start?return_to={}", urlencoding::encode(r)),
            None => "/api/auth/start".into(),
        };
        let resp = self.get(&uri).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        Started {
            state: query_param(&location(&resp), "state").expect("state on provider URL"),
            nonce: state_cookie(&resp).expect("state cookie").value().to_string(),
        }
    }

    /// Provider redirect back to the browser that ran `started`.
    pub async fn callback(&self, code: &str, started: &Started) -> Response<Body> {
        let query = format!(
            "code={}&state={}",
            urlencoding::encode(code),
            urlencoding::encode(&started.state)
        );
        self.callback_with(&query, Some(&started.nonce)).await
    }

    /// Raw callback request; `nonce` is the state cookie the browser sends, if any.
    pub async fn callback_with(&self, query: &str, nonce: Option<&str>) -> Response<Body> {
        let mut builder = Request::get(format!("/api/auth/callback?{query}"));
        if let Some(value) = nonce {
            builder = builder.header(COOKIE, format!("{STATE_COOKIE_NAME}={value}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Complete a sign-in and return the session cookie value.
    pub async fn sign_in(&self, code: &str) -> String {
        let started = self.start(None).await;
        let resp = self.callback(code, &started).await;
        assert_eq!(resp.status(), StatusCode::OK);
        session_cookie(&resp).expect("session cookie").value().to_string()
    }

    pub async fn token_requests(&self) -> usize {
        self.provider
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/token")
            .count()
    }
}

pub fn location(resp: &Response<Body>) -> String {
    resp.headers()
        .get(LOCATION)
        .expect("Location header")
        .to_str()
        .unwrap()
        .to_string()
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    let url: Url = url.parse().ok()?;
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn set_cookies(resp: &Response<Body>) -> Vec<String> {
    resp.headers()
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

pub fn find_cookie(resp: &Response<Body>, name: &str) -> Option<Cookie<'static>> {
    set_cookies(resp)
        .into_iter()
        .filter_map(|raw| Cookie::parse(raw).ok())
        .find(|c| c.name() == name)
}

pub fn session_cookie(resp: &Response<Body>) -> Option<Cookie<'static>> {
    find_cookie(resp, "session")
}

pub fn state_cookie(resp: &Response<Body>) -> Option<Cookie<'static>> {
    find_cookie(resp, STATE_COOKIE_NAME)
}

/// Raw `Set-Cookie` value for `name`.
pub fn raw_cookie(resp: &Response<Body>, name: &str) -> Option<String> {
    set_cookies(resp)
        .into_iter()
        .find(|raw| raw.starts_with(&format!("{name}=")))
}

/// Cookie attributes other than the value and `Max-Age`, sorted.
pub fn attributes(raw: &str) -> Vec<String> {
    let mut attrs: Vec<String> = raw
        .split(';')
        .skip(1)
        .map(|a| a.trim().to_string())
        .filter(|a| !a.starts_with("Max-Age") && !a.starts_with("Expires"))
        .collect();
    attrs.sort();
    attrs
}

pub async fn body_text(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    serde_json::from_str(&body_text(resp).await).unwrap()
}
