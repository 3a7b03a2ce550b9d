use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Deserializer};
use tokio::sync::RwLock;
use url::Url;

use crate::error::Error;
use crate::oauth::{ClientSecret, UserInfo};
use crate::types::{AuthenticatedUser, Subject};

const JWKS_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const CLOCK_SKEW_LEEWAY_SECS: u64 = 60;
const ASYMMETRIC_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Verified identity assertion from the provider's ID token.
///
/// Narrowed to a fixed set of claims immediately after verification. Transient:
/// it exists for the duration of one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAssertion {
    pub subject: Subject,
    pub issuer: String,
    pub audience: Vec<String>,
    pub issued_at: Option<i64>,
    pub expires_at: i64,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
}

impl IdentityAssertion {
    /// True when the ID token carried no profile claims worth showing.
    #[must_use]
    pub fn lacks_profile(&self) -> bool {
        self.email.is_none() && self.name.is_none()
    }

    /// Fill missing profile claims from userinfo.
    ///
    /// # Errors
    ///
    /// Returns `Error::Assertion` if userinfo describes a different subject.
    pub fn merge_user_info(&mut self, info: UserInfo) -> Result<(), Error> {
        if info.sub != self.subject.as_str() {
            return Err(Error::Assertion("userinfo subject mismatch".into()));
        }
        if self.email.is_none() {
            self.email = info.email;
            self.email_verified = info.email_verified.unwrap_or(false);
        }
        self.name = self.name.take().or(info.name);
        self.picture = self.picture.take().or(info.picture);
        Ok(())
    }

    /// The identity view bound into the session credential.
    #[must_use]
    pub fn to_user(&self) -> AuthenticatedUser {
        AuthenticatedUser {
            subject: self.subject.clone(),
            email: self.email.clone(),
            display_name: self.name.clone(),
            picture: self.picture.clone(),
            email_verified: self.email.is_some() && self.email_verified,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Deserialize)]
struct IdTokenClaims {
    sub: String,
    iss: String,
    aud: AudienceClaim,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_bool")]
    email_verified: Option<bool>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Some providers send `email_verified` as the string `"true"`.
pub(crate) fn deserialize_flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<Flexible>::deserialize(deserializer)? {
        Some(Flexible::Bool(b)) => Some(b),
        Some(Flexible::Text(s)) => Some(s.eq_ignore_ascii_case("true")),
        None => None,
    })
}

/// Where ID-token signing keys come from.
pub enum AssertionKeys {
    /// HS256 keyed with the client secret.
    ClientSecret(ClientSecret),
    /// Asymmetric keys published at the provider's JWKS endpoint.
    Jwks {
        url: Url,
        http: reqwest::Client,
        cache: RwLock<Option<(Instant, JwkSet)>>,
    },
}

/// Validates ID tokens against signature, issuer, audience and expiry.
pub struct AssertionVerifier {
    issuers: Vec<String>,
    audience: String,
    keys: AssertionKeys,
}

impl AssertionVerifier {
    /// Verify HS256 ID tokens signed with the OAuth client secret.
    #[must_use]
    pub fn with_client_secret(
        issuers: Vec<String>,
        client_id: impl Into<String>,
        secret: ClientSecret,
    ) -> Self {
        Self {
            issuers,
            audience: client_id.into(),
            keys: AssertionKeys::ClientSecret(secret),
        }
    }

    /// Verify asymmetrically signed ID tokens with keys from `jwks_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be initialised.
    pub fn with_jwks(
        issuers: Vec<String>,
        client_id: impl Into<String>,
        jwks_url: Url,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            issuers,
            audience: client_id.into(),
            keys: AssertionKeys::Jwks {
                url: jwks_url,
                http,
                cache: RwLock::new(None),
            },
        })
    }

    /// Verifies an ID token and narrows it to an [`IdentityAssertion`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Assertion` if the signature, issuer, audience or expiry
    /// is invalid, and `Error::Http`/`Error::Provider` if signing keys cannot
    /// be fetched.
    pub async fn verify(&self, id_token: &str) -> Result<IdentityAssertion, Error> {
        let header = decode_header(id_token)
            .map_err(|e| Error::Assertion(format!("invalid header: {e}")))?;

        let (algorithm, key) = match &self.keys {
            AssertionKeys::ClientSecret(secret) => {
                if header.alg != Algorithm::HS256 {
                    return Err(Error::Assertion(format!(
                        "unexpected algorithm {:?}",
                        header.alg
                    )));
                }
                (
                    Algorithm::HS256,
                    DecodingKey::from_secret(secret.expose().as_bytes()),
                )
            }
            AssertionKeys::Jwks { url, http, cache } => {
                if !ASYMMETRIC_ALGORITHMS.contains(&header.alg) {
                    return Err(Error::Assertion(format!(
                        "unexpected algorithm {:?}",
                        header.alg
                    )));
                }
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| Error::Assertion("missing header: kid".into()))?;
                (header.alg, jwks_key(url, http, cache, kid).await?)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&self.issuers);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;

        let claims = decode::<IdTokenClaims>(id_token, &key, &validation)
            .map_err(|e| Error::Assertion(e.to_string()))?
            .claims;

        if claims.sub.is_empty() {
            return Err(Error::Assertion("empty claim: sub".into()));
        }

        Ok(IdentityAssertion {
            subject: Subject(claims.sub),
            issuer: claims.iss,
            audience: match claims.aud {
                AudienceClaim::Single(a) => vec![a],
                AudienceClaim::Multiple(v) => v,
            },
            issued_at: claims.iat,
            expires_at: claims.exp,
            email: claims.email,
            email_verified: claims.email_verified.unwrap_or(false),
            name: claims.name,
            picture: claims.picture,
        })
    }
}

/// Looks up `kid` in the cached key set, refetching once on a miss to follow
/// provider key rotation.
async fn jwks_key(
    url: &Url,
    http: &reqwest::Client,
    cache: &RwLock<Option<(Instant, JwkSet)>>,
    kid: &str,
) -> Result<DecodingKey, Error> {
    {
        let guard = cache.read().await;
        if let Some((fetched_at, set)) = guard.as_ref() {
            if fetched_at.elapsed() < JWKS_CACHE_TTL {
                if let Some(jwk) = set.find(kid) {
                    return DecodingKey::from_jwk(jwk)
                        .map_err(|e| Error::Assertion(format!("unusable jwk: {e}")));
                }
            }
        }
    }

    let response = http.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(Error::Provider {
            operation: "jwks fetch",
            status: Some(response.status().as_u16()),
            detail: String::new(),
        });
    }
    let set: JwkSet = response.json().await?;
    tracing::debug!(keys = set.keys.len(), "Refreshed provider signing keys");

    let key = set
        .find(kid)
        .ok_or_else(|| Error::Assertion(format!("no signing key for kid '{kid}'")))
        .and_then(|jwk| {
            DecodingKey::from_jwk(jwk).map_err(|e| Error::Assertion(format!("unusable jwk: {e}")))
        });

    *cache.write().await = Some((Instant::now(), set));
    key
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const ISSUER: &str = "https://accounts.example.com";
    const CLIENT_ID: &str = "client-1";
    const SECRET: &str = "client-secret";

    fn now() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn valid_claims() -> serde_json::Value {
        json!({
            "sub": "u1",
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "iat": now(),
            "exp": now() + 3600,
            "email": "u1@example.com",
            "email_verified": true,
            "name": "User One",
            "picture": "https://example.com/u1.png"
        })
    }

    fn verifier() -> AssertionVerifier {
        AssertionVerifier::with_client_secret(
            vec![ISSUER.into()],
            CLIENT_ID,
            ClientSecret::new(SECRET),
        )
    }

    #[tokio::test]
    async fn valid_token_is_narrowed_to_assertion() {
        let assertion = verifier()
            .verify(&sign(valid_claims(), SECRET))
            .await
            .unwrap();

        assert_eq!(assertion.subject.as_str(), "u1");
        assert_eq!(assertion.issuer, ISSUER);
        assert_eq!(assertion.audience, vec![CLIENT_ID.to_string()]);
        assert_eq!(assertion.email.as_deref(), Some("u1@example.com"));
        assert!(assertion.email_verified);

        let user = assertion.to_user();
        assert_eq!(user.display_name.as_deref(), Some("User One"));
        assert_eq!(user.picture.as_deref(), Some("https://example.com/u1.png"));
    }

    #[tokio::test]
    async fn audience_list_is_accepted_when_it_contains_client() {
        let mut claims = valid_claims();
        claims["aud"] = json!(["other", CLIENT_ID]);
        let assertion = verifier().verify(&sign(claims, SECRET)).await.unwrap();
        assert_eq!(assertion.audience.len(), 2);
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let mut claims = valid_claims();
        claims["aud"] = json!("someone-else");
        assert!(matches!(
            verifier().verify(&sign(claims, SECRET)).await,
            Err(Error::Assertion(_))
        ));
    }

    #[tokio::test]
    async fn wrong_issuer_is_rejected() {
        let mut claims = valid_claims();
        claims["iss"] = json!("https://evil.example.com");
        assert!(verifier().verify(&sign(claims, SECRET)).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let mut claims = valid_claims();
        claims["exp"] = json!(now() - 3600);
        assert!(verifier().verify(&sign(claims, SECRET)).await.is_err());
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let token = sign(valid_claims(), "not-the-secret");
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn missing_subject_is_rejected() {
        let mut claims = valid_claims();
        claims.as_object_mut().unwrap().remove("sub");
        assert!(verifier().verify(&sign(claims, SECRET)).await.is_err());
    }

    #[tokio::test]
    async fn string_email_verified_is_understood() {
        let mut claims = valid_claims();
        claims["email_verified"] = json!("true");
        let assertion = verifier().verify(&sign(claims, SECRET)).await.unwrap();
        assert!(assertion.email_verified);
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        assert!(verifier().verify("not-a-jwt").await.is_err());
    }

    #[tokio::test]
    async fn jwks_fetch_failure_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let verifier = AssertionVerifier::with_jwks(
            vec![ISSUER.into()],
            CLIENT_ID,
            format!("{}/certs", server.uri()).parse().unwrap(),
            Duration::from_secs(2),
        )
        .unwrap();

        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","kid":"k1","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(valid_claims().to_string());
        let token = format!("{header}.{payload}.c2ln");

        assert!(matches!(
            verifier.verify(&token).await,
            Err(Error::Provider { status: Some(503), .. })
        ));
    }

    #[tokio::test]
    async fn jwks_verifier_rejects_symmetric_tokens() {
        let verifier = AssertionVerifier::with_jwks(
            vec![ISSUER.into()],
            CLIENT_ID,
            "https://keys.example.com/certs".parse().unwrap(),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(
            verifier.verify(&sign(valid_claims(), SECRET)).await,
            Err(Error::Assertion(_))
        ));
    }

    #[test]
    fn userinfo_fills_missing_profile() {
        let mut assertion = IdentityAssertion {
            subject: Subject::from("u1"),
            issuer: ISSUER.into(),
            audience: vec![CLIENT_ID.into()],
            issued_at: None,
            expires_at: now() + 60,
            email: None,
            email_verified: false,
            name: None,
            picture: None,
        };
        assert!(assertion.lacks_profile());

        let info: UserInfo = serde_json::from_value(json!({
            "sub": "u1",
            "email": "u1@example.com",
            "email_verified": true,
            "name": "User One"
        }))
        .unwrap();
        assertion.merge_user_info(info).unwrap();

        assert_eq!(assertion.email.as_deref(), Some("u1@example.com"));
        assert!(assertion.email_verified);
        assert_eq!(assertion.name.as_deref(), Some("User One"));

        let other: UserInfo = serde_json::from_value(json!({ "sub": "u2" })).unwrap();
        assert!(assertion.merge_user_info(other).is_err());
    }
}
