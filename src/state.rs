//! Stateless anti-forgery `state` parameter.
//!
//! The authorization request state (nonce, optional return path, issue time)
//! travels through the provider inside the `state` query parameter as a
//! PASETO `v4.local` token. Only this server holds the key, so a token that
//! decrypts and validates is proof it was issued by a prior `start`. Nothing
//! is stored server-side between `start` and `callback`, which lets any
//! instance behind a load balancer handle either step.
//!
//! The nonce is also handed to the browser that called `start`, in a
//! short-lived cookie. A state is only accepted alongside that cookie, so a
//! state captured from one browser cannot complete a flow in another.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::keys::SymmetricKey;
use pasetors::token::UntrustedToken;
use pasetors::version4::V4;
use pasetors::{Local, local};
use rand::Rng;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Error;

/// How long a user may spend at the provider before the state goes stale.
pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);

const STATE_AUDIENCE: &str = "oauth-state";
const IMPLICIT_ASSERTION: &[u8] = b"session-gate:authorization-state";
const MAX_RETURN_PATH_LEN: usize = 2048;

/// 256-bit key protecting the `state` parameter.
#[derive(Clone)]
pub struct StateKey {
    bytes: [u8; 32],
}

impl StateKey {
    /// Generate a random key. States issued with it die with the process.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            bytes: rand::rng().random(),
        }
    }

    /// Parses a hex-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Key` if the hex is invalid or the key is not 32 bytes.
    pub fn from_hex(key_hex: &str) -> Result<Self, Error> {
        Ok(Self {
            bytes: parse_key_hex(key_hex)?,
        })
    }

    fn symmetric(&self) -> Result<SymmetricKey<V4>, Error> {
        SymmetricKey::<V4>::from(&self.bytes[..]).map_err(|e| Error::Key(e.to_string()))
    }
}

impl std::fmt::Debug for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateKey(<redacted>)")
    }
}

/// Parses a hex-encoded 32-byte symmetric key.
pub(crate) fn parse_key_hex(key_hex: &str) -> Result<[u8; 32], Error> {
    let bytes =
        hex::decode(key_hex.trim()).map_err(|e| Error::Key(format!("invalid hex: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::Key(format!(
            "invalid key length: expected 32, got {}",
            bytes.len()
        ))
    })
}

/// Decoded authorization request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationState {
    pub nonce: String,
    pub return_path: Option<String>,
    pub issued_at: OffsetDateTime,
}

/// Generates a cryptographically random nonce.
///
/// Returns a 22-character URL-safe string (16 random bytes → base64url).
#[must_use]
pub fn generate_nonce() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// A freshly issued `state` and the nonce sealed inside it.
#[derive(Debug, Clone)]
pub struct IssuedState {
    pub token: String,
    pub nonce: String,
}

/// Issues a new `state` value carrying a fresh nonce and the return path.
///
/// # Errors
///
/// Returns `Error::State` if the token cannot be built or encrypted.
pub fn issue(key: &StateKey, return_path: Option<&str>) -> Result<IssuedState, Error> {
    let nonce = generate_nonce();
    let mut claims =
        Claims::new_expires_in(&STATE_TTL).map_err(|e| Error::State(e.to_string()))?;
    claims
        .audience(STATE_AUDIENCE)
        .map_err(|e| Error::State(e.to_string()))?;
    claims
        .add_additional("nonce", nonce.as_str())
        .map_err(|e| Error::State(e.to_string()))?;
    if let Some(path) = return_path {
        claims
            .add_additional("return_path", path)
            .map_err(|e| Error::State(e.to_string()))?;
    }

    let token = local::encrypt(&key.symmetric()?, &claims, None, Some(IMPLICIT_ASSERTION))
        .map_err(|e| Error::State(e.to_string()))?;
    Ok(IssuedState { token, nonce })
}

/// Verifies a `state` value received at the callback.
///
/// Pure function of the key and the token: no server-side lookup.
///
/// # Errors
///
/// Returns `Error::State` if the token is malformed, was not issued with
/// `key`, has been tampered with, or has expired.
pub fn verify(key: &StateKey, state: &str) -> Result<AuthorizationState, Error> {
    if !state.starts_with("v4.local.") {
        return Err(Error::State("invalid token format".into()));
    }

    let untrusted = UntrustedToken::<Local, V4>::try_from(state)
        .map_err(|e| Error::State(e.to_string()))?;

    // exp, nbf and iat are validated by default
    let mut rules = ClaimsValidationRules::new();
    rules.validate_audience_with(STATE_AUDIENCE);

    let trusted = local::decrypt(
        &key.symmetric()?,
        &untrusted,
        &rules,
        None,
        Some(IMPLICIT_ASSERTION),
    )
    .map_err(|e| Error::State(e.to_string()))?;

    let claims = trusted
        .payload_claims()
        .ok_or_else(|| Error::State("missing payload".into()))?;

    let nonce = claims
        .get_claim("nonce")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::State("missing claim: nonce".into()))?
        .to_owned();

    let return_path = claims
        .get_claim("return_path")
        .and_then(|v| v.as_str())
        .and_then(sanitize_return_path);

    let issued_at = claims
        .get_claim("iat")
        .and_then(|v| v.as_str())
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        .ok_or_else(|| Error::State("missing claim: iat".into()))?;

    Ok(AuthorizationState {
        nonce,
        return_path,
        issued_at,
    })
}

/// Accepts only same-origin absolute paths, so the landing navigation can
/// never be pointed at another host.
#[must_use]
pub fn sanitize_return_path(raw: &str) -> Option<String> {
    let acceptable = raw.starts_with('/')
        && !raw.starts_with("//")
        && !raw.contains('\\')
        && raw.len() <= MAX_RETURN_PATH_LEN
        && !raw.chars().any(char::is_control);
    acceptable.then(|| raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_state_verifies_with_same_key() {
        let key = StateKey::generate();
        let issued = issue(&key, Some("/notes/42")).unwrap();

        let decoded = verify(&key, &issued.token).unwrap();
        assert_eq!(decoded.nonce.len(), 22);
        assert_eq!(decoded.nonce, issued.nonce);
        assert_eq!(decoded.return_path.as_deref(), Some("/notes/42"));
        assert!(decoded.issued_at <= OffsetDateTime::now_utc());
    }

    #[test]
    fn state_without_return_path() {
        let key = StateKey::generate();
        let state = issue(&key, None).unwrap().token;
        assert_eq!(verify(&key, &state).unwrap().return_path, None);
    }

    #[test]
    fn each_state_carries_a_fresh_nonce() {
        let key = StateKey::generate();
        let s1 = verify(&key, &issue(&key, None).unwrap().token).unwrap();
        let s2 = verify(&key, &issue(&key, None).unwrap().token).unwrap();
        assert_ne!(s1.nonce, s2.nonce);
    }

    #[test]
    fn state_from_another_key_is_rejected() {
        let state = issue(&StateKey::generate(), None).unwrap().token;
        assert!(verify(&StateKey::generate(), &state).is_err());
    }

    #[test]
    fn tampered_state_is_rejected() {
        let key = StateKey::generate();
        let state = issue(&key, None).unwrap().token;

        let mut bytes = state.into_bytes();
        let last = bytes.len() - 5;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(verify(&key, &tampered).is_err());
    }

    #[test]
    fn empty_and_garbage_states_are_rejected() {
        let key = StateKey::generate();
        assert!(verify(&key, "").is_err());
        assert!(verify(&key, "S1").is_err());
        assert!(verify(&key, "v4.local.not-a-token").is_err());
    }

    #[test]
    fn key_from_hex() {
        let key = StateKey::from_hex(&"ab".repeat(32)).unwrap();
        let state = issue(&key, None).unwrap().token;
        let same = StateKey::from_hex(&"ab".repeat(32)).unwrap();
        assert!(verify(&same, &state).is_ok());
    }

    #[test]
    fn key_from_hex_rejects_bad_input() {
        assert!(StateKey::from_hex("zz").is_err());
        assert!(StateKey::from_hex(&"ab".repeat(16)).is_err());
    }

    #[test]
    fn return_path_sanitising() {
        assert_eq!(sanitize_return_path("/").as_deref(), Some("/"));
        assert_eq!(
            sanitize_return_path("/a/b?c=d#e").as_deref(),
            Some("/a/b?c=d#e")
        );
        assert!(sanitize_return_path("").is_none());
        assert!(sanitize_return_path("https://evil.example").is_none());
        assert!(sanitize_return_path("//evil.example").is_none());
        assert!(sanitize_return_path("/\\evil.example").is_none());
        assert!(sanitize_return_path("/a\nb").is_none());
        assert!(sanitize_return_path(&format!("/{}", "a".repeat(4096))).is_none());
    }
}
