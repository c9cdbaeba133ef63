//! Authorization gate for the WebSocket handshake.
//!
//! Two credential shapes are accepted from the query string:
//!   - `ws_token`: a short-lived HMAC-SHA256 token minted by the REST API for
//!     exactly this purpose. Its 60-second max age limits the exposure of a
//!     token that appears in a connection URL or access log.
//!   - `token`: a general-purpose HS256 access token, validated by signature
//!     and the standard `exp` claim.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use jsonwebtoken::{DecodingKey, Validation, decode};
use sha2::Sha256;
use thiserror::Error;

use courier_types::api::Claims;

/// Close code for a bad, expired or missing credential.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;
/// Close code for an authenticated user who is not friends with the partner.
pub const CLOSE_NOT_FRIENDS: u16 = 4403;

pub const WS_TOKEN_MAX_AGE_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing, malformed or expired credential")]
    Unauthenticated,
    #[error("users are not friends")]
    NotFriends,
}

type HmacSha256 = Hmac<Sha256>;

/// Resolve a user id from handshake query parameters, preferring the
/// short-lived `ws_token` over the general `token`.
pub fn authenticate(secret: &str, params: &HashMap<String, String>) -> Result<i64, AuthError> {
    if let Some(ws_token) = params.get("ws_token") {
        return verify_ws_token(secret, ws_token);
    }
    let token = params.get("token").ok_or(AuthError::Unauthenticated)?;
    verify_access_token(secret, token)
}

/// Mint a WebSocket handshake token: `base64url(user_id|expiry|hmac_hex)`.
pub fn issue_ws_token(secret: &str, user_id: i64) -> String {
    let exp = unix_now() + WS_TOKEN_MAX_AGE_SECS;
    sign_ws_token(secret, user_id, exp)
}

fn sign_ws_token(secret: &str, user_id: i64, exp: u64) -> String {
    let payload = format!("{}|{}", user_id, exp);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    URL_SAFE_NO_PAD.encode(format!("{}|{}", payload, signature))
}

/// Verify signature and max age, returning the bound user id.
pub fn verify_ws_token(secret: &str, token: &str) -> Result<i64, AuthError> {
    let decoded = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|_| AuthError::Unauthenticated)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Unauthenticated)?;

    let mut parts = decoded.splitn(3, '|');
    let (user_part, exp_part, sig_part) = match (parts.next(), parts.next(), parts.next()) {
        (Some(u), Some(e), Some(s)) => (u, e, s),
        _ => return Err(AuthError::Unauthenticated),
    };

    let user_id: i64 = user_part.parse().map_err(|_| AuthError::Unauthenticated)?;
    let exp: u64 = exp_part.parse().map_err(|_| AuthError::Unauthenticated)?;
    if exp < unix_now() {
        return Err(AuthError::Unauthenticated);
    }

    let signature = hex::decode(sig_part).map_err(|_| AuthError::Unauthenticated)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{}|{}", user_part, exp_part).as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::Unauthenticated)?;

    Ok(user_id)
}

/// Validate a general-purpose access token (signature + `exp` claim).
pub fn verify_access_token(secret: &str, token: &str) -> Result<i64, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims.sub)
    .map_err(|_| AuthError::Unauthenticated)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_token_round_trip() {
        let token = issue_ws_token("secret", 42);
        assert_eq!(verify_ws_token("secret", &token).unwrap(), 42);
    }

    #[test]
    fn ws_token_rejects_tampering_and_wrong_secret() {
        let token = issue_ws_token("secret", 42);
        assert!(verify_ws_token("other-secret", &token).is_err());

        // Flip the bound user id while keeping the original signature.
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(&token).unwrap()).unwrap();
        let forged = decoded.replacen("42|", "43|", 1);
        let forged = URL_SAFE_NO_PAD.encode(forged);
        assert!(verify_ws_token("secret", &forged).is_err());

        assert!(verify_ws_token("secret", "not-base64!!").is_err());
    }

    #[test]
    fn ws_token_expires() {
        let stale = sign_ws_token("secret", 42, unix_now() - 1);
        assert!(verify_ws_token("secret", &stale).is_err());
    }

    #[test]
    fn authenticate_prefers_ws_token() {
        let mut params = HashMap::new();
        params.insert("ws_token".to_string(), issue_ws_token("secret", 7));
        params.insert("token".to_string(), "garbage".to_string());
        assert_eq!(authenticate("secret", &params).unwrap(), 7);

        let empty = HashMap::new();
        assert!(matches!(
            authenticate("secret", &empty),
            Err(AuthError::Unauthenticated)
        ));
    }
}
