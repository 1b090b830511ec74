//! JWT mint/verify for the relay's REST surface (spec §4.8, §6, §7a).

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// JWT claims: `publicKey`, `name?`, `jti`, standard `exp` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub jti: String,
    pub exp: usize,
}

/// One reason an `Authorization: Bearer` request was rejected (§7a). All map
/// to 401; kept distinct only for logging and the "one each" boundary test
/// in spec §8.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    Missing,
    #[error("malformed Authorization header")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("invalid token")]
    Invalid,
}

pub fn mint_token(
    secret: &str,
    public_key: &str,
    name: Option<&str>,
    expiry_seconds: u64,
) -> anyhow::Result<(String, DateTime<Utc>, String)> {
    let jti = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + chrono::Duration::seconds(expiry_seconds as i64);
    let claims = Claims {
        public_key: public_key.to_string(),
        name: name.map(str::to_string),
        jti: jti.clone(),
        exp: expires_at.timestamp() as usize,
    };

    let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))?;
    Ok((token, expires_at, jti))
}

/// Decodes and validates signature/expiry only; revocation is checked
/// separately by the caller against the [`crate::registry::Registry`] (I6).
pub fn decode_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid,
        })
}

/// Extracts the bearer token from an `Authorization` header value.
pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::Missing)?;
    header.strip_prefix("Bearer ").filter(|token| !token.is_empty()).ok_or(AuthError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_decode_round_trips_claims() {
        let (token, _expires_at, jti) = mint_token("secret", "pk-1", Some("agent"), 3600).unwrap();
        let claims = decode_token("secret", &token).unwrap();
        assert_eq!(claims.public_key, "pk-1");
        assert_eq!(claims.name.as_deref(), Some("agent"));
        assert_eq!(claims.jti, jti);
    }

    #[test]
    fn expired_token_is_rejected() {
        let (token, _, _) = mint_token("secret", "pk-1", None, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(decode_token("secret", &token), Err(AuthError::Expired)));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let (token, _, _) = mint_token("secret", "pk-1", None, 3600).unwrap();
        assert!(matches!(decode_token("other-secret", &token), Err(AuthError::Invalid)));
    }

    #[test]
    fn missing_header_is_missing() {
        assert!(matches!(extract_bearer(None), Err(AuthError::Missing)));
    }

    #[test]
    fn malformed_header_is_malformed() {
        assert!(matches!(extract_bearer(Some("Token abc")), Err(AuthError::Malformed)));
        assert!(matches!(extract_bearer(Some("Bearer ")), Err(AuthError::Malformed)));
    }

    #[test]
    fn well_formed_header_extracts_token() {
        assert_eq!(extract_bearer(Some("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
    }
}
