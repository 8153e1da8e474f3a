#![forbid(unsafe_code)]

// Credential verification for connections that present a bearer token

use super::IdentityRole;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    InvalidToken,
    TokenExpired,
    NotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "Authentication not configured"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    #[serde(default)]
    pub role: IdentityRole,
    pub exp: usize,
}

/// What a successful verification yields. The directory turns this into a
/// connection-scoped [`Identity`](super::Identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub account_id: String,
    pub display_name: String,
    pub role: IdentityRole,
}

/// Pluggable credential check used by the connection handshake.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// HS256 JWT verification against a shared secret.
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<VerifiedIdentity, AuthError> {
        let claims = validate_token(credential, &self.secret)?;
        Ok(VerifiedIdentity {
            account_id: claims.sub,
            display_name: claims.name,
            role: claims.role,
        })
    }
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;

    Ok(data.claims)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) fn mint(sub: &str, name: &str, role: IdentityRole, lifetime_secs: i64, secret: &str) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let claims = Claims {
            sub: sub.to_string(),
            name: name.to_string(),
            role,
            exp: (now + lifetime_secs).max(0) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_verify_valid_token() {
        let secret = "test-secret-at-least-32-bytes-long!!";
        let token = mint("account-123", "Alice", IdentityRole::Admin, 900, secret);
        let verified = JwtVerifier::new(secret).verify(&token).unwrap();
        assert_eq!(verified.account_id, "account-123");
        assert_eq!(verified.display_name, "Alice");
        assert_eq!(verified.role, IdentityRole::Admin);
    }

    #[test]
    fn test_role_claim_defaults_to_guest() {
        let secret = "secret";
        let claims = serde_json::json!({ "sub": "a", "name": "Bob", "exp": 4_000_000_000u64 });
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap();
        assert_eq!(validate_token(&token, secret).unwrap().role, IdentityRole::Guest);
    }

    #[test]
    fn test_wrong_secret_rejects() {
        let token = mint("a", "Alice", IdentityRole::User, 900, "secret-1");
        assert_eq!(JwtVerifier::new("secret-2").verify(&token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_expired_token_rejects() {
        // Default validation allows 60s of leeway
        let token = mint("a", "Alice", IdentityRole::User, -3600, "secret");
        assert_eq!(JwtVerifier::new("secret").verify(&token), Err(AuthError::TokenExpired));
    }

    #[test]
    fn test_garbage_token_rejects() {
        assert_eq!(validate_token("not.a.jwt", "secret").unwrap_err(), AuthError::InvalidToken);
    }
}
