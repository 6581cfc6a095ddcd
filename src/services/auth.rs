use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims carried by a Vayam session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub exp: usize,
}

/// Verifies HS256 session tokens issued by the web app.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Returns the authenticated user's id.
    pub fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        let data = decode::<SessionClaims>(token, &self.key, &self.validation)
            .map_err(AuthError::InvalidToken)?;
        Ok(data.claims.sub)
    }

    /// Parse an `Authorization` header value of the form `Bearer <token>`.
    pub fn verify_header(&self, header: Option<&str>) -> Result<Uuid, AuthError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid session token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}
