//! Login access tokens: HS256 JWTs carrying the user id and a purpose.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// Purpose claim of tokens minted at login; nothing else authenticates a
/// socket.
pub const PURPOSE_LOGIN: &str = "user_login";

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub purpose: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verify `token` and return the user it was issued to.
pub fn verify_access_token(secret: &str, token: &str) -> Result<Uuid, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp"]);

    let data = jsonwebtoken::decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "access token rejected");
        ApiError::unauthorized("Invalid or expired token")
    })?;

    if data.claims.purpose != PURPOSE_LOGIN {
        return Err(ApiError::unauthorized("Token purpose mismatch"));
    }

    Uuid::parse_str(&data.claims.user_id)
        .map_err(|_| ApiError::unauthorized("Invalid user id in token"))
}

/// Mint a login token for `user_id` valid for `ttl_secs`.
pub fn issue_access_token(secret: &str, user_id: Uuid, ttl_secs: i64) -> Result<String, ApiError> {
    let now = Utc::now().timestamp();
    let claims = AccessClaims {
        user_id: user_id.to_string(),
        purpose: PURPOSE_LOGIN.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::internal(format!("token signing failed: {e}")))
}
