use std::path::Path;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Principal;

/// Access token lifetime for tokens minted by `issue_access_token`.
const ACCESS_TOKEN_TTL_SECS: i64 = 900;

/// JWT claims carried by a gateway access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: i64,
    pub username: String,
    pub full_name: String,
    #[serde(default)]
    pub picture_url: Option<String>,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Load or generate the JWT signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/jwt_secret.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue an access token for a principal.
///
/// Token issuance belongs to the account service; this exists for tests and
/// local tooling that need a token the gateway will accept.
pub fn issue_access_token(
    secret: &[u8],
    principal: &Principal,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: principal.id,
        username: principal.username.clone(),
        full_name: principal.full_name.clone(),
        picture_url: principal.picture_url.clone(),
        iat: now,
        exp: now + ACCESS_TOKEN_TTL_SECS,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Validate an access token and return its claims.
pub fn validate_access_token(
    secret: &[u8],
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(token_data.claims)
}

/// Resolve the principal for a websocket handshake.
/// Any missing, malformed or expired token yields `None`.
pub fn authenticate(secret: &[u8], token: Option<&str>) -> Option<Principal> {
    let token = token.filter(|t| !t.is_empty())?;
    match validate_access_token(secret, token) {
        Ok(claims) => Some(claims.into()),
        Err(err) => {
            tracing::warn!(error = %err, "Rejected gateway token");
            None
        }
    }
}
