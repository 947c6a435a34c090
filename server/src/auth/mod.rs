pub mod jwt;

use serde::{Deserialize, Serialize};

/// The authenticated user attached to a gateway connection.
///
/// Serialized verbatim as the `sender` object of success and broadcast frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub picture_url: Option<String>,
}

impl From<jwt::Claims> for Principal {
    fn from(claims: jwt::Claims) -> Self {
        Self {
            id: claims.sub,
            username: claims.username,
            full_name: claims.full_name,
            picture_url: claims.picture_url,
        }
    }
}
