//! JWT claims of a session token.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Session id.
    pub sub: String,
    /// Runner instance that issued the token.
    pub iss: String,
    /// Runner instance the token is valid for (same as `iss`).
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    /// Unique token id.
    pub jti: String,
}

impl SessionClaims {
    pub fn session_id(&self) -> &str {
        &self.sub
    }
}
