//! Session token authentication.
//!
//! Every job gets a JWT scoped to exactly one session. Tokens are signed with
//! a secret generated at startup, so a restart invalidates all of them.

mod claims;
mod error;
mod middleware;

pub use claims::SessionClaims;
pub use error::AuthError;
pub use middleware::{
    SESSION_TOKEN_HEADER, SESSION_TOKEN_QUERY, SessionGrant, SessionTokens, session_auth_middleware,
};
