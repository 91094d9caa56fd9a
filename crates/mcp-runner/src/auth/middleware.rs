//! Session token issuing, validation and the axum middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use super::{AuthError, SessionClaims};

/// Header accepted as an alternative to `Authorization: Bearer`.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Query parameter carrying the token (EventSource cannot set headers).
pub const SESSION_TOKEN_QUERY: &str = "token";

fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == SESSION_TOKEN_QUERY {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Issues and validates session tokens for one runner instance.
pub struct SessionTokens {
    instance_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl SessionTokens {
    /// Create a signer with a fresh random secret.
    pub fn new(instance_id: impl Into<String>, ttl: Duration) -> Self {
        let secret: [u8; 32] = rand::random();
        Self::with_secret(instance_id, &secret, ttl)
    }

    pub fn with_secret(instance_id: impl Into<String>, secret: &[u8], ttl: Duration) -> Self {
        Self {
            instance_id: instance_id.into(),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Sign a token granting access to one session.
    pub fn issue(&self, session_id: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: session_id.to_string(),
            iss: self.instance_id.clone(),
            aud: self.instance_id.clone(),
            exp: now + self.ttl.as_secs() as i64,
            iat: now,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("failed to sign session token: {e}")))
    }

    /// Validate signature, expiry, issuer and audience.
    pub fn validate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&[&self.instance_id]);
        validation.set_audience(&[&self.instance_id]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let token_data =
            decode::<SessionClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                debug!("Session token rejected: {:?}", e);
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    _ => AuthError::InvalidToken(e.to_string()),
                }
            })?;

        Ok(token_data.claims)
    }
}

/// The session a request is authorized for, injected by
/// [`session_auth_middleware`].
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session_id: String,
    /// The raw token, for building reconnect URLs.
    pub token: String,
}

impl<S> FromRequestParts<S> for SessionGrant
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionGrant>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Authentication middleware for session routes.
///
/// Token sources in priority order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `X-Session-Token` header
/// 3. `token` query parameter
pub async fn session_auth_middleware(
    State(tokens): State<Arc<SessionTokens>>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = if let Some(header) = auth_header {
        bearer_token_from_header(header)?.to_string()
    } else if let Some(token) = req
        .headers()
        .get(SESSION_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        token.to_string()
    } else if let Some(token) = req.uri().query().and_then(token_from_query) {
        token
    } else {
        return Err(AuthError::MissingToken);
    };

    let claims = tokens.validate(&token).inspect_err(|e| {
        warn!("Rejected session token on {}: {}", req.uri().path(), e);
    })?;

    req.extensions_mut().insert(SessionGrant {
        session_id: claims.sub,
        token,
    });

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn test_issue_and_validate() {
        let tokens = SessionTokens::new("runner-a", DAY);
        let token = tokens.issue("ses_123").unwrap();
        let claims = tokens.validate(&token).unwrap();
        assert_eq!(claims.session_id(), "ses_123");
        assert_eq!(claims.iss, "runner-a");
        assert_eq!(claims.aud, "runner-a");
        assert_eq!(claims.exp - claims.iat, DAY.as_secs() as i64);
    }

    #[test]
    fn test_rejects_other_instance() {
        let secret = b"shared-secret-for-test";
        let a = SessionTokens::with_secret("runner-a", secret, DAY);
        let b = SessionTokens::with_secret("runner-b", secret, DAY);
        let token = a.issue("ses_1").unwrap();
        assert!(matches!(b.validate(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_rejects_other_secret() {
        let a = SessionTokens::new("runner-a", DAY);
        let b = SessionTokens::new("runner-a", DAY);
        let token = a.issue("ses_1").unwrap();
        assert!(b.validate(&token).is_err());
        assert!(a.validate("not-a-jwt").is_err());
    }

    #[test]
    fn test_rejects_expired() {
        let tokens = SessionTokens::new("runner-a", DAY);
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: "ses_1".to_string(),
            iss: "runner-a".to_string(),
            aud: "runner-a".to_string(),
            exp: now - 3600,
            iat: now - 7200,
            jti: "j".to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &tokens.encoding_key).unwrap();
        assert!(matches!(tokens.validate(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_bearer_token_from_header() {
        assert_eq!(bearer_token_from_header("Bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token_from_header("bearer abc").unwrap(), "abc");
        assert!(bearer_token_from_header("Basic abc").is_err());
        assert!(bearer_token_from_header("Bearer").is_err());
        assert!(bearer_token_from_header("Bearer a b").is_err());
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query("a=1&token=x%2Ey").as_deref(), Some("x.y"));
        assert_eq!(token_from_query("a=1"), None);
    }
}
