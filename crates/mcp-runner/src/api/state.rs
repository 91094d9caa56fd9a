//! Application state shared by all handlers.

use std::sync::Arc;

use crate::auth::SessionTokens;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub tokens: Arc<SessionTokens>,
    /// Externally reachable base URL, without trailing slash.
    pub public_url: Arc<str>,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionManager>,
        tokens: Arc<SessionTokens>,
        public_url: impl AsRef<str>,
    ) -> Self {
        Self {
            sessions,
            tokens,
            public_url: Arc::from(public_url.as_ref().trim_end_matches('/')),
        }
    }

    /// URL a client uses to (re)attach to a session.
    pub fn session_url(&self, token: &str) -> String {
        format!(
            "{}/mcp/sse?token={}",
            self.public_url,
            urlencoding::encode(token)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerRuntime;
    use crate::session::SessionManagerConfig;
    use std::time::Duration;

    #[test]
    fn test_session_url_encodes_token() {
        let sessions = SessionManager::new(
            Arc::new(ContainerRuntime::with_type(Default::default())),
            SessionManagerConfig::default(),
        );
        let tokens = Arc::new(SessionTokens::new("runner", Duration::from_secs(60)));
        let state = AppState::new(sessions, tokens, "https://runner.example/");

        assert_eq!(
            state.session_url("a.b+c"),
            "https://runner.example/mcp/sse?token=a.b%2Bc"
        );
    }
}
