//! Registry of active and recently stopped sessions.
//!
//! Stopped sessions keep a lightweight record for a retention window so that
//! late requests see "stopped" instead of "not found".

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, watch};

use mcp_runner_protocol::CloseReason;

use super::bridge::{McpSession, SessionSettings};
use crate::container::{CloseEvent, ContainerRuntimeApi, RunSpec};

/// Prefix of generated session ids.
pub const SESSION_ID_PREFIX: &str = "ses_";

#[derive(Debug, Error)]
pub enum SessionError {
    /// The id was never issued or its record was already swept.
    #[error("session not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Registry record of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub container_name: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<CloseReason>,
    pub exit_code: Option<i32>,
}

/// Result of [`SessionManager::get_session`].
pub enum SessionLookup {
    Active {
        info: SessionInfo,
        session: McpSession,
    },
    Stopped {
        info: SessionInfo,
    },
}

impl SessionLookup {
    pub fn info(&self) -> &SessionInfo {
        match self {
            SessionLookup::Active { info, .. } | SessionLookup::Stopped { info } => info,
        }
    }
}

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// How often stopped records are swept.
    pub gc_interval: Duration,
    /// How long a stopped record is kept.
    pub stopped_retention: Duration,
    pub session: SessionSettings,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(30),
            stopped_retention: Duration::from_secs(5 * 60),
            session: SessionSettings::default(),
        }
    }
}

struct SessionRecord {
    info: SessionInfo,
    /// Dropped once the session stops.
    session: Option<McpSession>,
}

pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: SessionManagerConfig,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    shutdown: watch::Sender<bool>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: SessionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            sessions: RwLock::new(HashMap::new()),
            shutdown: watch::Sender::new(false),
        })
    }

    /// Start a session for a run spec and register it.
    pub async fn create_session(self: &Arc<Self>, spec: RunSpec) -> McpSession {
        let id = format!("{SESSION_ID_PREFIX}{}", nanoid::nanoid!());
        let session = McpSession::start(
            id.clone(),
            Arc::clone(&self.runtime),
            spec,
            self.config.session.clone(),
        );

        let info = SessionInfo {
            id: id.clone(),
            container_name: session.container().name().to_string(),
            created_at: Utc::now(),
            status: SessionStatus::Active,
            stopped_at: None,
            stop_reason: None,
            exit_code: None,
        };

        self.sessions.write().await.insert(
            id.clone(),
            SessionRecord {
                info,
                session: Some(session.clone()),
            },
        );
        info!("Created session {}", id);

        let manager = Arc::clone(self);
        let watched = session.clone();
        tokio::spawn(async move {
            let event = watched.wait_closed().await;
            manager.mark_stopped(watched.id(), event).await;
        });

        session
    }

    async fn mark_stopped(&self, id: &str, event: CloseEvent) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(id) {
            record.session = None;
            record.info.status = SessionStatus::Stopped;
            record.info.stopped_at = Some(Utc::now());
            record.info.stop_reason = Some(event.reason);
            record.info.exit_code = event.exit_code;
            debug!("Session {} marked stopped ({})", id, event.reason);
        }
    }

    /// Look up a session. Unknown ids are an error, stopped ones are not.
    pub async fn get_session(&self, id: &str) -> Result<SessionLookup, SessionError> {
        let sessions = self.sessions.read().await;
        let record = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        Ok(match &record.session {
            Some(session) if !session.is_stopped() => SessionLookup::Active {
                info: record.info.clone(),
                session: session.clone(),
            },
            // Stopped but the close watcher has not updated the record yet.
            Some(session) => {
                let mut info = record.info.clone();
                info.status = SessionStatus::Stopped;
                if let Some(event) = session.close_event() {
                    info.stop_reason = Some(event.reason);
                    info.exit_code = event.exit_code;
                }
                SessionLookup::Stopped { info }
            }
            None => SessionLookup::Stopped {
                info: record.info.clone(),
            },
        })
    }

    /// Stop a session by id.
    pub async fn stop_session(&self, id: &str) -> Result<(), SessionError> {
        match self.get_session(id).await? {
            SessionLookup::Active { session, .. } => session.stop().await,
            SessionLookup::Stopped { .. } => debug!("Session {} already stopped", id),
        }
        Ok(())
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|r| r.info.clone()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|r| r.session.as_ref().is_some_and(|s| !s.is_stopped()))
            .count()
    }

    /// Delete stopped records older than the retention window.
    ///
    /// Returns the number of records removed.
    pub async fn sweep_stopped(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.stopped_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - retention;

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| {
            !matches!(record.info.stopped_at, Some(stopped_at) if stopped_at <= cutoff)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!("Swept {} stopped session record(s)", removed);
        }
        removed
    }

    /// Periodically sweep stopped records until shutdown.
    pub async fn gc_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        // `wait_for` yields a `watch::Ref`; it is dropped here so the loop
        // stays `Send`.
        let shutdown = async move {
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.gc_interval) => {
                    self.sweep_stopped().await;
                }
                _ = &mut shutdown => {
                    info!("Session GC loop shutting down");
                    break;
                }
            }
        }
    }

    /// Stop every live session and the GC loop.
    pub async fn shutdown(&self) {
        info!("Shutting down session manager");
        self.shutdown.send_replace(true);

        let live: Vec<McpSession> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter_map(|r| r.session.clone())
                .collect()
        };

        futures::future::join_all(live.iter().map(|session| session.stop())).await;
    }
}
