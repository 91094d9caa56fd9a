//! Dispatch of control-plane requests.
//!
//! Independent of the transport: requests come in through
//! [`RunnerHandler::handle`], everything the runner has to say goes into the
//! outbound queue, which the connection loop drains whenever it is connected.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use mcp_runner_protocol::{
    LaunchParamsRequest, MessageBatch, RunnerCapabilities, RunnerIdentity, RunnerToServer,
    ServerToRunner, StartJobRequest, StartJobResponse, control::SUPPORTS_DOCKER_IMAGES,
};

use crate::api::AppState;
use crate::container::RunSpec;
use crate::launch::LaunchParamsResolver;
use crate::session::McpSession;

pub struct RunnerHandler {
    state: AppState,
    resolver: Arc<LaunchParamsResolver>,
    capabilities: RunnerCapabilities,
    /// Live sessions by server run id.
    runs: DashMap<String, McpSession>,
    outbound: mpsc::UnboundedSender<RunnerToServer>,
    identity: Mutex<Option<RunnerIdentity>>,
    /// Id of the outstanding `runner.set_config` request.
    pending_config: Mutex<Option<String>>,
}

impl RunnerHandler {
    pub fn new(
        state: AppState,
        resolver: Arc<LaunchParamsResolver>,
        tags: Vec<String>,
        max_concurrent_jobs: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RunnerToServer>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let capabilities = RunnerCapabilities {
            attributes: vec![SUPPORTS_DOCKER_IMAGES.to_string()],
            tags,
            max_concurrent_jobs,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let handler = Arc::new(Self {
            state,
            resolver,
            capabilities,
            runs: DashMap::new(),
            outbound,
            identity: Mutex::new(None),
            pending_config: Mutex::new(None),
        });
        (handler, outbound_rx)
    }

    /// Identity announced by the control plane on the last connection.
    pub fn identity(&self) -> Option<RunnerIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    fn send(&self, message: RunnerToServer) {
        if self.outbound.send(message).is_err() {
            error!("Control-plane outbound queue is closed");
        }
    }

    /// Handle one request. Slow work is moved to background tasks so that
    /// messages of a run keep their order.
    pub async fn handle(self: &Arc<Self>, message: ServerToRunner) {
        match message {
            ServerToRunner::Initialize(identity) => self.on_initialize(identity),
            ServerToRunner::Response {
                id, success, error, ..
            } => self.on_response(&id, success, error),
            ServerToRunner::Execute { id, job } => {
                let reply = match self.execute(job).await {
                    Ok(response) => match serde_json::to_value(response) {
                        Ok(data) => RunnerToServer::success(id, data),
                        Err(e) => RunnerToServer::failure(id, e.to_string()),
                    },
                    Err(message) => RunnerToServer::failure(id, message),
                };
                self.send(reply);
            }
            ServerToRunner::ResolveLaunchParams { id, request } => {
                let handler = Arc::clone(self);
                tokio::spawn(async move { handler.resolve_launch_params(id, request).await });
            }
            ServerToRunner::CloseRun { server_run_id } => {
                match self.runs.get(&server_run_id).map(|r| r.value().clone()) {
                    Some(session) => {
                        info!("Control plane closed run {}", server_run_id);
                        tokio::spawn(async move { session.stop().await });
                    }
                    None => debug!("run.close for unknown run {}", server_run_id),
                }
            }
            ServerToRunner::RunMessage {
                server_run_id,
                message,
            } => {
                let Some(session) = self.runs.get(&server_run_id).map(|r| r.value().clone())
                else {
                    debug!("Dropping message for unknown run {}", server_run_id);
                    return;
                };
                match serde_json::from_value::<MessageBatch>(message) {
                    Ok(batch) => session.incoming_message(batch.into_vec()),
                    Err(e) => warn!("Invalid MCP message for run {}: {}", server_run_id, e),
                }
            }
        }
    }

    fn on_initialize(&self, identity: RunnerIdentity) {
        info!(
            "Control plane identified runner as {} ({})",
            identity.name, identity.identifier
        );
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = Some(identity);

        let id = uuid::Uuid::new_v4().to_string();
        *self.pending_config.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.clone());
        self.send(RunnerToServer::SetConfig {
            id,
            config: self.capabilities.clone(),
        });
    }

    fn on_response(&self, id: &str, success: bool, error: Option<String>) {
        let was_config = {
            let mut pending = self.pending_config.lock().unwrap_or_else(|e| e.into_inner());
            if pending.as_deref() == Some(id) {
                pending.take();
                true
            } else {
                false
            }
        };

        if !was_config {
            debug!("Ignoring response to unknown request {}", id);
            return;
        }

        if success {
            info!("Runner configuration accepted, ready for jobs");
            self.send(RunnerToServer::Ready);
        } else {
            error!(
                "Control plane rejected runner configuration: {}",
                error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    async fn execute(self: &Arc<Self>, job: StartJobRequest) -> Result<StartJobResponse, String> {
        let active = self.state.sessions.active_count().await;
        let max = self.capabilities.max_concurrent_jobs as usize;
        if active >= max {
            warn!(
                "Refusing run {}: at capacity ({}/{})",
                job.server_run_id, active, max
            );
            return Err(format!("Runner at capacity ({active}/{max} jobs)"));
        }

        let spec = RunSpec::from_job(&job);
        spec.validate().map_err(|e| e.to_string())?;

        let session = self.state.sessions.create_session(spec).await;
        let token = match self.state.tokens.issue(session.id()) {
            Ok(token) => token,
            Err(e) => {
                session.stop().await;
                return Err(e.to_string());
            }
        };

        info!(
            "Run {} started as session {}",
            job.server_run_id,
            session.id()
        );
        self.runs.insert(job.server_run_id.clone(), session.clone());
        self.spawn_forwarder(job.server_run_id, session);

        Ok(StartJobResponse {
            url: self.state.public_url.to_string(),
            token,
        })
    }

    /// Relay a session's messages, logs and close event to the control plane.
    fn spawn_forwarder(self: &Arc<Self>, server_run_id: String, session: McpSession) {
        let mut outgoing = session.subscribe_outgoing();
        let mut logs = session.subscribe_logs();
        let handler = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(message) = outgoing.recv() => handler.send(RunnerToServer::RunMessage {
                        server_run_id: server_run_id.clone(),
                        message,
                    }),
                    Some(batch) = logs.recv() => handler.send(RunnerToServer::RunLogs {
                        server_run_id: server_run_id.clone(),
                        lines: batch.lines,
                        time: batch.time,
                    }),
                    else => break,
                }
            }

            let event = session.wait_closed().await;
            handler.runs.remove(&server_run_id);
            handler.send(RunnerToServer::RunClosed {
                server_run_id,
                reason: event.reason,
                exit_code: event.exit_code,
            });
        });
    }

    async fn resolve_launch_params(&self, id: String, request: LaunchParamsRequest) {
        let response = self.resolver.respond(&request).await;
        match serde_json::to_value(&response) {
            Ok(data) => self.send(RunnerToServer::success(id, data)),
            Err(e) => self.send(RunnerToServer::failure(id, e.to_string())),
        }
    }
}
