//! Control-plane link protocol.
//!
//! Messages are JSON text frames over a WebSocket. The envelope is tagged by
//! `type`; job payloads keep the camelCase field names the control plane
//! uses.
//!
//! Link lifecycle:
//! 1. server sends `server.initialize` with the runner's identity
//! 2. runner answers with `runner.set_config` (capabilities)
//! 3. once acknowledged, runner sends `runner.ready`
//! 4. server sends `run.execute` / `launch_params.resolve` requests and
//!    `run.close` / `run.mcp.message` notifications; the runner reports
//!    `run.mcp.message`, `run.logs` and `run.closed`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::jsonrpc::JsonRpcMessage;

/// Attribute advertised by runners that can start docker image sources.
pub const SUPPORTS_DOCKER_IMAGES: &str = "supports_docker_images";

// ============================================================================
// Registration
// ============================================================================

/// Identity assigned to this runner by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerIdentity {
    pub id: String,
    pub identifier: String,
    pub name: String,
}

/// Capability report sent after the identity is received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerCapabilities {
    pub attributes: Vec<String>,
    pub tags: Vec<String>,
    pub max_concurrent_jobs: u32,
    pub version: String,
}

// ============================================================================
// Jobs
// ============================================================================

/// Where the MCP server for a job comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobSource {
    Docker {
        image: String,
        #[serde(default)]
        tag: Option<String>,
    },
}

/// Concrete command line for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    pub server_run_id: String,
    pub source: JobSource,
    pub launch_params: LaunchParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobResponse {
    /// Signed credential scoped to exactly one session.
    pub token: String,
    /// Base origin of the session's HTTP surface.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchParamsRequest {
    /// Untrusted script body.
    #[serde(rename = "getLaunchParams")]
    pub get_launch_params: String,
    #[serde(default)]
    pub config: Value,
}

/// Result of resolving launch parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "output", rename_all = "lowercase")]
pub enum LaunchParamsResponse {
    Success(LaunchParams),
    /// Diagnostic text (captured stdout and stderr of the sandbox).
    Error(String),
}

// ============================================================================
// Run events
// ============================================================================

/// Why a session (and its container) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The container never became discoverable, or its image could not be pulled.
    ServerFailedToStart,
    /// Stop was requested by the runner.
    ServerStopped,
    /// The container exited too quickly or with a non-zero status.
    ServerExitedError,
    ServerExitedSuccess,
    /// The client side stopped answering pings.
    ClientTimeout,
    /// The container stopped answering pings.
    ServerTimeout,
    /// The SSE client went away.
    ClientDisconnected,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ServerFailedToStart => "server_failed_to_start",
            CloseReason::ServerStopped => "server_stopped",
            CloseReason::ServerExitedError => "server_exited_error",
            CloseReason::ServerExitedSuccess => "server_exited_success",
            CloseReason::ClientTimeout => "client_timeout",
            CloseReason::ServerTimeout => "server_timeout",
            CloseReason::ClientDisconnected => "client_disconnected",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    #[serde(rename = "type")]
    pub stream: LogStream,
    pub line: String,
}

// ============================================================================
// Wire messages
// ============================================================================

/// Message from the control plane to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToRunner {
    /// Identity announcement, first message on every connection.
    #[serde(rename = "server.initialize")]
    Initialize(RunnerIdentity),

    /// Start a job. Answered with a [`RunnerToServer::Response`] carrying a
    /// [`StartJobResponse`].
    #[serde(rename = "run.execute")]
    Execute { id: String, job: StartJobRequest },

    /// Evaluate a launch-parameter script. Answered with a
    /// [`LaunchParamsResponse`].
    #[serde(rename = "launch_params.resolve")]
    ResolveLaunchParams {
        id: String,
        request: LaunchParamsRequest,
    },

    /// Stop the session of a run.
    #[serde(rename = "run.close")]
    CloseRun { server_run_id: String },

    /// One MCP message (or batch) for the session of a run.
    #[serde(rename = "run.mcp.message")]
    RunMessage { server_run_id: String, message: Value },

    /// Answer to a runner request.
    Response {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Message from the runner to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerToServer {
    #[serde(rename = "runner.set_config")]
    SetConfig {
        id: String,
        config: RunnerCapabilities,
    },

    #[serde(rename = "runner.ready")]
    Ready,

    /// Answer to a control-plane request.
    Response {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "run.closed")]
    RunClosed {
        server_run_id: String,
        reason: CloseReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    #[serde(rename = "run.mcp.message")]
    RunMessage {
        server_run_id: String,
        message: JsonRpcMessage,
    },

    /// Non-protocol output of the container, batched.
    #[serde(rename = "run.logs")]
    RunLogs {
        server_run_id: String,
        lines: Vec<LogLine>,
        time: DateTime<Utc>,
    },
}

impl RunnerToServer {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        RunnerToServer::Response {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        RunnerToServer::Response {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}
