//! Wire protocol types for the MCP runner.
//!
//! - [`jsonrpc`]: the JSON-RPC 2.0 envelope spoken by MCP servers over stdio,
//!   including the runner's ping conventions.
//! - [`control`]: messages exchanged with the control plane over the runner
//!   link (registration, job start, launch parameter resolution, run events).

pub mod control;
pub mod jsonrpc;

pub use control::{
    CloseReason, JobSource, LaunchParams, LaunchParamsRequest, LaunchParamsResponse, LogLine,
    LogStream, RunnerCapabilities, RunnerIdentity, RunnerToServer, ServerToRunner,
    StartJobRequest, StartJobResponse,
};
pub use jsonrpc::{JsonRpcMessage, MessageBatch, RequestId};
