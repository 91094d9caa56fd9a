//! Runs MCP servers in containers and bridges their stdio to remote clients.
//!
//! Each job gets one container and one session. Clients reach a session
//! either over HTTP (SSE down, POST up) or through the control-plane link.

pub mod api;
pub mod auth;
pub mod config;
pub mod container;
pub mod control;
pub mod launch;
pub mod session;
