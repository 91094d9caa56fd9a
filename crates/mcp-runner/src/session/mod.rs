//! MCP sessions and their registry.

mod bridge;
mod manager;
mod subscribers;

pub use bridge::{LogBatch, McpSession, SessionSettings};
pub use manager::{
    SESSION_ID_PREFIX, SessionError, SessionInfo, SessionLookup, SessionManager,
    SessionManagerConfig, SessionStatus,
};
pub use subscribers::{Subscribers, Subscription};
