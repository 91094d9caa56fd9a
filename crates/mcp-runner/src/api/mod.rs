//! HTTP API module.
//!
//! Serves the per-session SSE endpoint and a liveness probe.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
