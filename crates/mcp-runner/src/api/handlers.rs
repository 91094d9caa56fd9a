//! HTTP request handlers for the session endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt, stream};
use log::{debug, info, warn};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use mcp_runner_protocol::{CloseReason, JsonRpcMessage};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::auth::SessionGrant;
use crate::session::{McpSession, SessionLookup};

/// Liveness probe.
pub async fn ping() -> &'static str {
    "ok"
}

/// Attach to a session's outgoing message stream.
///
/// The first event is `endpoint` with the URL to post messages to; every
/// JSON-RPC message from the server follows as a `message` event. The stream
/// ends when the session closes, and dropping it stops the session.
pub async fn sse(State(state): State<AppState>, grant: SessionGrant) -> ApiResult<Response> {
    let session = match state.sessions.get_session(&grant.session_id).await? {
        SessionLookup::Active { session, .. } => session,
        SessionLookup::Stopped { info } => {
            debug!("SSE attach to stopped session {}", info.id);
            let empty = stream::empty::<Result<Event, Infallible>>();
            return Ok(Sse::new(empty).into_response());
        }
    };

    info!("SSE client attached to session {}", session.id());

    let endpoint = Event::default()
        .event("endpoint")
        .data(state.session_url(&grant.token));

    let messages = session.subscribe_outgoing().map(|message| {
        let event = match serde_json::to_string(&message) {
            Ok(json) => Event::default().event("message").data(json),
            Err(e) => {
                warn!("Failed to serialize outgoing message: {}", e);
                Event::default().comment("serialization error")
            }
        };
        Ok::<_, Infallible>(event)
    });

    let events = DisconnectGuarded {
        inner: stream::once(async move { Ok(endpoint) }).chain(messages).boxed(),
        session,
    };

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

/// Deliver one JSON-RPC message from the client to the session.
pub async fn post_message(
    State(state): State<AppState>,
    grant: SessionGrant,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let session = match state.sessions.get_session(&grant.session_id).await? {
        SessionLookup::Active { session, .. } => session,
        SessionLookup::Stopped { info } => return Err(ApiError::SessionStopped(info.id)),
    };

    let message: JsonRpcMessage =
        serde_json::from_slice(&body).map_err(|e| ApiError::Parse(e.to_string()))?;

    session.incoming_message(vec![message]);
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

pub async fn method_not_allowed(method: Method) -> ApiError {
    ApiError::MethodNotAllowed(method.to_string())
}

/// SSE body that stops its session once the client goes away.
struct DisconnectGuarded {
    inner: stream::BoxStream<'static, Result<Event, Infallible>>,
    session: McpSession,
}

impl Stream for DisconnectGuarded {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for DisconnectGuarded {
    fn drop(&mut self) {
        if self.session.is_stopped() {
            return;
        }
        let session = self.session.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            info!("SSE client left session {}", session.id());
            handle.spawn(async move { session.stop_with(CloseReason::ClientDisconnected).await });
        }
    }
}
