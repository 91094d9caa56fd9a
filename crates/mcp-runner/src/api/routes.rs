//! Router construction.

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::get,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use crate::auth::{SESSION_TOKEN_HEADER, session_auth_middleware};

/// Create the application router.
pub fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let session_routes = Router::new()
        .route(
            "/mcp/sse",
            get(handlers::sse)
                .post(handlers::post_message)
                .fallback(handlers::method_not_allowed),
        )
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            session_auth_middleware,
        ))
        .with_state(state);

    let public_routes = Router::new().route("/ping", get(handlers::ping));

    Router::new()
        .merge(public_routes)
        .merge(session_routes)
        .layer(build_cors_layer(allowed_origins))
        .layer(trace_layer)
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::HeaderName::from_static(SESSION_TOKEN_HEADER),
    ];

    // Session tokens travel in headers or the URL, never in cookies.
    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid!");
        CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
    } else {
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
    }
}
