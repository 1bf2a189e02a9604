//! Optional auth token middleware.
//!
//! When an auth token is configured, every route must include
//! `Authorization: Bearer <token>` (or `?token=<token>` for WebSocket).
//! The `/health` endpoint remains unauthenticated so clients can run the
//! contract check before they have credentials.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;

use opta_protocol::ErrorBody;

/// Axum middleware that checks for a valid auth token.
pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if req.uri().path() == "/health" || authorized(&req, &expected_token) {
        return next.run(req).await;
    }

    debug!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
    );
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody::new("unauthorized", "missing or invalid auth token")),
    )
        .into_response()
}

fn authorized(req: &Request<Body>, expected: &str) -> bool {
    let header_token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if header_token == Some(expected) {
        return true;
    }

    req.uri()
        .query()
        .map(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.strip_prefix("token="))
                .any(|token| token == expected)
        })
        .unwrap_or(false)
}
