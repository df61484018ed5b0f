use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::info;

use postbox_auth::{TokenPayload, TokenVerifier};

use crate::app::errors::ApiError;
use crate::context::CallerContext;

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AuthState {
    /// Verify the bearer token carried by `headers`.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<TokenPayload, ApiError> {
        let token = extract_bearer(headers)?;
        Ok(self.verifier.verify(token, Utc::now())?)
    }
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let payload = match state.authenticate(req.headers()) {
        Ok(payload) => payload,
        Err(err) => return err.into_response(),
    };

    req.extensions_mut().insert(CallerContext::new(payload));
    next.run(req).await
}

/// Logs method, path, status and latency of every request.
pub async fn request_logger(req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        protocol = "http",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "received an HTTP request"
    );
    response
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let missing = || ApiError::Unauthenticated("missing authorization header".into());

    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(missing)?;

    let header = header.to_str().map_err(|_| missing())?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthenticated("unsupported authorization type".into()))?
        .trim();

    if token.is_empty() {
        return Err(missing());
    }

    Ok(token)
}
