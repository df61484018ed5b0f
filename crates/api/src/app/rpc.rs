//! JSON-RPC 2.0 endpoint.
//!
//! One `POST /rpc` per call. Methods mirror the REST routes:
//! `CreateUser`, `UpdateUser` (bearer token in the `Authorization` header)
//! and `VerifyEmail`. Batches are not supported.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::dto::{CreateUserRequest, UpdateUserRequest, UserDto, VerifyEmailRequest};
use super::errors::{rpc_code, ApiError};
use super::services::AppServices;
use crate::middleware::AuthState;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Clone)]
pub struct RpcState {
    pub services: Arc<AppServices>,
    pub auth: AuthState,
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<ApiError> for RpcError {
    fn from(err: ApiError) -> Self {
        let data = match err.violations() {
            [] => None,
            v => Some(json!({ "violations": v })),
        };
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    fn reply(id: Value, outcome: Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            jsonrpc: JSONRPC_VERSION,
            result,
            error,
            id,
        }
    }
}

/// POST /rpc
pub async fn handle(
    Extension(state): Extension<RpcState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let request: RpcRequest = match serde_json::from_slice::<Value>(&body) {
        Err(e) => {
            return reply(Value::Null, Err(RpcError::new(rpc_code::PARSE_ERROR, e.to_string())));
        }
        Ok(Value::Array(_)) => {
            return reply(
                Value::Null,
                Err(RpcError::new(rpc_code::INVALID_REQUEST, "batch requests are not supported")),
            );
        }
        Ok(value) => match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return reply(Value::Null, Err(RpcError::new(rpc_code::INVALID_REQUEST, e.to_string())));
            }
        },
    };

    if request.jsonrpc != JSONRPC_VERSION {
        let id = request.id.unwrap_or(Value::Null);
        return reply(id, Err(RpcError::new(rpc_code::INVALID_REQUEST, "jsonrpc must be \"2.0\"")));
    }

    let outcome = dispatch(&state, &headers, &request.method, request.params).await;

    info!(
        protocol = "rpc",
        method = %request.method,
        code = outcome.as_ref().err().map_or(0, |e| e.code),
        duration_ms = started.elapsed().as_millis() as u64,
        "received an RPC request"
    );

    match request.id {
        Some(id) => reply(id, outcome),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn reply(id: Value, outcome: Result<Value, RpcError>) -> Response {
    Json(RpcResponse::reply(id, outcome)).into_response()
}

async fn dispatch(
    state: &RpcState,
    headers: &HeaderMap,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        "CreateUser" => {
            let req: CreateUserRequest = decode_params(params)?;
            let outcome = state.services.create_user(req).await?;
            Ok(json!({
                "user": UserDto::from(outcome.user),
                "side_effect_pending": outcome.side_effect_pending,
            }))
        }
        "UpdateUser" => {
            let caller = state.auth.authenticate(headers)?;
            let req: UpdateUserRequest = decode_params(params)?;
            let user = state.services.update_user(&caller, req).await?;
            Ok(json!({ "user": UserDto::from(user) }))
        }
        "VerifyEmail" => {
            let req: VerifyEmailRequest = decode_params(params)?;
            let user = state.services.verify_email(req).await?;
            Ok(json!({ "is_verified": user.is_email_verified }))
        }
        other => Err(RpcError::new(
            rpc_code::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    }
}

fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(rpc_code::INVALID_PARAMS, format!("invalid params: {e}")))
}
