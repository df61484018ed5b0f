use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;

use postbox_auth::{AuthzError, TokenError};
use postbox_core::{DomainError, FieldViolation};
use postbox_infra::db::{StoreError, TxError, USERS_EMAIL_KEY, USERS_PKEY};

/// JSON-RPC 2.0 error codes. The `-320xx` range is server defined.
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const NOT_FOUND: i64 = -32001;
    pub const ALREADY_EXISTS: i64 = -32002;
    pub const UNAUTHENTICATED: i64 = -32003;
    pub const PERMISSION_DENIED: i64 = -32004;
}

/// Failure of one API call, shared by the HTTP gateway and the RPC endpoint.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{}", describe_invalid(.0))]
    InvalidArguments(Vec<FieldViolation>),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Internal(String),
}

fn describe_invalid(violations: &[FieldViolation]) -> String {
    let fields: Vec<_> = violations.iter().map(ToString::to_string).collect();
    format!("invalid arguments: {}", fields.join("; "))
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidArguments(_) => "invalid_argument",
            ApiError::AlreadyExists(_) => "already_exists",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::PermissionDenied(_) => "permission_denied",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn rpc_code(&self) -> i64 {
        match self {
            ApiError::InvalidArguments(_) => rpc_code::INVALID_PARAMS,
            ApiError::AlreadyExists(_) => rpc_code::ALREADY_EXISTS,
            ApiError::NotFound(_) => rpc_code::NOT_FOUND,
            ApiError::Unauthenticated(_) => rpc_code::UNAUTHENTICATED,
            ApiError::PermissionDenied(_) => rpc_code::PERMISSION_DENIED,
            ApiError::Internal(_) => rpc_code::INTERNAL,
        }
    }

    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            ApiError::InvalidArguments(v) => v,
            _ => &[],
        }
    }

    /// Map a store failure, naming the resource for not-found responses.
    pub fn from_store(err: StoreError, resource: &str) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound(format!("{resource} not found")),
            other => other.into(),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidArguments(violations) => ApiError::InvalidArguments(violations),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                ApiError::InvalidArguments(vec![FieldViolation::new("request", msg)])
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err.unique_violation() {
            Some(USERS_PKEY) => return ApiError::AlreadyExists("username already exists".into()),
            Some(USERS_EMAIL_KEY) => return ApiError::AlreadyExists("email already exists".into()),
            Some(other) => return ApiError::AlreadyExists(format!("{other} already exists")),
            None => {}
        }
        match err {
            StoreError::NotFound => ApiError::NotFound("not found".into()),
            other => {
                tracing::error!(error = %other, "store failure");
                ApiError::Internal("internal error".into())
            }
        }
    }
}

impl From<TxError> for ApiError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Store(e) => e.into(),
            other => {
                tracing::error!(error = %other, "transaction failure");
                ApiError::Internal("internal error".into())
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        ApiError::Unauthenticated(err.to_string())
    }
}

impl From<AuthzError> for ApiError {
    fn from(err: AuthzError) -> Self {
        ApiError::PermissionDenied(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let violations = self.violations().to_vec();
        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if !violations.is_empty() {
            body["violations"] = json!(violations);
        }
        (self.status(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_conflicts_name_the_duplicate_field() {
        let err = ApiError::from(StoreError::unique(USERS_PKEY));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "username already exists");

        let err = ApiError::from(StoreError::unique(USERS_EMAIL_KEY));
        assert_eq!(err.rpc_code(), rpc_code::ALREADY_EXISTS);
        assert_eq!(err.to_string(), "email already exists");
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = ApiError::from(StoreError::Internal("connection reset by peer".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.to_string().contains("connection reset"));
    }

    #[test]
    fn token_and_authz_failures_map_to_401_and_403() {
        assert_eq!(ApiError::from(TokenError::Expired).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(AuthzError::Forbidden).rpc_code(),
            rpc_code::PERMISSION_DENIED
        );
    }

    #[test]
    fn field_violations_become_invalid_params() {
        let err = ApiError::from(DomainError::InvalidArguments(vec![FieldViolation::new(
            "email",
            "must contain @",
        )]));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.rpc_code(), rpc_code::INVALID_PARAMS);
        assert_eq!(err.violations().len(), 1);
    }
}
