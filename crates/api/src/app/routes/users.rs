//! User routes: sign-up, profile update and e-mail verification.

use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;

use crate::app::dto::{
    CreateUserRequest, UpdateUserRequest, UserDto, UserResponse, VerifyEmailRequest,
    VerifyEmailResponse,
};
use crate::app::services::AppServices;
use crate::context::CallerContext;

/// Routes callable without a token.
pub fn public_router() -> Router {
    Router::new()
        .route("/create_user", post(create_user))
        .route("/verify_email", get(verify_email))
}

/// Routes that require a verified bearer token.
pub fn protected_router() -> Router {
    Router::new().route("/update_user", patch(update_user))
}

/// POST /v1/create_user
pub async fn create_user(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreateUserRequest>,
) -> axum::response::Response {
    match services.create_user(body).await {
        Ok(outcome) if outcome.side_effect_pending => (
            StatusCode::ACCEPTED,
            Json(json!({
                "user": UserDto::from(outcome.user),
                "side_effect": "pending",
            })),
        )
            .into_response(),
        Ok(outcome) => Json(UserResponse {
            user: outcome.user.into(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// PATCH /v1/update_user
pub async fn update_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Json(body): Json<UpdateUserRequest>,
) -> axum::response::Response {
    match services.update_user(caller.payload(), body).await {
        Ok(user) => Json(UserResponse { user: user.into() }).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /v1/verify_email?email_id=..&secret_code=..
pub async fn verify_email(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<VerifyEmailRequest>,
) -> axum::response::Response {
    match services.verify_email(query).await {
        Ok(user) => Json(VerifyEmailResponse {
            is_verified: user.is_email_verified,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}
