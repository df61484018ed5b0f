use axum::Router;

pub mod system;
pub mod users;

/// Public `/v1` routes.
pub fn public_router() -> Router {
    users::public_router()
}

/// `/v1` routes behind bearer authentication.
pub fn protected_router() -> Router {
    users::protected_router()
}
