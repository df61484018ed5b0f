//! HTTP gateway and RPC endpoint wiring.
//!
//! - `services.rs`: use cases shared by both surfaces
//! - `routes/`: REST handlers
//! - `rpc.rs`: JSON-RPC 2.0 dispatcher
//! - `dto.rs`: request/response shapes
//! - `errors.rs`: one error type, mapped to HTTP status and RPC code

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod password;
pub mod routes;
pub mod rpc;
pub mod services;

/// REST gateway router.
pub fn build_app(services: Arc<AppServices>, auth: middleware::AuthState) -> Router {
    let protected = routes::protected_router().layer(axum::middleware::from_fn_with_state(
        auth,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/v1", routes::public_router().merge(protected))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_logger))
                .layer(Extension(services)),
        )
}

/// JSON-RPC router: everything is a `POST /rpc`.
pub fn build_rpc_app(services: Arc<AppServices>, auth: middleware::AuthState) -> Router {
    Router::new()
        .route("/rpc", axum::routing::post(rpc::handle))
        .route("/health", get(routes::system::health))
        .layer(Extension(rpc::RpcState { services, auth }))
}

pub use services::AppServices;
