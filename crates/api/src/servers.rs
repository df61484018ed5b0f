//! The two network surfaces as run-loops: both stop accepting on
//! cancellation and let in-flight requests finish.

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use postbox_infra::lifecycle::RunLoop;

/// Bind `addr`; failing here aborts startup before any loop runs.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

async fn serve(
    name: &str,
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(server = name, %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{name} server failed"))?;

    info!(server = name, "server stopped");
    Ok(())
}

/// REST gateway.
pub struct HttpGateway {
    listener: TcpListener,
    router: Router,
}

impl HttpGateway {
    pub fn new(listener: TcpListener, router: Router) -> Self {
        Self { listener, router }
    }
}

#[async_trait]
impl RunLoop for HttpGateway {
    fn name(&self) -> &str {
        "http-gateway"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let this = *self;
        serve("http-gateway", this.listener, this.router, shutdown).await
    }
}

/// JSON-RPC endpoint.
pub struct RpcEndpoint {
    listener: TcpListener,
    router: Router,
}

impl RpcEndpoint {
    pub fn new(listener: TcpListener, router: Router) -> Self {
        Self { listener, router }
    }
}

#[async_trait]
impl RunLoop for RpcEndpoint {
    fn name(&self) -> &str {
        "rpc-endpoint"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let this = *self;
        serve("rpc-endpoint", this.listener, this.router, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::get;
    use postbox_infra::lifecycle::{LifecycleCoordinator, RunLoopState};

    use super::*;

    #[tokio::test]
    async fn both_servers_stop_on_cancel() {
        let router = || Router::new().route("/health", get(|| async { "ok" }));
        let http = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let rpc = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let http_addr = http.local_addr().unwrap();

        let mut coordinator = LifecycleCoordinator::new(Duration::from_secs(5));
        coordinator.register(HttpGateway::new(http, router()));
        coordinator.register(RpcEndpoint::new(rpc, router()));
        let token = coordinator.shutdown_token();
        let states = coordinator.states();
        let joined = tokio::spawn(coordinator.run());

        let body = reqwest::get(format!("http://{http_addr}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        token.cancel();
        joined.await.unwrap().unwrap();
        assert_eq!(states.get("http-gateway"), Some(RunLoopState::Stopped));
        assert_eq!(states.get("rpc-endpoint"), Some(RunLoopState::Stopped));
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() {
        let taken = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = bind(addr).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }
}
