use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use postbox_api::app::{build_app, build_rpc_app, AppServices};
use postbox_api::middleware::AuthState;
use postbox_api::servers::{self, HttpGateway, RpcEndpoint};
use postbox_auth::Hs256TokenVerifier;
use postbox_infra::config::Config;
use postbox_infra::db::{InMemoryStore, PgStore, Store};
use postbox_infra::lifecycle::{LifecycleCoordinator, TaskWorker};
use postbox_infra::mail::{LogNotifier, Notifier, WebhookNotifier};
use postbox_infra::tasks::{
    InMemoryTaskQueue, PgTaskQueue, SendVerifyEmailHandler, TaskDistributor, TaskProcessor,
    TaskQueueStore, TracingFailureReporter, TASK_SEND_VERIFY_EMAIL,
};
use postbox_observability::LogFormat;

const NOTIFIER_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            postbox_observability::init(LogFormat::default());
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    postbox_observability::init(config.log_format);

    match run(config).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "postbox-api exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let in_memory = std::env::args().skip(1).any(|arg| arg == "--in-memory");

    let (store, queue): (Arc<dyn Store>, Arc<dyn TaskQueueStore>) = if in_memory {
        warn!("using in-memory storage; nothing survives a restart");
        (
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryTaskQueue::new()),
        )
    } else {
        let pg = PgStore::connect(config.require_database_url()?, config.db_max_connections)
            .await
            .context("cannot connect to database")?;
        pg.migrate().await.context("failed to apply schema")?;
        info!("database schema is up to date");
        let queue = PgTaskQueue::new(pg.pool().clone());
        (Arc::new(pg), Arc::new(queue))
    };

    let notifier: Arc<dyn Notifier> = match &config.notifier_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), NOTIFIER_TIMEOUT)?),
        None => Arc::new(LogNotifier),
    };

    let verifier = Hs256TokenVerifier::new(config.token_symmetric_key.as_bytes())
        .context("cannot create token verifier")?;
    let auth = AuthState {
        verifier: Arc::new(verifier),
    };

    let distributor = TaskDistributor::new(queue.clone());
    let services = Arc::new(AppServices::new(store.clone(), distributor));

    let mut processor = TaskProcessor::new(
        queue,
        Arc::new(TracingFailureReporter),
        config.processor_config(),
    )?;
    processor.register(
        TASK_SEND_VERIFY_EMAIL,
        SendVerifyEmailHandler::new(
            store,
            notifier,
            config.verify_email_url.clone(),
            config.verify_email_ttl,
        ),
    );

    // Both listeners are bound before any loop starts.
    let http = servers::bind(config.http_address).await?;
    let rpc = servers::bind(config.rpc_address).await?;

    let mut coordinator = LifecycleCoordinator::new(config.shutdown_grace);
    coordinator.register(HttpGateway::new(http, build_app(services.clone(), auth.clone())));
    coordinator.register(RpcEndpoint::new(rpc, build_rpc_app(services, auth)));
    coordinator.register(TaskWorker::new(Arc::new(processor)));
    coordinator.listen_for_signals();

    coordinator.run().await?;
    Ok(())
}
