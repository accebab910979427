//! Process wiring: builds every component and runs them until shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{AppConfig, BrokerArgs};
use crate::controller::translation_router;
use crate::network::NetworkModule;
use crate::rpc::{MemoryBroker, RpcServer, Transport};
use crate::storage::MemoryTranslationRepo;
use crate::usecase::{GoogleTranslateApi, TranslationRepo, TranslationUseCase};

/// Runs the service until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns the first startup failure, or the failure that stopped the HTTP
/// server or the RPC responder.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    run_until(config, async {
        let signal = shutdown_signal().await;
        info!(signal, "shutdown signal received");
    })
    .await
}

/// Runs the service until `shutdown` resolves or a component fails.
///
/// Shutdown order: HTTP stops accepting, the responder drains, then the
/// repository and the broker connection are closed.
///
/// # Errors
///
/// Same as [`run`].
pub async fn run_until(
    config: AppConfig,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    info!(app = %config.app_name, version = %config.app_version, "starting");

    let repo = build_repo(&config).await?;
    repo.initialize().await.context("initialize repository")?;

    let webapi = GoogleTranslateApi::new(&config.translate_api_url, config.translate_api_timeout())
        .context("build translation API client")?;
    let usecase = TranslationUseCase::new(Arc::clone(&repo), Arc::new(webapi));
    let router = Arc::new(translation_router(&usecase).context("build RPC routes")?);

    let transport = connect_transport(&config.broker).await?;
    let server = RpcServer::new(Arc::clone(&transport), router, config.rpc_server_config());

    let mut http = NetworkModule::new(config.network_config(), usecase, server.shutdown_controller());
    http.start().await?;

    let stop = CancellationToken::new();
    let mut rpc_task = tokio::spawn(server.serve(stop.clone().cancelled_owned()));
    let mut http_task = tokio::spawn(http.serve(stop.clone().cancelled_owned()));

    let mut rpc_early = None;
    let mut http_early = None;
    tokio::select! {
        () = shutdown => {}
        joined = &mut http_task => {
            error!("HTTP server exited");
            http_early = Some(joined);
        }
        joined = &mut rpc_task => {
            error!("RPC server exited");
            rpc_early = Some(joined);
        }
    }
    stop.cancel();

    let http_result = match http_early {
        Some(joined) => joined,
        None => http_task.await,
    };
    let rpc_result = match rpc_early {
        Some(joined) => joined,
        None => rpc_task.await,
    };

    if let Err(e) = repo.close().await {
        error!(error = %e, "failed to close repository");
    }
    if let Err(e) = transport.close().await {
        error!(error = %e, "failed to close broker connection");
    }

    http_result.context("HTTP task panicked")??;
    rpc_result
        .context("RPC task panicked")?
        .context("RPC server failed")?;
    info!("shutdown complete");
    Ok(())
}

/// Opens the broker named by `broker.broker_url`.
///
/// # Errors
///
/// Returns an error if the broker is unreachable or the URL needs a
/// transport that was compiled out.
pub async fn connect_transport(broker: &BrokerArgs) -> anyhow::Result<Arc<dyn Transport>> {
    if broker.is_memory() {
        info!("using in-process broker");
        return Ok(Arc::new(MemoryBroker::new()));
    }

    #[cfg(feature = "amqp")]
    {
        use crate::rpc::{AmqpTransport, ConnectOptions};

        let transport = AmqpTransport::connect(&broker.broker_url, ConnectOptions::default())
            .await
            .context("connect to broker")?;
        Ok(Arc::new(transport))
    }

    #[cfg(not(feature = "amqp"))]
    {
        anyhow::bail!("broker URL needs the `amqp` feature")
    }
}

async fn build_repo(config: &AppConfig) -> anyhow::Result<Arc<dyn TranslationRepo>> {
    match &config.postgres_url {
        None => {
            info!("no postgres URL configured, keeping history in memory");
            Ok(Arc::new(MemoryTranslationRepo::new()))
        }
        #[cfg(feature = "postgres")]
        Some(url) => {
            use crate::storage::{PostgresOptions, PostgresTranslationRepo};

            let options = PostgresOptions {
                max_connections: config.pg_pool_max,
                ..PostgresOptions::default()
            };
            Ok(Arc::new(PostgresTranslationRepo::connect(url, options).await?))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("a postgres URL is set but the `postgres` feature is disabled"),
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::*;

    fn memory_config() -> AppConfig {
        AppConfig::try_parse_from([
            "parley-server",
            "--broker-url",
            "memory://",
            "--http-host",
            "127.0.0.1",
            "--http-port",
            "0",
            "--rpc-grace-period-ms",
            "50",
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn runs_and_stops_cleanly_on_memory_broker() {
        let result = run_until(memory_config(), tokio::time::sleep(Duration::from_millis(50))).await;
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn memory_url_needs_no_broker() {
        let config = memory_config();
        let transport = connect_transport(&config.broker).await.unwrap();
        transport.close().await.unwrap();
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn postgres_url_without_feature_fails_startup() {
        let mut config = memory_config();
        config.postgres_url = Some("postgres://localhost/parley".to_string());
        let err = run_until(config, std::future::ready(())).await.unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }
}
