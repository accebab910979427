//! `parley-call`: issues translation RPCs from the command line.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_core::{routes, DoTranslateRequest, HistoryResponse, Translation};
use parley_server::app::connect_transport;
use parley_server::config::{BrokerArgs, LogArgs};
use parley_server::logging::init_logging;
use parley_server::rpc::RpcClient;

/// Command-line RPC client for the translation responder.
#[derive(Parser)]
#[command(name = "parley-call")]
#[command(about = "Call the translation service over the message broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    broker: BrokerArgs,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the translation history
    History,
    /// Translate a text and print the result
    Translate {
        /// Source language code, e.g. `en`
        #[arg(long)]
        source: String,
        /// Destination language code, e.g. `de`
        #[arg(long)]
        destination: String,
        /// Text to translate
        original: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let transport = connect_transport(&cli.broker).await?;
    let client = RpcClient::connect(transport.clone(), cli.broker.rpc_client_config())
        .await
        .context("start RPC client")?;

    let outcome = execute(&client, cli.command).await;

    client.close().await;
    match tokio::time::timeout(Duration::from_secs(5), transport.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "failed to close broker connection"),
        Err(_) => tracing::warn!("broker close timed out"),
    }
    outcome
}

async fn execute(client: &RpcClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::History => {
            let response: HistoryResponse = client
                .request(routes::GET_HISTORY, &())
                .await
                .context("getHistory")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Translate {
            source,
            destination,
            original,
        } => {
            let request = DoTranslateRequest {
                source,
                destination,
                original,
            };
            let translation: Translation = client
                .request(routes::DO_TRANSLATE, &request)
                .await
                .context("doTranslate")?;
            println!("{}", serde_json::to_string_pretty(&translation)?);
        }
    }
    Ok(())
}
