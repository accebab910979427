//! `parley-server`: translation service over HTTP and AMQP RPC.

use clap::Parser;
use parley_server::config::AppConfig;
use parley_server::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::parse();
    init_logging(&config.log)?;
    parley_server::app::run(config).await
}
