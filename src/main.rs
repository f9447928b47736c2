use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use daytrade_engine::Services;
use daytrade_engine::core::{Config, Ledger, QuoteSource};
use daytrade_engine::feeds::{MockQuoteFeed, TcpQuoteFeed};
use daytrade_engine::ledger::MemoryLedger;
use daytrade_engine::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,daytrade_engine=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 daytrade-engine starting...");
    let config = Config::load_default();

    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let source: Arc<dyn QuoteSource> = if config.quote.mock {
        tracing::info!("📡 mock quotes at {} ({:?} latency)", config.quote.mock_price, config.quote.mock_latency());
        Arc::new(MockQuoteFeed::new(config.quote.mock_price).with_latency(config.quote.mock_latency()))
    } else {
        tracing::info!("📡 quote server {}", config.quote.addr);
        Arc::new(TcpQuoteFeed::new(config.quote.addr.clone(), config.quote.timeout()))
    };

    let services = Services::new(&config, ledger, source);
    let (stop, shutdown) = watch::channel(false);

    let triggers = Arc::clone(&services.triggers).spawn(shutdown.clone());
    let server = Server::bind(&config.server.listen_addr, Arc::clone(&services.dispatcher)).await?;
    let serving = tokio::spawn(server.run(shutdown));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 shutting down");
    stop.send(true).ok();

    serving.await??;
    triggers.await?;
    services.audit.flush().await?;
    tracing::info!("👋 bye");
    Ok(())
}
