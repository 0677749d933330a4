//! Ticket service binary.

use std::net::SocketAddr;
use ticketflow_runtime::metrics::MetricsServer;
use tickets::{Application, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ticket service");

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start()?;
    info!(%metrics_addr, "Metrics server started");

    let app = Application::build(config).await?;
    app.run().await?;

    info!("Ticket service exited");
    Ok(())
}
