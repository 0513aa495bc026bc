use product_import::{bootstrap, config::AppConfig};
use tokio::sync::watch;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    bootstrap::init_tracing();

    info!("Starting product import worker");
    let config = AppConfig::from_env()?;
    debug!(
        "Database: {:?}, queue: {}, bucket: {}",
        config.database.kind,
        config.aws.queue_url.as_deref().unwrap_or(&config.aws.queue_name),
        config.aws.bucket
    );

    let backends = bootstrap::build_backends(&config).await?;
    let worker = bootstrap::build_worker(&config, &backends)?;
    info!("Import worker initialized successfully");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        bootstrap::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;
    info!("Import worker stopped");
    Ok(())
}
