use std::sync::Arc;

use product_import::{bootstrap, config::AppConfig, http};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    bootstrap::init_tracing();

    info!("Starting product import API");
    let config = AppConfig::from_env()?;
    let backends = bootstrap::build_backends(&config).await?;
    let service = Arc::new(bootstrap::build_service(&config, &backends));
    info!("Asynchronous imports enabled: {}", service.async_enabled());

    let app = http::router(service, config.import.max_upload_bytes);
    let listener = TcpListener::bind(&config.api.bind_addr).await?;
    info!("✅ Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(bootstrap::shutdown_signal())
        .await?;
    info!("Import API stopped");
    Ok(())
}
