//! Wiring shared by both binaries: tracing, adapters selected from
//! `AppConfig`, and the shutdown signal.

use std::sync::Arc;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{filter::Directive, EnvFilter};

use crate::{
    application::{
        csv_validator::CsvValidator,
        import_router::ImportRouter,
        import_service::{AsyncBackend, ImportService},
        job_reconciler::JobReconciler,
        product_importer::ProductImporter,
    },
    config::{AppConfig, DatabaseType},
    domain::{
        error::ImportError,
        ports::{BlobStore, JobStore, ProductRepository, QueueConsumer, QueuePublisher},
    },
    infrastructure::{
        dynamodb::{job_repo::DynamoJobRepository, product_repo::DynamoProductRepository},
        memory::{InMemoryJobStore, InMemoryProductRepository},
        mongodb::{job_repo::MongoJobRepository, product_repo::MongoProductRepository},
        s3_adapter::S3BlobStore,
        sqs_adapter::SqsQueue,
    },
    worker::{ImportWorker, WorkerOptions},
};

const DEFAULT_DIRECTIVES: [&str; 3] = ["product_import=debug", "aws_sdk=warn", "mongodb=info"];

/// Layers the crate's default directives on top of `filter`.
fn with_default_directives(mut filter: EnvFilter) -> EnvFilter {
    for directive in DEFAULT_DIRECTIVES {
        match directive.parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
        }
    }
    filter
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(with_default_directives(EnvFilter::from_default_env()))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Blob store plus both ends of the queue.
#[derive(Clone)]
pub struct AsyncAdapters {
    pub blobs: Arc<dyn BlobStore>,
    pub publisher: Arc<dyn QueuePublisher>,
    pub consumer: Arc<dyn QueueConsumer>,
}

#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub products: Arc<dyn ProductRepository>,
    pub async_adapters: Option<AsyncAdapters>,
}

async fn load_aws(config: &AppConfig) -> SdkConfig {
    debug!("Loading AWS configuration");
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.aws.region.clone()));
    if let Some(endpoint_url) = &config.aws.endpoint_url {
        info!("Using custom AWS endpoint: {}", endpoint_url);
        loader = loader.endpoint_url(endpoint_url);
    }
    let sdk_config = loader.load().await;
    debug!("AWS region: {:?}", sdk_config.region());
    sdk_config
}

pub async fn build_backends(config: &AppConfig) -> Result<Backends, ImportError> {
    debug!("Initializing backends");
    let needs_aws = config.aws.enabled || config.database.kind == DatabaseType::Dynamodb;
    let aws = if needs_aws { Some(load_aws(config).await) } else { None };

    info!("Using database type: {:?}", config.database.kind);
    let (jobs, products): (Arc<dyn JobStore>, Arc<dyn ProductRepository>) = match (config.database.kind, &aws) {
        (DatabaseType::Dynamodb, Some(aws)) => {
            debug!("Initializing DynamoDB repositories");
            let client = aws_sdk_dynamodb::Client::new(aws);
            info!(
                "DynamoDB tables: jobs={}, products={}",
                config.database.jobs_table, config.database.products_table
            );
            (
                Arc::new(DynamoJobRepository::new(client.clone(), config.database.jobs_table.clone())),
                Arc::new(DynamoProductRepository::new(client, config.database.products_table.clone())),
            )
        }
        (DatabaseType::Dynamodb, None) => {
            return Err(ImportError::Config("DynamoDB requires AWS configuration".to_string()));
        }
        (DatabaseType::Mongodb, _) => {
            info!(
                "MongoDB URI: {}, Database: {}",
                config.database.mongodb_uri, config.database.mongodb_database
            );
            debug!("Connecting to MongoDB");
            let client = mongodb::Client::with_uri_str(&config.database.mongodb_uri)
                .await
                .map_err(|e| {
                    error!("Failed to connect to MongoDB: {}", e);
                    ImportError::Database(e.to_string())
                })?;
            debug!("MongoDB client connected successfully");

            let jobs = MongoJobRepository::new(&client, &config.database.mongodb_database);
            jobs.ensure_indexes().await?;
            let products = MongoProductRepository::new(&client, &config.database.mongodb_database);
            products.ensure_indexes().await?;
            (Arc::new(jobs), Arc::new(products))
        }
        (DatabaseType::Memory, _) => {
            info!("Using in-memory repositories; data is lost on exit");
            (
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryProductRepository::new()),
            )
        }
    };

    let async_adapters = match (&aws, config.aws.enabled) {
        (Some(aws), true) => {
            let mut s3_config = aws_sdk_s3::config::Builder::from(aws);
            if config.aws.endpoint_url.is_some() {
                s3_config = s3_config.force_path_style(true);
            }
            let blobs = S3BlobStore::new(aws_sdk_s3::Client::from_conf(s3_config.build()), config.aws.bucket.clone());
            let queue = Arc::new(
                SqsQueue::connect(
                    aws_sdk_sqs::Client::new(aws),
                    config.aws.queue_url.clone(),
                    &config.aws.queue_name,
                )
                .await?,
            );
            Some(AsyncAdapters {
                blobs: Arc::new(blobs),
                publisher: queue.clone(),
                consumer: queue,
            })
        }
        _ => {
            info!("Asynchronous import disabled (USE_AWS=false)");
            None
        }
    };

    debug!("Backend initialization complete");
    Ok(Backends {
        jobs,
        products,
        async_adapters,
    })
}

pub fn build_importer(config: &AppConfig, backends: &Backends) -> Arc<ProductImporter> {
    Arc::new(ProductImporter::new(
        Arc::new(CsvValidator::new()),
        backends.products.clone(),
        config.worker.progress_every_rows,
    ))
}

pub fn build_service(config: &AppConfig, backends: &Backends) -> ImportService {
    let async_backend = backends.async_adapters.as_ref().map(|adapters| AsyncBackend {
        blobs: adapters.blobs.clone(),
        queue: adapters.publisher.clone(),
    });
    ImportService::new(
        ImportRouter::new(config.import.async_threshold),
        build_importer(config, backends),
        backends.jobs.clone(),
        async_backend,
        config.import.max_retries,
    )
}

pub fn build_worker(config: &AppConfig, backends: &Backends) -> Result<ImportWorker, ImportError> {
    let adapters = backends
        .async_adapters
        .as_ref()
        .ok_or_else(|| ImportError::Config("the worker requires USE_AWS=true".to_string()))?;
    Ok(ImportWorker::new(
        adapters.consumer.clone(),
        adapters.blobs.clone(),
        backends.jobs.clone(),
        build_importer(config, backends),
        JobReconciler::new(backends.jobs.clone(), config.worker.stale_after()),
        WorkerOptions::from_settings(&config.worker, &config.import),
    ))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_extend_rust_log() {
        let rendered = with_default_directives(EnvFilter::new("tower_http=trace")).to_string();
        assert!(rendered.contains("tower_http=trace"));
        for directive in DEFAULT_DIRECTIVES {
            assert!(rendered.contains(directive), "{rendered}");
        }
    }

    #[tokio::test]
    async fn memory_backends_without_aws() {
        let mut config = AppConfig::default();
        config.aws.enabled = false;
        config.database.kind = DatabaseType::Memory;
        let backends = build_backends(&config).await.unwrap();
        assert!(backends.async_adapters.is_none());

        let service = build_service(&config, &backends);
        assert!(!service.async_enabled());
        assert!(matches!(
            build_worker(&config, &backends),
            Err(ImportError::Config(_))
        ));
    }
}
