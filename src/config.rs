use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::error::ImportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Dynamodb,
    Mongodb,
    Memory,
}

impl DatabaseType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dynamodb" => Some(DatabaseType::Dynamodb),
            "mongodb" => Some(DatabaseType::Mongodb),
            "memory" => Some(DatabaseType::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Feature flag for the whole asynchronous pipeline.
    pub enabled: bool,
    pub region: String,
    /// LocalStack or other custom endpoint.
    pub endpoint_url: Option<String>,
    pub queue_url: Option<String>,
    pub queue_name: String,
    pub bucket: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: "us-east-1".to_string(),
            endpoint_url: None,
            queue_url: None,
            queue_name: "productos-importacion-queue.fifo".to_string(),
            bucket: "medisupply-csv-imports".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: DatabaseType,
    pub mongodb_uri: String,
    pub mongodb_database: String,
    pub jobs_table: String,
    pub products_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseType::Mongodb,
            mongodb_uri: "mongodb://localhost:27017".to_string(),
            mongodb_database: "productos_db".to_string(),
            jobs_table: "import_jobs".to_string(),
            products_table: "productos".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    pub async_threshold: u64,
    pub max_retries: u32,
    pub error_details_cap: usize,
    pub max_upload_bytes: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            async_threshold: 100,
            max_retries: 2,
            error_details_cap: 100,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub wait_time_secs: u64,
    pub visibility_timeout_secs: u64,
    pub extend_interval_secs: u64,
    pub progress_every_rows: u64,
    pub stale_grace_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            wait_time_secs: 20,
            visibility_timeout_secs: 300,
            extend_interval_secs: 60,
            progress_every_rows: 10,
            stale_grace_secs: 600,
            sweep_interval_secs: 300,
        }
    }
}

impl WorkerSettings {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn extend_interval(&self) -> Duration {
        Duration::from_secs(self.extend_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Age after which a PROCESSING job is considered abandoned.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.visibility_timeout_secs + self.stale_grace_secs) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub bind_addr: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5008".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub aws: AwsConfig,
    pub database: DatabaseConfig,
    pub import: ImportSettings,
    pub worker: WorkerSettings,
    pub api: ApiSettings,
}

impl AppConfig {
    /// YAML file from `IMPORT_CONFIG_FILE` (if set), then environment overrides.
    pub fn from_env() -> Result<Self, ImportError> {
        let mut config = match std::env::var("IMPORT_CONFIG_FILE") {
            Ok(path) => {
                info!("Loading configuration file: {}", path);
                Self::load(&path)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }

    pub fn load(path: &str) -> Result<Self, ImportError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ImportError::Config(format!("failed to read config file {}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ImportError> {
        serde_yaml::from_str(content).map_err(|e| ImportError::Config(format!("failed to parse config file: {}", e)))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ImportError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("USE_AWS") {
            self.aws.enabled = parse_bool("USE_AWS", &v)?;
        }
        if let Some(v) = get("AWS_REGION") {
            self.aws.region = v;
        }
        if let Some(v) = get("AWS_ENDPOINT_URL") {
            self.aws.endpoint_url = Some(v);
        }
        if let Some(v) = get("AWS_SQS_QUEUE_URL") {
            self.aws.queue_url = Some(v);
        }
        if let Some(v) = get("SQS_QUEUE_NAME") {
            self.aws.queue_name = v;
        }
        if let Some(v) = get("AWS_S3_BUCKET_NAME") {
            self.aws.bucket = v;
        }

        if let Some(v) = get("DATABASE_TYPE") {
            self.database.kind = DatabaseType::parse(&v)
                .ok_or_else(|| ImportError::Config(format!("unknown DATABASE_TYPE '{}'", v)))?;
        }
        if let Some(v) = get("MONGODB_URI") {
            self.database.mongodb_uri = v;
        }
        if let Some(v) = get("MONGODB_DATABASE") {
            self.database.mongodb_database = v;
        }
        if let Some(v) = get("DYNAMODB_JOBS_TABLE") {
            self.database.jobs_table = v;
        }
        if let Some(v) = get("DYNAMODB_PRODUCTS_TABLE") {
            self.database.products_table = v;
        }

        if let Some(v) = get("IMPORT_ASYNC_THRESHOLD") {
            self.import.async_threshold = parse_number("IMPORT_ASYNC_THRESHOLD", &v)?;
        }
        if let Some(v) = get("IMPORT_MAX_RETRIES") {
            self.import.max_retries = parse_number("IMPORT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("IMPORT_ERROR_DETAILS_CAP") {
            self.import.error_details_cap = parse_number("IMPORT_ERROR_DETAILS_CAP", &v)?;
        }
        if let Some(v) = get("IMPORT_MAX_UPLOAD_BYTES") {
            self.import.max_upload_bytes = parse_number("IMPORT_MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = get("API_BIND_ADDR") {
            self.api.bind_addr = v;
        }

        if let Some(v) = get("WORKER_WAIT_TIME_SECS") {
            // SQS caps long polling at 20 seconds.
            self.worker.wait_time_secs = parse_number::<u64>("WORKER_WAIT_TIME_SECS", &v)?.min(20);
        }
        if let Some(v) = get("WORKER_VISIBILITY_TIMEOUT_SECS") {
            self.worker.visibility_timeout_secs = parse_number("WORKER_VISIBILITY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("WORKER_EXTEND_INTERVAL_SECS") {
            self.worker.extend_interval_secs = parse_number("WORKER_EXTEND_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("WORKER_PROGRESS_EVERY_ROWS") {
            self.worker.progress_every_rows = parse_number("WORKER_PROGRESS_EVERY_ROWS", &v)?;
        }
        if let Some(v) = get("WORKER_STALE_GRACE_SECS") {
            self.worker.stale_grace_secs = parse_number("WORKER_STALE_GRACE_SECS", &v)?;
        }
        if let Some(v) = get("WORKER_SWEEP_INTERVAL_SECS") {
            self.worker.sweep_interval_secs = parse_number("WORKER_SWEEP_INTERVAL_SECS", &v)?;
        }

        if self.worker.extend_interval_secs >= self.worker.visibility_timeout_secs {
            return Err(ImportError::Config(format!(
                "WORKER_EXTEND_INTERVAL_SECS ({}) must be shorter than WORKER_VISIBILITY_TIMEOUT_SECS ({})",
                self.worker.extend_interval_secs, self.worker.visibility_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn queue_is_fifo(&self) -> bool {
        self.aws
            .queue_url
            .as_deref()
            .unwrap_or(&self.aws.queue_name)
            .ends_with(".fifo")
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ImportError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ImportError::Config(format!("{} must be a boolean, got '{}'", key, value))),
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ImportError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ImportError::Config(format!("{} is not a valid number: {}", key, e)))
}
