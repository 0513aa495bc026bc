use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::ImportError;

pub const REQUIRED_COLUMNS: [&str; 7] = [
    "nombre",
    "codigo_sku",
    "categoria",
    "precio_unitario",
    "condiciones_almacenamiento",
    "fecha_vencimiento",
    "proveedor_id",
];

pub const DEFAULT_ERROR_DETAILS_CAP: usize = 100;

// ==========================================================================
// Import job state machine
// ==========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// Label exposed to HTTP clients.
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDIENTE",
            JobStatus::Queued => "EN_COLA",
            JobStatus::Processing => "PROCESANDO",
            JobStatus::Completed => "COMPLETADO",
            JobStatus::Failed => "FALLIDO",
            JobStatus::Cancelled => "CANCELADO",
        }
    }

    /// Accepts either the storage name or the client label, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|status| {
            status.as_str().eq_ignore_ascii_case(value) || status.label().eq_ignore_ascii_case(value)
        })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every status change a job can go through. Each variant carries exactly the
/// fields its target state needs, so an error message can only be recorded by
/// failing a job and final counters only by completing one.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// Records the queue message id. On a job a worker already claimed, only
    /// the id is stored and the status stays PROCESSING.
    Enqueue {
        message_id: String,
    },
    StartProcessing,
    Complete {
        total_rows: u64,
        successful: u64,
        failed: u64,
        error_details: Vec<RowError>,
        total_errors: u64,
    },
    Fail {
        message: String,
    },
    /// Operator action only.
    Cancel,
}

impl JobTransition {
    /// Builds the completion transition from an import outcome, keeping at
    /// most `cap` error records while preserving the full count.
    pub fn complete(outcome: &ImportOutcome, cap: usize) -> Self {
        JobTransition::Complete {
            total_rows: outcome.total_rows,
            successful: outcome.successful,
            failed: outcome.failed,
            error_details: outcome.errors.iter().take(cap).cloned().collect(),
            total_errors: outcome.errors.len() as u64,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        JobTransition::Fail {
            message: message.into(),
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Enqueue { .. } => JobStatus::Queued,
            JobTransition::StartProcessing => JobStatus::Processing,
            JobTransition::Complete { .. } => JobStatus::Completed,
            JobTransition::Fail { .. } => JobStatus::Failed,
            JobTransition::Cancel => JobStatus::Cancelled,
        }
    }

    pub fn allowed_from(&self, from: JobStatus) -> bool {
        match self {
            JobTransition::Enqueue { .. } => {
                matches!(from, JobStatus::Pending | JobStatus::Processing)
            }
            JobTransition::StartProcessing => {
                matches!(from, JobStatus::Pending | JobStatus::Queued)
            }
            JobTransition::Complete { .. } => from == JobStatus::Processing,
            JobTransition::Fail { .. } => !from.is_terminal(),
            JobTransition::Cancel => matches!(from, JobStatus::Pending | JobStatus::Queued),
        }
    }
}

/// Counter snapshot written while a job is processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobProgress {
    pub total_rows: u64,
    pub processed_rows: u64,
    pub successful: u64,
    pub failed: u64,
}

impl JobProgress {
    pub fn new(total_rows: u64, successful: u64, failed: u64) -> Self {
        Self {
            total_rows,
            processed_rows: successful + failed,
            successful,
            failed,
        }
    }

    pub fn percent(&self) -> f64 {
        progress_percent(self.processed_rows, self.total_rows)
    }
}

pub fn progress_percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * processed as f64 / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: String,
    pub file_name: String,
    pub blob_key: String,
    pub blob_bucket: String,
    pub owner: String,
    pub status: JobStatus,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub successful: u64,
    pub failed: u64,
    pub progress_percent: f64,
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Vec<RowError>,
    #[serde(default)]
    pub total_errors: u64,
    pub queue_message_id: Option<String>,
    pub retry_count: u32,
    pub retried_from: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last claim, progress write or row error while PROCESSING.
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Optimistic-lock counter, bumped by every store write.
    #[serde(default)]
    pub version: u64,
}

impl ImportJob {
    pub fn new(blob: &StoredBlob, owner: impl Into<String>, total_rows: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_name: blob.file_name.clone(),
            blob_key: blob.key.clone(),
            blob_bucket: blob.bucket.clone(),
            owner: owner.into(),
            status: JobStatus::Pending,
            total_rows,
            processed_rows: 0,
            successful: 0,
            failed: 0,
            progress_percent: 0.0,
            error_message: None,
            error_details: Vec::new(),
            total_errors: 0,
            queue_message_id: None,
            retry_count: 0,
            retried_from: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_activity_at: None,
            version: 0,
        }
    }

    /// A fresh job that re-imports the blob of a failed one.
    pub fn resubmission_of(previous: &ImportJob) -> Self {
        let blob = StoredBlob {
            bucket: previous.blob_bucket.clone(),
            key: previous.blob_key.clone(),
            file_name: previous.file_name.clone(),
        };
        let mut job = ImportJob::new(&blob, previous.owner.clone(), previous.total_rows);
        job.retry_count = previous.retry_count + 1;
        job.retried_from = Some(previous.id.clone());
        job.metadata = previous.metadata.clone();
        job
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.status == JobStatus::Failed && self.retry_count < max_retries
    }

    pub fn apply(&mut self, transition: JobTransition, now: DateTime<Utc>) -> Result<(), ImportError> {
        let target = transition.target();
        if !transition.allowed_from(self.status) {
            return Err(ImportError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        match transition {
            JobTransition::Enqueue { message_id } => {
                self.queue_message_id = Some(message_id);
                if self.status == JobStatus::Processing {
                    return Ok(());
                }
            }
            JobTransition::StartProcessing => {
                self.started_at = Some(now);
                self.last_activity_at = Some(now);
            }
            JobTransition::Complete {
                total_rows,
                successful,
                failed,
                error_details,
                total_errors,
            } => {
                let progress = JobProgress::new(total_rows, successful, failed);
                self.check_progress(&progress)?;
                self.set_counters(progress);
                self.error_details = error_details;
                self.total_errors = total_errors;
                self.finished_at = Some(now);
            }
            JobTransition::Fail { message } => {
                self.error_message = Some(message);
                self.finished_at = Some(now);
            }
            JobTransition::Cancel => {
                self.finished_at = Some(now);
            }
        }

        self.status = target;
        Ok(())
    }

    pub fn record_progress(&mut self, progress: JobProgress, now: DateTime<Utc>) -> Result<(), ImportError> {
        if self.status != JobStatus::Processing {
            return Err(self.progress_error(format!("job is {}, not PROCESSING", self.status)));
        }
        self.check_progress(&progress)?;
        self.set_counters(progress);
        self.last_activity_at = Some(now);
        Ok(())
    }

    /// Keeps at most `cap` records; `total_errors` always counts every one.
    pub fn push_error(&mut self, error: RowError, cap: usize, now: DateTime<Utc>) -> Result<(), ImportError> {
        if self.is_terminal() {
            return Err(self.progress_error(format!("job is already {}", self.status)));
        }
        if self.status == JobStatus::Processing {
            self.last_activity_at = Some(now);
        }
        self.total_errors += 1;
        if self.error_details.len() < cap {
            self.error_details.push(error);
        }
        Ok(())
    }

    /// Most recent sign of life: the last heartbeat, else the claim, else
    /// creation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    /// True for a PROCESSING job with no activity for longer than `max_age`,
    /// i.e. whose lease (plus grace) has long expired.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.status == JobStatus::Processing && now - self.last_activity() > max_age
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or(now);
        Some((end - started).num_seconds())
    }

    pub fn errors_truncated(&self) -> bool {
        self.total_errors > self.error_details.len() as u64
    }

    fn check_progress(&self, progress: &JobProgress) -> Result<(), ImportError> {
        if progress.processed_rows != progress.successful + progress.failed {
            return Err(self.progress_error("processed rows must equal successful + failed".into()));
        }
        if progress.processed_rows > progress.total_rows {
            return Err(self.progress_error(format!(
                "processed {} exceeds total {}",
                progress.processed_rows, progress.total_rows
            )));
        }
        if progress.processed_rows < self.processed_rows
            || progress.successful < self.successful
            || progress.failed < self.failed
        {
            return Err(self.progress_error("counters cannot go backwards".into()));
        }
        Ok(())
    }

    fn set_counters(&mut self, progress: JobProgress) {
        self.total_rows = progress.total_rows;
        self.processed_rows = progress.processed_rows;
        self.successful = progress.successful;
        self.failed = progress.failed;
        self.progress_percent = progress.percent();
    }

    fn progress_error(&self, reason: String) -> ImportError {
        ImportError::InvalidProgress {
            job_id: self.id.clone(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 100;

    pub fn new(owner: Option<String>, status: Option<JobStatus>, limit: Option<usize>, offset: Option<usize>) -> Self {
        let limit = limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT);
        Self {
            owner,
            status,
            limit,
            offset: offset.unwrap_or(0),
        }
    }

    pub fn matches(&self, job: &ImportJob) -> bool {
        self.owner.as_deref().map_or(true, |owner| job.owner == owner)
            && self.status.map_or(true, |status| job.status == status)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPage {
    pub jobs: Vec<ImportJob>,
    pub total: usize,
}

impl JobPage {
    /// Filters, orders newest first and slices a set of jobs. Shared by every
    /// store whose backend cannot sort on the serialized timestamps.
    pub fn paginate(jobs: impl IntoIterator<Item = ImportJob>, filter: &JobFilter) -> Self {
        let mut matching: Vec<ImportJob> = jobs.into_iter().filter(|job| filter.matches(job)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = matching.len();
        let limit = if filter.limit == 0 { JobFilter::DEFAULT_LIMIT } else { filter.limit };
        let jobs = matching.into_iter().skip(filter.offset).take(limit).collect();
        Self { jobs, total }
    }
}

// ==========================================================================
// Blob and queue references
// ==========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bucket: String,
    pub key: String,
    /// Original upload name; kept as metadata, never part of the key.
    pub file_name: String,
}

/// Queue payload. Carries references only, never the CSV itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportMessage {
    pub job_id: String,
    #[serde(rename = "s3_bucket")]
    pub bucket: String,
    #[serde(rename = "s3_key")]
    pub key: String,
    #[serde(rename = "nombre_archivo")]
    pub file_name: String,
    #[serde(rename = "usuario_registro")]
    pub owner: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawImportMessage {
    job_id: Option<String>,
    s3_bucket: Option<String>,
    s3_key: Option<String>,
    nombre_archivo: Option<String>,
    usuario_registro: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    metadata: BTreeMap<String, String>,
}

impl ImportMessage {
    pub fn for_job(job: &ImportJob) -> Self {
        Self {
            job_id: job.id.clone(),
            bucket: job.blob_bucket.clone(),
            key: job.blob_key.clone(),
            file_name: job.file_name.clone(),
            owner: job.owner.clone(),
            timestamp: Utc::now(),
            metadata: job.metadata.clone(),
        }
    }

    /// Parses a queue body. Anything unparseable or lacking the job id or
    /// object key is a poison message.
    pub fn parse(body: &str) -> Result<Self, ImportError> {
        let raw: RawImportMessage = serde_json::from_str(body)
            .map_err(|e| ImportError::PoisonMessage(format!("cuerpo no es JSON válido: {}", e)))?;

        let job_id = raw
            .job_id
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ImportError::PoisonMessage("falta job_id".to_string()))?;
        let key = raw
            .s3_key
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ImportError::PoisonMessage("falta s3_key".to_string()))?;
        let file_name = raw
            .nombre_archivo
            .unwrap_or_else(|| key.rsplit('/').next().unwrap_or(&key).to_string());

        Ok(Self {
            job_id,
            bucket: raw.s3_bucket.unwrap_or_default(),
            key,
            file_name,
            owner: raw.usuario_registro.unwrap_or_else(|| "sistema".to_string()),
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            metadata: raw.metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

// ==========================================================================
// Products and row-level results
// ==========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Medicamento,
    Insumo,
    Reactivo,
    Dispositivo,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Medicamento,
        Category::Insumo,
        Category::Reactivo,
        Category::Dispositivo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Medicamento => "medicamento",
            Category::Insumo => "insumo",
            Category::Reactivo => "reactivo",
            Category::Dispositivo => "dispositivo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductState {
    Activo,
    Inactivo,
}

impl ProductState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductState::Activo => "Activo",
            ProductState::Inactivo => "Inactivo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Activo" => Some(ProductState::Activo),
            "Inactivo" => Some(ProductState::Inactivo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certification {
    #[serde(rename = "tipo")]
    pub kind: String,
    pub url: String,
    #[serde(rename = "fecha_vencimiento")]
    pub expires_on: NaiveDate,
}

/// A normalized, fully validated product row ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "codigo_sku")]
    pub sku: String,
    #[serde(rename = "categoria")]
    pub category: Category,
    #[serde(rename = "precio_unitario")]
    pub unit_price: f64,
    #[serde(rename = "condiciones_almacenamiento")]
    pub storage_conditions: String,
    #[serde(rename = "fecha_vencimiento")]
    pub expires_on: NaiveDate,
    #[serde(rename = "proveedor_id")]
    pub provider_id: i64,
    #[serde(rename = "usuario_registro")]
    pub registered_by: String,
    #[serde(rename = "estado")]
    pub state: ProductState,
    #[serde(rename = "certificacion")]
    pub certification: Option<Certification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowErrorCode {
    CamposFaltantes,
    SkuInvalido,
    SkuFormatoInvalido,
    SkuDuplicado,
    CategoriaInvalida,
    PrecioInvalido,
    FechaInvalida,
    ProveedorIdInvalido,
    EstadoInvalido,
    UrlCertificacionInvalida,
    CertificacionInvalida,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowIssue {
    #[serde(rename = "codigo")]
    pub code: RowErrorCode,
    #[serde(rename = "campo", skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(rename = "mensaje")]
    pub message: String,
}

impl RowIssue {
    pub fn new(code: RowErrorCode, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code,
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

/// A failed row as reported to clients and persisted on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    #[serde(rename = "fila")]
    pub row: usize,
    pub sku: Option<String>,
    #[serde(rename = "errores")]
    pub issues: Vec<RowIssue>,
    #[serde(rename = "valores")]
    pub raw: BTreeMap<String, String>,
}

impl RowError {
    pub fn has_code(&self, code: RowErrorCode) -> bool {
        self.issues.iter().any(|issue| issue.code == code)
    }
}

/// Result of validating one data row. Row ordinals are 1-based over data rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RowValidationResult {
    pub row: usize,
    pub raw: BTreeMap<String, String>,
    pub issues: Vec<RowIssue>,
    pub product: Option<NewProduct>,
}

impl RowValidationResult {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty() && self.product.is_some()
    }

    pub fn sku(&self) -> Option<String> {
        self.raw
            .get("codigo_sku")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn into_error(self) -> RowError {
        let sku = self.sku();
        RowError {
            row: self.row,
            sku,
            issues: self.issues,
            raw: self.raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedRow {
    #[serde(rename = "fila")]
    pub row: usize,
    pub sku: String,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "id", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(rename = "tiene_certificacion")]
    pub has_certification: bool,
    #[serde(rename = "certificacion", skip_serializing_if = "Option::is_none")]
    pub certification: Option<Certification>,
}

impl ImportedRow {
    pub fn from_product(row: usize, product: &NewProduct, product_id: Option<String>) -> Self {
        Self {
            row,
            sku: product.sku.clone(),
            name: product.name.clone(),
            product_id,
            has_certification: product.certification.is_some(),
            certification: product.certification.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    #[serde(rename = "total_filas")]
    pub total_rows: u64,
    #[serde(rename = "exitosos")]
    pub successful: u64,
    #[serde(rename = "fallidos")]
    pub failed: u64,
    #[serde(rename = "detalles_exitosos")]
    pub imported: Vec<ImportedRow>,
    #[serde(rename = "detalles_errores")]
    pub errors: Vec<RowError>,
}

impl ImportOutcome {
    pub fn record_success(&mut self, row: ImportedRow) {
        self.total_rows += 1;
        self.successful += 1;
        self.imported.push(row);
    }

    pub fn record_failure(&mut self, error: RowError) {
        self.total_rows += 1;
        self.failed += 1;
        self.errors.push(error);
    }

    pub fn progress(&self, total_rows: u64) -> JobProgress {
        JobProgress::new(total_rows, self.successful, self.failed)
    }
}
