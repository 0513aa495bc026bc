use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::models::{ImportJob, RowError};

/// Client-facing representation of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub nombre_archivo: String,
    pub estado: &'static str,
    pub progreso: f64,
    pub total_filas: u64,
    pub filas_procesadas: u64,
    pub exitosos: u64,
    pub fallidos: u64,
    pub usuario_registro: String,
    pub fecha_creacion: DateTime<Utc>,
    pub fecha_inicio_proceso: Option<DateTime<Utc>>,
    pub fecha_finalizacion: Option<DateTime<Utc>>,
    pub tiempo_transcurrido_segundos: Option<i64>,
    pub reintentos: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reintento_de: Option<String>,
    pub mensaje_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detalles_errores: Option<Vec<RowError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_errores: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errores_truncados: Option<bool>,
}

impl JobView {
    pub fn new(job: &ImportJob, include_errors: bool, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id.clone(),
            nombre_archivo: job.file_name.clone(),
            estado: job.status.label(),
            progreso: (job.progress_percent * 100.0).round() / 100.0,
            total_filas: job.total_rows,
            filas_procesadas: job.processed_rows,
            exitosos: job.successful,
            fallidos: job.failed,
            usuario_registro: job.owner.clone(),
            fecha_creacion: job.created_at,
            fecha_inicio_proceso: job.started_at,
            fecha_finalizacion: job.finished_at,
            tiempo_transcurrido_segundos: job.elapsed_seconds(now),
            reintentos: job.retry_count,
            reintento_de: job.retried_from.clone(),
            mensaje_error: job.error_message.clone(),
            detalles_errores: include_errors.then(|| job.error_details.clone()),
            total_errores: include_errors.then_some(job.total_errors),
            errores_truncados: include_errors.then(|| job.errors_truncated()),
        }
    }
}
