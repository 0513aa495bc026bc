pub mod error;
pub mod view;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::application::import_service::{ImportRequest, ImportService, SubmitResult};
use crate::domain::{
    error::ImportError,
    models::{ImportJob, JobFilter, JobStatus},
};
use error::ApiError;
use view::JobView;

pub const API_PREFIX: &str = "/api/productos";

#[derive(Clone)]
struct AppState {
    service: Arc<ImportService>,
}

/// Router for the import endpoints, mounted under `/api/productos`, plus
/// `/health`.
pub fn router(service: Arc<ImportService>, max_upload_bytes: usize) -> Router {
    let state = AppState { service };

    let imports = Router::new()
        .route("/importar-csv", post(import_csv))
        .route("/importar-csv/status/{job_id}", get(job_status))
        .route("/importar-csv/jobs", get(list_jobs))
        .route("/importar-csv/jobs/{job_id}/cancelar", post(cancel_job))
        .route("/importar-csv/jobs/{job_id}/reintentar", post(retry_job))
        // Leave room for the multipart envelope around the file.
        .layer(DefaultBodyLimit::max(max_upload_bytes.saturating_add(64 * 1024)));

    Router::new()
        .nest(API_PREFIX, imports)
        .route("/health", get(health))
        .with_state(state)
}

fn status_url(job_id: &str) -> String {
    format!("{}/importar-csv/status/{}", API_PREFIX, job_id)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "si" | "sí" | "yes" | "on")
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "async_habilitado": state.service.async_enabled(),
    }))
}

async fn import_csv(State(state): State<AppState>, mut multipart: Multipart) -> Result<impl IntoResponse, ApiError> {
    let mut request = ImportRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request("SOLICITUD_INVALIDA", e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "archivo" => {
                request.upload.file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request("SOLICITUD_INVALIDA", e.to_string()))?;
                request.upload.content = Some(bytes.to_vec());
            }
            "usuario_registro" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request("SOLICITUD_INVALIDA", e.to_string()))?;
                request.registered_by = Some(text);
            }
            "forzar_asincrono" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request("SOLICITUD_INVALIDA", e.to_string()))?;
                request.force_async = parse_flag(&text);
            }
            other => debug!("Ignoring multipart field {}", other),
        }
    }

    let file_name = request.upload.file_name.clone().unwrap_or_default();
    info!("Import request for '{}' (forced async: {})", file_name, request.force_async);

    let response = match state.service.submit(request).await? {
        SubmitResult::Sync(outcome) => {
            let mut body = serde_json::to_value(&outcome)
                .map_err(|e| ApiError::from(ImportError::Storage(e.to_string())))?;
            body["mensaje"] = json!(format!(
                "Importación completada: {} exitosos, {} fallidos",
                outcome.successful, outcome.failed
            ));
            body["modo"] = json!("sincrono");
            (StatusCode::OK, Json(body))
        }
        SubmitResult::Queued(job) => (StatusCode::ACCEPTED, Json(queued_body(&job, "Archivo en cola para procesamiento"))),
    };
    Ok(response)
}

fn queued_body(job: &ImportJob, message: &str) -> serde_json::Value {
    let mut body = json!({
        "mensaje": message,
        "modo": "asincrono",
        "job_id": job.id,
        "estado": job.status.label(),
        "total_filas": job.total_rows,
        "url_status": status_url(&job.id),
    });
    if let Some(previous) = &job.retried_from {
        body["reintento_de"] = json!(previous);
        body["reintentos"] = json!(job.retry_count);
    }
    body
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    include_errors: Option<String>,
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(params): Query<StatusParams>,
) -> Result<impl IntoResponse, ApiError> {
    let include_errors = params.include_errors.as_deref().map_or(false, parse_flag);
    let job = state.service.status(&job_id).await?;
    Ok(Json(JobView::new(&job, include_errors, Utc::now())))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    usuario: Option<String>,
    estado: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_jobs(State(state): State<AppState>, Query(params): Query<ListParams>) -> Result<impl IntoResponse, ApiError> {
    let status = match params.estado.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(value) => Some(JobStatus::parse(value).ok_or_else(|| {
            ApiError::bad_request("ESTADO_INVALIDO", format!("Estado de job desconocido: {}", value))
        })?),
        None => None,
    };
    let owner = params.usuario.filter(|u| !u.trim().is_empty());
    let filter = JobFilter::new(owner, status, params.limit, params.offset);

    let page = state.service.list_jobs(&filter).await?;
    let now = Utc::now();
    let jobs: Vec<JobView> = page.jobs.iter().map(|job| JobView::new(job, false, now)).collect();

    Ok(Json(json!({
        "jobs": jobs,
        "total": page.total,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}

async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.cancel(&job_id).await?;
    Ok(Json(JobView::new(&job, false, Utc::now())))
}

async fn retry_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.resubmit(&job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(queued_body(&job, "Reintento en cola para procesamiento"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        for value in ["true", "1", "si", "Sí", "YES"] {
            assert!(parse_flag(value), "{value}");
        }
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn status_url_is_under_prefix() {
        assert_eq!(status_url("abc"), "/api/productos/importar-csv/status/abc");
    }
}
