use std::sync::Arc;
use std::time::Duration;

use product_import::{
    application::{
        csv_validator::{CsvUpload, CsvValidator},
        import_router::ImportRouter,
        import_service::{AsyncBackend, ImportRequest, ImportService, SubmitResult},
        job_reconciler::JobReconciler,
        product_importer::ProductImporter,
    },
    domain::{
        models::{ImportMessage, JobStatus, RowErrorCode},
        ports::{JobStore, QueuePublisher},
    },
    infrastructure::memory::{InMemoryBlobStore, InMemoryJobStore, InMemoryProductRepository, InMemoryQueue},
    worker::{ImportWorker, MessageOutcome, WorkerOptions},
};

const HEADER: &str = "nombre,codigo_sku,categoria,precio_unitario,condiciones_almacenamiento,fecha_vencimiento,proveedor_id";

struct Pipeline {
    service: ImportService,
    worker: ImportWorker,
    jobs: Arc<InMemoryJobStore>,
    queue: Arc<InMemoryQueue>,
    products: Arc<InMemoryProductRepository>,
}

fn pipeline() -> Pipeline {
    let jobs = Arc::new(InMemoryJobStore::new());
    let blobs = Arc::new(InMemoryBlobStore::default());
    let queue = Arc::new(InMemoryQueue::fifo());
    let products = Arc::new(InMemoryProductRepository::new());
    let importer = Arc::new(ProductImporter::new(Arc::new(CsvValidator::new()), products.clone(), 25));

    let service = ImportService::new(
        ImportRouter::new(100),
        importer.clone(),
        jobs.clone(),
        Some(AsyncBackend {
            blobs: blobs.clone(),
            queue: queue.clone(),
        }),
        3,
    );
    let worker = ImportWorker::new(
        queue.clone(),
        blobs,
        jobs.clone(),
        importer,
        JobReconciler::new(jobs.clone(), chrono::Duration::minutes(15)),
        WorkerOptions {
            wait_time: Duration::from_millis(1),
            ..WorkerOptions::default()
        },
    );
    Pipeline {
        service,
        worker,
        jobs,
        queue,
        products,
    }
}

fn csv_with(rows: usize, valid: bool) -> String {
    let mut csv = format!("{HEADER}\n");
    for i in 0..rows {
        let price = if valid { "12.50" } else { "abc" };
        csv.push_str(&format!(
            "Guantes {i},SKU-{i:04},insumo,{price},Refrigerado,31/12/2030,1\n"
        ));
    }
    csv
}

fn request(csv: String, force_async: bool) -> ImportRequest {
    ImportRequest {
        upload: CsvUpload::new("productos.csv", csv.into_bytes()),
        registered_by: Some("ana".to_string()),
        force_async,
    }
}

#[tokio::test]
async fn large_file_is_queued_and_completed_by_worker() {
    let p = pipeline();

    let job = match p.service.submit(request(csv_with(120, true), false)).await.unwrap() {
        SubmitResult::Queued(job) => job,
        other => panic!("expected a queued job, got {other:?}"),
    };
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.total_rows, 120);
    assert_eq!(p.queue.len().await, 1);

    let outcome = p.worker.poll_once().await.unwrap().unwrap();
    assert!(outcome.processed());

    let stored = p.service.status(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.progress_percent, 100.0);
    assert_eq!(stored.successful + stored.failed, stored.total_rows);
    assert_eq!(stored.successful, 120);
    assert!(stored.started_at.is_some());
    assert!(stored.finished_at.is_some());
    assert_eq!(p.products.len().await, 120);
    assert!(p.queue.is_empty().await);
}

#[tokio::test]
async fn small_file_is_imported_synchronously() {
    let p = pipeline();

    match p.service.submit(request(csv_with(3, true), false)).await.unwrap() {
        SubmitResult::Sync(outcome) => {
            assert_eq!(outcome.total_rows, 3);
            assert_eq!(outcome.successful, 3);
        }
        other => panic!("expected a synchronous import, got {other:?}"),
    }
    assert!(p.queue.is_empty().await);
    assert_eq!(p.products.len().await, 3);
}

#[tokio::test]
async fn error_details_are_capped_but_counted() {
    let p = pipeline();

    let job = match p.service.submit(request(csv_with(150, false), false)).await.unwrap() {
        SubmitResult::Queued(job) => job,
        other => panic!("expected a queued job, got {other:?}"),
    };
    p.worker.poll_once().await.unwrap().unwrap();

    let stored = p.service.status(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.failed, 150);
    assert_eq!(stored.total_errors, 150);
    assert_eq!(stored.error_details.len(), 100);
    assert!(stored.errors_truncated());
    assert!(stored.error_details[0].has_code(RowErrorCode::PrecioInvalido));
}

#[tokio::test]
async fn message_for_unknown_job_is_dropped() {
    let p = pipeline();
    let job = match p.service.submit(request(csv_with(3, true), true)).await.unwrap() {
        SubmitResult::Queued(job) => job,
        other => panic!("expected a queued job, got {other:?}"),
    };

    // Drain the real message, then deliver one whose job id points nowhere.
    p.worker.poll_once().await.unwrap().unwrap();
    let mut orphan = ImportMessage::for_job(&job);
    orphan.job_id = "no-such-job".to_string();
    p.queue.push_raw(serde_json::to_string(&orphan).unwrap()).await;

    let outcome = p.worker.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, MessageOutcome::JobMissing));
    assert!(!outcome.processed());
    assert!(p.queue.is_empty().await);
    assert!(p.jobs.get("no-such-job").await.unwrap().is_none());
}

#[tokio::test]
async fn fifo_queue_deduplicates_on_job_id() {
    let p = pipeline();
    let job = match p.service.submit(request(csv_with(2, true), true)).await.unwrap() {
        SubmitResult::Queued(job) => job,
        other => panic!("expected a queued job, got {other:?}"),
    };

    p.queue.publish(&ImportMessage::for_job(&job)).await.unwrap();
    assert_eq!(p.queue.len().await, 1);
}

#[tokio::test]
async fn cancelled_job_is_skipped_by_worker() {
    let p = pipeline();
    let job = match p.service.submit(request(csv_with(2, true), true)).await.unwrap() {
        SubmitResult::Queued(job) => job,
        other => panic!("expected a queued job, got {other:?}"),
    };
    p.service.cancel(&job.id).await.unwrap();

    let outcome = p.worker.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, MessageOutcome::Cancelled));
    assert_eq!(p.products.len().await, 0);
    assert_eq!(p.service.status(&job.id).await.unwrap().status, JobStatus::Cancelled);
}
