use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::application::csv_validator::CsvValidator;
use crate::domain::{
    error::ImportError,
    models::{ImportOutcome, ImportedRow, JobProgress, RowError, RowErrorCode, RowIssue},
    ports::ProductRepository,
};
use crate::infrastructure::parsers::csv_parser::ParsedCsv;

/// Receives counters while an import runs. Errors returned here abort the
/// import.
#[async_trait]
pub trait ProgressSink: Send {
    async fn on_progress(&mut self, progress: JobProgress) -> Result<(), ImportError>;

    async fn on_row_error(&mut self, _error: &RowError) -> Result<(), ImportError> {
        Ok(())
    }
}

pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn on_progress(&mut self, _progress: JobProgress) -> Result<(), ImportError> {
        Ok(())
    }
}

/// Validates parsed rows in order and persists every valid product.
pub struct ProductImporter {
    validator: Arc<CsvValidator>,
    products: Arc<dyn ProductRepository>,
    progress_every: u64,
}

impl ProductImporter {
    pub fn new(validator: Arc<CsvValidator>, products: Arc<dyn ProductRepository>, progress_every: u64) -> Self {
        Self {
            validator,
            products,
            progress_every: progress_every.max(1),
        }
    }

    pub fn validator(&self) -> &CsvValidator {
        &self.validator
    }

    pub async fn import(
        &self,
        parsed: &ParsedCsv,
        registered_by: Option<&str>,
        sink: &mut dyn ProgressSink,
    ) -> Result<ImportOutcome, ImportError> {
        let total_rows = parsed.rows.len() as u64;
        info!("Importing {} rows", total_rows);

        let mut seen_skus = HashSet::new();
        let mut outcome = ImportOutcome::default();

        for raw in &parsed.rows {
            let result = self.validator.validate_row(raw, &mut seen_skus, registered_by);
            let row = result.row;

            match result.product.clone() {
                Some(product) if result.issues.is_empty() => match self.products.insert(&product).await {
                    Ok(product_id) => {
                        debug!("Row {}: stored product {} as {}", row, product.sku, product_id);
                        outcome.record_success(ImportedRow::from_product(row, &product, Some(product_id)));
                    }
                    Err(ImportError::DuplicateSku { sku }) => {
                        warn!("Row {}: SKU {} already exists in storage", row, sku);
                        let mut rejected = result.into_error();
                        rejected.issues.push(RowIssue::new(
                            RowErrorCode::SkuDuplicado,
                            Some("codigo_sku"),
                            format!("Ya existe un producto con el SKU {}", sku),
                        ));
                        sink.on_row_error(&rejected).await?;
                        outcome.record_failure(rejected);
                    }
                    Err(e) => {
                        error!("Row {}: failed to store product {}: {}", row, product.sku, e);
                        return Err(e);
                    }
                },
                _ => {
                    let rejected = result.into_error();
                    sink.on_row_error(&rejected).await?;
                    outcome.record_failure(rejected);
                }
            }

            if outcome.total_rows % self.progress_every == 0 && outcome.total_rows < total_rows {
                sink.on_progress(outcome.progress(total_rows)).await?;
            }
        }

        sink.on_progress(outcome.progress(total_rows)).await?;
        info!(
            "✅ Import finished: {} rows, {} stored, {} rejected",
            outcome.total_rows, outcome.successful, outcome.failed
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::InMemoryProductRepository;

    const HEADER: &str = "nombre,codigo_sku,categoria,precio_unitario,condiciones_almacenamiento,fecha_vencimiento,proveedor_id";

    #[derive(Default)]
    struct Recorder {
        progress: Vec<JobProgress>,
        errors: Vec<usize>,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn on_progress(&mut self, progress: JobProgress) -> Result<(), ImportError> {
            self.progress.push(progress);
            Ok(())
        }

        async fn on_row_error(&mut self, error: &RowError) -> Result<(), ImportError> {
            self.errors.push(error.row);
            Ok(())
        }
    }

    fn parsed(body: &str) -> ParsedCsv {
        let validator = CsvValidator::new();
        validator.parse_bytes(format!("{HEADER}\n{body}").as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn stores_valid_rows_and_reports_progress() {
        let repo = Arc::new(InMemoryProductRepository::new());
        let importer = ProductImporter::new(Arc::new(CsvValidator::new()), repo.clone(), 2);
        let body = "A,SKU-001,insumo,1,x,31/12/2026,1\n\
                    B,SKU-002,insumo,abc,x,31/12/2026,1\n\
                    C,SKU-003,insumo,2,x,31/12/2026,1\n";
        let mut recorder = Recorder::default();

        let outcome = importer.import(&parsed(body), Some("ana"), &mut recorder).await.unwrap();

        assert_eq!(outcome.successful, 2);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.imported.iter().all(|r| r.product_id.is_some()));
        assert_eq!(repo.len().await, 2);
        assert_eq!(recorder.errors, vec![2]);
        assert_eq!(recorder.progress.len(), 2);
        assert_eq!(recorder.progress.last().unwrap().processed_rows, 3);
    }

    #[tokio::test]
    async fn storage_duplicate_becomes_row_failure() {
        let repo = Arc::new(InMemoryProductRepository::new());
        let importer = ProductImporter::new(Arc::new(CsvValidator::new()), repo.clone(), 10);
        let body = "A,SKU-001,insumo,1,x,31/12/2026,1\n";

        importer.import(&parsed(body), None, &mut NoProgress).await.unwrap();
        let again = importer.import(&parsed(body), None, &mut NoProgress).await.unwrap();

        assert_eq!(again.successful, 0);
        assert_eq!(again.failed, 1);
        assert!(again.errors[0].has_code(RowErrorCode::SkuDuplicado));
        assert_eq!(repo.len().await, 1);
    }
}
