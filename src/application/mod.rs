pub mod csv_validator;
pub mod import_router;
pub mod import_service;
pub mod job_reconciler;
pub mod product_importer;
