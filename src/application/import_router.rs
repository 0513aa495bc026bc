use tracing::{debug, warn};

use crate::domain::error::ImportError;

pub const DEFAULT_ASYNC_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Sync,
    Async,
}

/// Cheap data-row estimate taken before any structural validation: non-blank
/// lines minus the header.
pub fn count_data_rows(content: &[u8]) -> u64 {
    let non_blank = content
        .split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .count() as u64;
    non_blank.saturating_sub(1)
}

#[derive(Debug, Clone, Copy)]
pub struct ImportRouter {
    threshold: u64,
}

impl Default for ImportRouter {
    fn default() -> Self {
        Self::new(DEFAULT_ASYNC_THRESHOLD)
    }
}

impl ImportRouter {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    /// Async iff `total_rows >= threshold` or forced. Never falls back to sync
    /// when the async backend is down.
    pub fn decide(&self, total_rows: u64, force_async: bool, async_available: bool) -> Result<ProcessingMode, ImportError> {
        let wants_async = force_async || total_rows >= self.threshold;
        debug!(
            "Routing decision: rows={}, threshold={}, forced={}, async_available={}",
            total_rows, self.threshold, force_async, async_available
        );

        if !wants_async {
            return Ok(ProcessingMode::Sync);
        }
        if !async_available {
            warn!("Asynchronous processing required for {} rows but backend is disabled", total_rows);
            return Err(ImportError::AsyncUnavailable(format!(
                "el archivo tiene {} filas (umbral {}) y el procesamiento asíncrono no está habilitado",
                total_rows, self.threshold
            )));
        }
        Ok(ProcessingMode::Async)
    }
}
