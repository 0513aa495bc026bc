use thiserror::Error;

/// Coarse classification callers branch on instead of matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The upload as a whole is unusable (missing file, bad header, no rows).
    Structural,
    /// A single row was rejected; never aborts a batch.
    RowValidation,
    /// Blob, queue, database or configuration failure.
    Infrastructure,
    /// A queue message that can never be processed.
    Poison,
    NotFound,
    /// The requested change conflicts with the job's current state.
    Conflict,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("No se proporcionó ningún archivo")]
    MissingFile,

    #[error("El archivo debe ser un CSV (.csv): {file_name}")]
    InvalidFormat { file_name: String },

    #[error("El archivo no está codificado en UTF-8")]
    InvalidEncoding,

    #[error("El archivo CSV está vacío o no tiene encabezados")]
    EmptyCsv,

    #[error("El CSV no contiene todas las columnas requeridas: {}", missing.join(", "))]
    MissingColumns { missing: Vec<String> },

    #[error("El archivo CSV no contiene filas de datos")]
    NoDataRows,

    #[error("Error al leer el archivo CSV: {0}")]
    MalformedCsv(String),

    #[error("Ya existe un producto con el SKU {sku}")]
    DuplicateSku { sku: String },

    #[error("Procesamiento asíncrono no disponible: {0}")]
    AsyncUnavailable(String),

    #[error("Archivo no encontrado: {key}")]
    BlobNotFound { key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job {0} no encontrado")]
    JobNotFound(String),

    #[error("Job {job_id}: transición inválida de {from} a {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Job {job_id}: progreso inválido: {reason}")]
    InvalidProgress { job_id: String, reason: String },

    #[error("Job {job_id} alcanzó el máximo de reintentos ({max_retries})")]
    RetryLimitReached { job_id: String, max_retries: u32 },

    #[error("Job {0} fue modificado concurrentemente")]
    ConcurrentModification(String),

    #[error("Mensaje inválido: {0}")]
    PoisonMessage(String),
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::MissingFile
            | ImportError::InvalidFormat { .. }
            | ImportError::InvalidEncoding
            | ImportError::EmptyCsv
            | ImportError::MissingColumns { .. }
            | ImportError::NoDataRows
            | ImportError::MalformedCsv(_) => ErrorKind::Structural,
            ImportError::DuplicateSku { .. } => ErrorKind::RowValidation,
            ImportError::AsyncUnavailable(_)
            | ImportError::BlobNotFound { .. }
            | ImportError::Storage(_)
            | ImportError::Queue(_)
            | ImportError::Database(_)
            | ImportError::Config(_) => ErrorKind::Infrastructure,
            ImportError::JobNotFound(_) => ErrorKind::NotFound,
            ImportError::InvalidTransition { .. }
            | ImportError::InvalidProgress { .. }
            | ImportError::RetryLimitReached { .. }
            | ImportError::ConcurrentModification(_) => ErrorKind::Conflict,
            ImportError::PoisonMessage(_) => ErrorKind::Poison,
        }
    }

    /// Machine-readable code returned to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::MissingFile => "ARCHIVO_FALTANTE",
            ImportError::InvalidFormat { .. } => "FORMATO_INVALIDO",
            ImportError::InvalidEncoding => "CODIFICACION_INVALIDA",
            ImportError::EmptyCsv => "CSV_VACIO",
            ImportError::MissingColumns { .. } => "COLUMNAS_FALTANTES",
            ImportError::NoDataRows => "CSV_SIN_DATOS",
            ImportError::MalformedCsv(_) => "ERROR_LECTURA_CSV",
            ImportError::DuplicateSku { .. } => "SKU_DUPLICADO",
            ImportError::AsyncUnavailable(_) => "AWS_NO_DISPONIBLE",
            ImportError::BlobNotFound { .. } => "ARCHIVO_NO_ENCONTRADO",
            ImportError::Storage(_) => "ERROR_ALMACENAMIENTO",
            ImportError::Queue(_) => "ERROR_COLA",
            ImportError::Database(_) => "ERROR_BASE_DATOS",
            ImportError::Config(_) => "ERROR_CONFIGURACION",
            ImportError::JobNotFound(_) => "JOB_NO_ENCONTRADO",
            ImportError::InvalidTransition { .. } => "TRANSICION_INVALIDA",
            ImportError::InvalidProgress { .. } => "PROGRESO_INVALIDO",
            ImportError::RetryLimitReached { .. } => "REINTENTOS_AGOTADOS",
            ImportError::ConcurrentModification(_) => "CONFLICTO_CONCURRENCIA",
            ImportError::PoisonMessage(_) => "MENSAJE_INVALIDO",
        }
    }

    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::Structural
    }
}
