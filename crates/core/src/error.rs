use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document has no text: {0}")]
    EmptyDocument(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("collection not found: {0}")]
    CollectionMissing(String),

    #[error("vector dimension {actual} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{backend} returned {status}: {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {backend}: {details}")]
    InvalidResponse { backend: String, details: String },

    #[error("model file missing: {0}; run `docchat setup` to download it")]
    FilesMissing(String),

    #[error("{backend} runtime error: {details}")]
    Runtime { backend: String, details: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Errors reported by pipeline operations to their callers.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("vector dimension {actual} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("a rebuild is already in progress")]
    RebuildInProgress,

    #[error("index is not ready: {0}")]
    NotReady(String),

    #[error("no documents found in {0}")]
    NoDocuments(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Ingest(IngestError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::RebuildInProgress => "rebuild_in_progress",
            Self::NotReady(_) => "not_ready",
            Self::NoDocuments(_) => "no_documents",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Ingest(_) => "ingest_failed",
            Self::Io(_) => "io",
        }
    }

    /// True for failures of an external service that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable(_) | Self::StoreUnavailable(_) | Self::RebuildInProgress
        )
    }

    /// Message safe to show an end user: names the kind of problem, not its internals.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConfigurationMissing(key) => {
                format!("The service is not configured: {key} is missing.")
            }
            Self::InvalidConfiguration(details) => {
                format!("The service configuration is invalid: {details}.")
            }
            Self::ModelUnavailable(_) => {
                "The language or embedding model is unavailable right now. Please try again later."
                    .to_string()
            }
            Self::StoreUnavailable(_) => {
                "The vector store is unavailable right now. Please try again later.".to_string()
            }
            Self::RebuildInProgress => {
                "An index rebuild is already running. Please wait for it to finish.".to_string()
            }
            Self::NotReady(_) => {
                "The document index has not been built yet. Run a rebuild first.".to_string()
            }
            Self::NoDocuments(path) => format!("No documents were found in {path}."),
            Self::InvalidRequest(details) => format!("Invalid request: {details}."),
            Self::UnsupportedFormat(_)
            | Self::DimensionMismatch { .. }
            | Self::Ingest(_)
            | Self::Io(_) => "The index could not be processed. Check the server logs.".to_string(),
        }
    }
}

impl From<StoreError> for RagError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<ModelError> for RagError {
    fn from(error: ModelError) -> Self {
        Self::ModelUnavailable(error.to_string())
    }
}

impl From<ConfigError> for RagError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Missing(key) => Self::ConfigurationMissing(key),
            invalid @ ConfigError::Invalid { .. } => Self::InvalidConfiguration(invalid.to_string()),
        }
    }
}

impl From<IngestError> for RagError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::UnsupportedFormat(path) => Self::UnsupportedFormat(path),
            IngestError::InvalidArgument(details) => Self::InvalidRequest(details),
            other => Self::Ingest(other),
        }
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_surface_as_store_unavailable() {
        let error: RagError = StoreError::Unreachable("connection refused".to_string()).into();
        assert_eq!(error.kind(), "store_unavailable");
        assert!(error.is_transient());
    }

    #[test]
    fn dimension_mismatch_keeps_its_kind() {
        let error: RagError = StoreError::DimensionMismatch {
            expected: 4,
            actual: 3,
        }
        .into();
        assert!(matches!(
            error,
            RagError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert!(!error.is_transient());
    }

    #[test]
    fn configuration_errors_are_not_transient() {
        let error: RagError = ConfigError::Missing("OPENAI_API_KEY".to_string()).into();
        assert_eq!(error.kind(), "configuration_missing");
        assert!(!error.is_transient());
        assert!(error.user_message().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn user_message_hides_internal_details() {
        let error = RagError::StoreUnavailable("tcp connect error 10.0.0.4:6333".to_string());
        assert!(!error.user_message().contains("10.0.0.4"));
    }
}
