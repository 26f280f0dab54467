use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("ingestion failed: {0}")]
    Ingestion(String),
    #[error("geocoding failed: {0}")]
    Geocoding(String),
    #[error("run cancelled")]
    Cancelled,
}

impl AppError {
    /// Whether a caller should offer to retry the run that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Ingestion(_) | AppError::Http(_))
    }
}
