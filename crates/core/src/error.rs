use thiserror::Error;

/// Core error types for the pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Input failed validation before any work was done
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The same block (height, hash) was already ingested
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Error when interacting with the store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error on an outbound network call
    #[error("Network error: {0}")]
    Network(String),

    /// Error when parsing wire data
    #[error("Failed to parse data: {0}")]
    Parse(String),

    /// A view handler failed; isolated to its view
    #[error("Handler error: {0}")]
    Handler(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other error with its source
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new duplicate error
    pub fn duplicate<S: Into<String>>(msg: S) -> Self {
        Error::Duplicate(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Error::Network(msg.into())
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    /// Create a new handler error
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Error::Handler(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Whether retrying the operation later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Network(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Storage(s)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            // Unique violations surface as Duplicate so callers racing on
            // the same row can treat the loss as idempotent success.
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                Error::Duplicate(format!("unique violation: {}", db.message()))
            }
            _ => Error::Storage(format!("Database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(format!("JSON parsing error: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(format!("I/O error: {}", err))
    }
}

/// Result type used across the pipeline crates
pub type Result<T> = std::result::Result<T, Error>;
