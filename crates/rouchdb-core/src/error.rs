use thiserror::Error;

/// All errors that RouchDB can produce.
#[derive(Debug, Error)]
pub enum RouchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: document update conflict")]
    Conflict,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid revision format: {0}")]
    InvalidRev(String),

    #[error("missing document id")]
    MissingId,

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("attachment missing: {doc_id}/{filename}")]
    AttachmentMissing { doc_id: String, filename: String },

    #[error("attachment not saved: {0}")]
    AttachmentNotSaved(String),

    #[error("replication cancelled")]
    ReplicationCancelled,

    #[error("transient error: {message}")]
    Transient {
        message: String,
        /// `Retry-After` hint from the source, in seconds, when known.
        retry_after_secs: Option<u64>,
    },
}

impl RouchError {
    /// Construct a transient error with no `Retry-After` hint.
    pub fn transient(message: impl Into<String>) -> Self {
        RouchError::Transient {
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouchError>;
