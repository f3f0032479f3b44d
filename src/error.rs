//! Error types for the deep-memory server

use thiserror::Error;

/// Result type alias for deep-memory operations
pub type Result<T> = std::result::Result<T, DeepMemError>;

/// Main error type for the deep-memory server
#[derive(Error, Debug)]
pub enum DeepMemError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("payload too large: {got} bytes exceeds limit {limit}")]
    PayloadTooLarge { got: usize, limit: usize },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("forbidden namespace: {0}")]
    ForbiddenNamespace(String),

    #[error("rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("queue overloaded: {pending} pending tasks")]
    QueueOverloaded { pending: usize, retry_after_secs: u64 },

    #[error("namespace overloaded: {0}")]
    NamespaceOverloaded(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("task exceeds max size: {got} bytes > {limit}")]
    TaskTooLarge { got: usize, limit: usize },

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("graph store error: {0}")]
    GraphStore(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("analyzer error: {0}")]
    Analyzer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeepMemError {
    /// Stable error kind string surfaced in JSON bodies
    pub fn kind(&self) -> &'static str {
        match self {
            DeepMemError::InvalidRequest(_) => "invalid_request",
            DeepMemError::InvalidJson(_) => "invalid_json",
            DeepMemError::PayloadTooLarge { .. } => "payload_too_large",
            DeepMemError::Unauthorized => "unauthorized",
            DeepMemError::Forbidden => "forbidden",
            DeepMemError::ForbiddenNamespace(_) => "forbidden_namespace",
            DeepMemError::RateLimited { .. } => "rate_limited",
            DeepMemError::QueueOverloaded { .. } => "queue_overloaded",
            DeepMemError::NamespaceOverloaded(_) => "namespace_overloaded",
            DeepMemError::TaskTooLarge { .. } => "task_too_large",
            DeepMemError::Queue(_) => "queue_error",
            DeepMemError::VectorStore(_) => "vector_store_error",
            DeepMemError::GraphStore(_) => "graph_store_error",
            DeepMemError::Embedding(_) => "embedding_error",
            DeepMemError::Analyzer(_) => "analyzer_error",
            DeepMemError::Config(_) => "config_error",
            DeepMemError::Serialization(_) => "serialization_error",
            DeepMemError::Io(_) => "io_error",
            DeepMemError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the ingress layer maps this error to
    pub fn http_status(&self) -> u16 {
        match self {
            DeepMemError::InvalidRequest(_) | DeepMemError::InvalidJson(_) => 400,
            DeepMemError::PayloadTooLarge { .. } | DeepMemError::TaskTooLarge { .. } => 413,
            DeepMemError::Unauthorized => 401,
            DeepMemError::Forbidden | DeepMemError::ForbiddenNamespace(_) => 403,
            DeepMemError::RateLimited { .. } => 429,
            DeepMemError::QueueOverloaded { .. } | DeepMemError::NamespaceOverloaded(_) => 503,
            _ => 500,
        }
    }

    /// Check if a queue worker should retry the task
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeepMemError::VectorStore(_)
                | DeepMemError::GraphStore(_)
                | DeepMemError::Embedding(_)
                | DeepMemError::Analyzer(_)
                | DeepMemError::Io(_)
        )
    }
}
