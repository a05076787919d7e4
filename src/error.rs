use thiserror::Error;

/// The error hierarchy shared by every layer of the KME core.
///
/// The gateway is the only layer that knows how to turn one of these into an
/// HTTP status code; every other module just returns `Result<T, KmeError>`.
#[derive(Error, Debug)]
pub enum KmeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("admission error: {0}")]
    Admission(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("fatal configuration error: {0}")]
    Fatal(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, KmeError>;

impl KmeError {
    /// The HTTP status code the gateway should render this error as.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;

        match self {
            KmeError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            KmeError::Admission(_) => StatusCode::BAD_REQUEST,
            KmeError::Identity(_) => StatusCode::BAD_REQUEST,
            KmeError::Routing(_) => StatusCode::BAD_REQUEST,
            KmeError::Relay(_) => StatusCode::BAD_REQUEST,
            KmeError::NotFound(_) => StatusCode::NOT_FOUND,
            KmeError::Conflict(_) => StatusCode::BAD_REQUEST,
            KmeError::Transient(_) => StatusCode::BAD_REQUEST,
            KmeError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            KmeError::Network(_) | KmeError::Http(_) => StatusCode::BAD_REQUEST,
            KmeError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}
