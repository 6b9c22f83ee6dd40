use std::sync::Arc;

/// Represents a result type for operations in the Flagsense SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Flagsense SDK.
///
/// Evaluation errors never reach callers of [`Client::get_variation`](crate::Client::get_variation),
/// they are absorbed there and turned into the default variation.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// SDK id or SDK secret is empty.
    #[error("empty sdk params not allowed")]
    InvalidCredentials,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Configuration has not been fetched within the allowed wait time.
    #[error("timed out waiting for initialization")]
    InitializationTimeout,

    /// Error evaluating a flag.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// The server kept answering with a non-success status.
    #[error("server responded with status {0}")]
    HttpStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Response body could not be decoded.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    BackgroundThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

/// Reasons a flag could not be evaluated for a user.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// Configuration has not been fetched yet.
    #[error("loading data")]
    NotReady,

    /// User id or flag id is empty.
    #[error("bad request")]
    BadRequest,

    /// The requested flag is not present in the configuration.
    #[error("flag not found")]
    FlagNotFound,

    /// The flag is present but the server sent it in a format this SDK does not understand.
    #[error("error parsing flag configuration, try upgrading Flagsense SDK")]
    ConfigurationParseError,

    /// Flag configuration is inconsistent (e.g., targeting refers to a variant or distribution
    /// that doesn't exist).
    #[error("configuration error, try upgrading Flagsense SDK")]
    ConfigurationError,
}

impl EvaluationError {
    /// Return `true` if the error is a normal running condition that doesn't need attention.
    pub(crate) fn is_normal(self) -> bool {
        match self {
            EvaluationError::NotReady
            | EvaluationError::BadRequest
            | EvaluationError::FlagNotFound => true,
            EvaluationError::ConfigurationParseError | EvaluationError::ConfigurationError => false,
        }
    }
}
