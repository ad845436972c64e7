use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing parameter: {0}")]
    MissingParam(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Extension error: {0}")]
    Extension(String),

    #[error("Extension disconnected: {0}")]
    ExtensionDisconnected(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Structured error code surfaced to agents in tool results.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Json(_) => "invalid_json",
            Error::Validation(_) | Error::Config(_) => "invalid_param",
            Error::MissingParam(_) => "missing_param",
            Error::PermissionDenied(_) => "permission_denied",
            Error::NotFound(_) => "no_data",
            Error::Timeout(_) => "extension_timeout",
            Error::RateLimited(_) => "rate_limited",
            Error::ExtensionDisconnected(_) => "extension_disconnected",
            Error::Extension(_) | Error::Io(_) | Error::Storage(_) | Error::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
