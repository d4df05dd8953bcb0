use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("File too large: {0}")]
    TooLarge(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mount error: {0}")]
    Mount(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Transport(format!("request timed out: {}", err))
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl Error {
    /// Classify a non-success HTTP status from the storage service.
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        match status.as_u16() {
            400 => Error::InvalidArgument(context.to_string()),
            401 | 403 => Error::PermissionDenied(context.to_string()),
            404 => Error::NotFound(context.to_string()),
            409 => Error::AlreadyExists(context.to_string()),
            413 => Error::TooLarge(context.to_string()),
            _ => Error::Transport(format!("{}: HTTP {}", context, status.as_u16())),
        }
    }

    /// POSIX errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::TooLarge(_) => libc::EFBIG,
            Error::Canceled(_) => libc::EINTR,
            Error::Transport(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Mount(_) => libc::EIO,
        }
    }

    /// Whether a fresh attempt of the same request may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}
