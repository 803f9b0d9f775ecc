use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unauthorized")]
    Unauthorized,
    #[error("private repositories are not allowed")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("invalid service type: {0}")]
    InvalidServiceType(String),
    #[error("failed to build image:\n{stderr}")]
    BuildFailed { stderr: String },
    #[error("failed to run image: {0}")]
    RunFailed(String),
    #[error("IO error at {0}: {1}")]
    File(PathBuf, std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
