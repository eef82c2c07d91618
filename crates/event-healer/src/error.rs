use crate::source::SourceError;
use thiserror::Error;

/// Errors that stop a pipeline or prevent the process from starting
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration; the process refuses to start
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unrecoverable failure of the event source
    #[error("Watch failed: {0}")]
    Watch(#[from] SourceError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if error is a startup configuration problem
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
