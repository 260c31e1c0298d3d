//! Error taxonomy shared by the store, face engines, index and pipeline.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No face engine could be loaded. Fatal at task start.
    #[error("no face engine available\n{0}")]
    EngineUnavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Embedding dimensionality differs from the groups it would be compared with.
    #[error("incompatible embedding: expected {expected} dimensions, got {found}")]
    IncompatibleEmbedding { expected: usize, found: usize },

    #[error("a task is already running")]
    TaskInProgress,

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("face detection failed: {0}")]
    Detection(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("background task failed: {0}")]
    Join(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config write: {0}")]
    ConfigWrite(#[from] toml::ser::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether this error must stop a whole task rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EngineUnavailable(_) | Error::TaskInProgress)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Join(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("group", 42);
        assert_eq!(err.to_string(), "group not found: 42");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::EngineUnavailable("x".into()).is_fatal());
        assert!(Error::TaskInProgress.is_fatal());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!Error::IncompatibleEmbedding { expected: 3, found: 2 }.is_fatal());
    }
}
