//! Error taxonomy shared by the pipeline stages.
//!
//! Unit-level errors (one document, one chunk, one card) are recovered by the
//! caller; session- and batch-level errors abort the current run.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("unsupported format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("parse failure in {}: {reason}", path.display())]
    ParseFailure { path: PathBuf, reason: String },
}

impl IngestionError {
    pub(crate) fn parse(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::ParseFailure {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum GenerationError {
    #[error("model request timed out: {0}")]
    ModelTimeout(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid model output: {0}")]
    InvalidOutput(String),

    #[error("generation produced no flashcards")]
    EmptyGeneration,

    #[error("generation interrupted")]
    Interrupted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReviewError {
    #[error("regeneration limit exceeded ({limit} regenerations)")]
    RegenerationLimitExceeded { limit: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("flashcard store is corrupt: {}: {reason}", path.display())]
    CorruptStore { path: PathBuf, reason: String },

    #[error("flashcard store is busy: {} is held by another session ({holder})", lock.display())]
    StoreBusy { lock: PathBuf, holder: String },

    #[error("write flashcard store {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read flashcard store {}: {source}", path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Classification of a single remote call failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("remote flashcard application unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote flashcard application is not usable: {0}")]
    RemoteMisconfigured(String),
}
