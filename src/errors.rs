use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy for the processing pipeline.
///
/// Soft conditions (a critical field left at its sentinel) are logged by the
/// processor and never surface here; one document's failure must not take
/// down a batch, so every variant carries enough context to report the
/// offending file to the user.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Could not extract text from {}: {message}", path.display())]
    Extraction { path: PathBuf, message: String },

    #[error("Template render failed for {}: {message}", template.display())]
    Render { template: PathBuf, message: String },

    #[error("Control file update failed: {message}")]
    Upsert { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Dispatch failed: {message}")]
    Dispatch { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn upsert(message: impl Into<String>) -> Self {
        Self::Upsert {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;
