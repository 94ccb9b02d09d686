//! Error types for the emulator core.

use thiserror::Error;

/// Errors that can occur while loading media, resources or settings.
#[derive(Error, Debug)]
pub enum KcError {
    #[error("Unknown disk image format: {0}")]
    Format(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Read-only media")]
    ReadOnly,

    #[error("File is locked by another process: {0}")]
    Locked(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("Invalid drive: {0}")]
    InvalidDrive(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KcError {
    /// Export failure naming the offending sector position.
    pub fn sector(cyl: usize, head: usize, sector: u8, what: &str) -> Self {
        KcError::Export(format!(
            "cylinder {}, head {}, sector {}: {}",
            cyl, head, sector, what
        ))
    }
}

/// Result type for emulator core operations.
pub type KcResult<T> = Result<T, KcError>;
