use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    /// The bytes at the header offset are not `PE\0\0`.
    #[error("Not a valid PE file")]
    InvalidFormat,

    /// The stream ran out before a header field could be read in full.
    #[error("Unexpected end of file while reading the executable header")]
    UnexpectedEndOfFile,

    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    #[error("Injection failed: {0}")]
    InjectionFailed(String),

    /// Only produced inside the log watcher, which retries on it.
    #[error("File {} is not available", .0.display())]
    FileUnavailable(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Failed to build mods manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;
