//! Error types for relay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Model errors
    #[error("Duplicate project name: {0}")]
    DuplicateProject(String),

    #[error("Duplicate platform name: {0}")]
    DuplicatePlatform(String),

    #[error("Invalid project {project}: {message}")]
    InvalidProject { project: String, message: String },

    #[error("Invalid platform {platform}: {message}")]
    InvalidPlatform { platform: String, message: String },

    #[error("Invalid nightly schedule {hour:02}:{minute:02}")]
    InvalidSchedule { hour: u8, minute: u8 },

    #[error("Invalid trigger graph: {0}")]
    InvalidGraph(String),

    // Trigger errors
    #[error("Scheduler not found: {0}")]
    SchedulerNotFound(String),

    #[error("Scheduler {0} does not accept manual requests")]
    NotManual(String),

    #[error("Scheduler {0} only fires on a forced build request")]
    ForceOnly(String),

    #[error("Forced build requires a reason")]
    MissingReason,

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Lock manager error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
