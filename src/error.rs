//! Error types shared across the run pipeline
//!
//! Each stage has its own error enum so the engine can map a failure to the
//! right terminal status without inspecting message strings.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to run a program at all (as opposed to a program that ran and failed)
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("No command specified for execution")]
    EmptyCommand,

    #[error("Program '{program}' could not be started: {source}")]
    NotRunnable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while supervising process: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Two files collide on destination '{}'", .0.display())]
    Collision(PathBuf),

    #[error("Corrupt archive '{name}': {source}")]
    CorruptArchive {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Destination '{0}' escapes the working directory")]
    UnsafePath(String),

    #[error("Failed to fetch blob '{path}': {reason}")]
    Fetch { path: String, reason: String },

    #[error("Storage lookup failed: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error while staging: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Builder tool unavailable: {0}")]
    Unavailable(#[source] ExecError),

    #[error("I/O error in builder: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for BuildError {
    fn from(e: ExecError) -> Self {
        BuildError::Unavailable(e)
    }
}

#[derive(Debug, Error)]
pub enum TestError {
    #[error("Required grading artifact missing: {0}")]
    MissingArtifact(String),

    #[error("Grading program could not run: {0}")]
    Exec(#[from] ExecError),

    #[error("Reference solution failed on '{input}' with retcode {retcode}")]
    ReferenceFailed { input: String, retcode: i32 },

    #[error("I/O error in tester: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Reporter '{0}' is not registered")]
    Unknown(String),

    #[error("Report delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Test '{test}' and submission '{submission}' belong to different assignments")]
    AssignmentMismatch { test: String, submission: String },

    #[error("Test '{test}' names an unknown {stage} '{id}'")]
    UnknownPlugin {
        test: String,
        stage: &'static str,
        id: String,
    },

    #[error("Worker pool is shut down")]
    Closed,
}
