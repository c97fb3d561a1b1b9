// ABOUTME: Error types for engines, sandbox builders and sandboxes
// ABOUTME: Sentinel conditions (admission, naming conflict, discarded) plus backend failures

use hatch_runtime::{MalformedPayloadError, ResourceError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Every admission slot of the engine is taken. Backpressure, not a task failure.
    #[error("Engine is running its maximum number of concurrent sandboxes")]
    MaxConcurrencyExceeded,

    /// An environment variable, proxy hostname or mount point is already taken.
    #[error("Naming conflict: {0}")]
    NamingConflict(String),

    /// The builder was discarded or already turned into a sandbox.
    #[error("Sandbox builder has been discarded")]
    SandboxBuilderDiscarded,

    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayloadError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// The sandbox was stopped by the host and produced no result.
    #[error("Sandbox was aborted")]
    SandboxAborted,

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
