// ABOUTME: Immutable outcome of a finished sandbox
// ABOUTME: Success flag, exit code and access to artifacts left inside the sandbox

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Reads files and folders out of a finished sandbox.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Tar archive of the file or folder at `path`.
    async fn extract(&self, path: &str) -> Result<Vec<u8>>;
}

/// Result of one sandbox, produced once when it terminates.
#[derive(Clone)]
pub struct ResultSet {
    success: bool,
    exit_code: Option<i64>,
    killed: bool,
    artifacts: Arc<dyn ArtifactSource>,
}

impl ResultSet {
    pub fn new(success: bool, exit_code: Option<i64>, artifacts: Arc<dyn ArtifactSource>) -> Self {
        Self {
            success,
            exit_code,
            killed: false,
            artifacts,
        }
    }

    /// Failure result for a sandbox terminated by an external kill.
    pub fn killed(artifacts: Arc<dyn ArtifactSource>) -> Self {
        Self {
            success: false,
            exit_code: None,
            killed: true,
            artifacts,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }

    pub fn was_killed(&self) -> bool {
        self.killed
    }

    pub async fn extract(&self, path: &str) -> Result<Vec<u8>> {
        self.artifacts.extract(path).await
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("success", &self.success)
            .field("exit_code", &self.exit_code)
            .field("killed", &self.killed)
            .finish()
    }
}
