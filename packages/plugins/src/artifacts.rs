// ABOUTME: Copies files and folders out of a finished sandbox into the worker's artifact directory
// ABOUTME: Artifacts land in <dir>/<taskId>/<runId>/<name>; a missing artifact fails the task

use crate::error::{PluginError, Result};
use crate::plugin::{Plugin, TaskPlugin, TaskPluginOptions};
use async_trait::async_trait;
use hatch_runtime::{MalformedPayloadError, PayloadSchema, TaskContext};
use hatch_sandbox::{EngineError, ResultSet};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
struct Artifact {
    /// Path inside the sandbox; a trailing `/` denotes a folder.
    path: String,
    name: String,
}

pub struct ArtifactsPlugin {
    dir: PathBuf,
}

impl ArtifactsPlugin {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Plugin for ArtifactsPlugin {
    fn name(&self) -> &'static str {
        "artifacts"
    }

    fn payload_schema(&self) -> PayloadSchema {
        PayloadSchema::new().property(
            "artifacts",
            json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "pattern": "^/"},
                        "name": {"type": "string", "pattern": "^[a-zA-Z0-9_-][a-zA-Z0-9._-]*$"}
                    },
                    "required": ["path", "name"],
                    "additionalProperties": false
                }
            }),
            false,
        )
    }

    async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
        let artifacts: Vec<Artifact> = match options.payload.get("artifacts") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                MalformedPayloadError::new(format!("task.payload.artifacts: {}", e))
            })?,
            None => Vec::new(),
        };

        let info = options.info();
        let target = self
            .dir
            .join(&info.task_id)
            .join(info.run_id.to_string());
        Ok(Box::new(ArtifactsTaskPlugin {
            context: options.context,
            target,
            artifacts,
        }))
    }
}

struct ArtifactsTaskPlugin {
    context: TaskContext,
    target: PathBuf,
    artifacts: Vec<Artifact>,
}

async fn unpack(archive: Vec<u8>, dest: &Path) -> Result<()> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dest)?;
        tar::Archive::new(archive.as_slice()).unpack(&dest)
    })
    .await
    .map_err(|e| PluginError::Internal(format!("artifact unpack task failed: {}", e)))??;
    Ok(())
}

#[async_trait]
impl TaskPlugin for ArtifactsTaskPlugin {
    async fn stopped(&self, result: &ResultSet) -> Result<bool> {
        let mut success = true;
        for artifact in &self.artifacts {
            match result.extract(&artifact.path).await {
                Ok(archive) => {
                    let dest = self.target.join(&artifact.name);
                    unpack(archive, &dest).await?;
                    debug!("Artifact {} unpacked to {}", artifact.path, dest.display());
                }
                Err(EngineError::ArtifactNotFound(path)) => {
                    self.context.log(format!("artifact '{}' not found at {}", artifact.name, path));
                    success = false;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !self.artifacts.is_empty() {
            info!(
                "Collected artifacts of {} into {}",
                self.context.info(),
                self.target.display()
            );
        }
        Ok(success)
    }
}
