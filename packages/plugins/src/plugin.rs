// ABOUTME: Plugin and TaskPlugin traits invoked by the task runner at stage boundaries
// ABOUTME: Every hook has a no-op default so plugins only implement what they observe

use crate::error::Result;
use async_trait::async_trait;
use hatch_runtime::{ExceptionReason, PayloadSchema, TaskContext, TaskInfo};
use hatch_sandbox::{ResultSet, Sandbox, SandboxBuilder};
use serde_json::Value;

/// What a plugin receives for each task run.
#[derive(Debug, Clone)]
pub struct TaskPluginOptions {
    pub context: TaskContext,
    /// Task payload filtered down to the plugin's own properties.
    pub payload: Value,
}

impl TaskPluginOptions {
    pub fn info(&self) -> &TaskInfo {
        self.context.info()
    }
}

/// Worker-wide plugin, creating one [`TaskPlugin`] per task run.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn payload_schema(&self) -> PayloadSchema {
        PayloadSchema::new()
    }

    async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>>;

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-task plugin instance.
///
/// Hooks are called in order: `build_sandbox`, `started`, `stopped`,
/// `finished`. If the run fails or is canceled, `exception` replaces the
/// remaining hooks. `dispose` is always called last.
#[async_trait]
pub trait TaskPlugin: Send + Sync {
    async fn build_sandbox(&self, _builder: &dyn SandboxBuilder) -> Result<()> {
        Ok(())
    }

    async fn started(&self, _sandbox: &dyn Sandbox) -> Result<()> {
        Ok(())
    }

    /// Whether the task succeeded, as far as this plugin is concerned.
    async fn stopped(&self, _result: &ResultSet) -> Result<bool> {
        Ok(true)
    }

    async fn finished(&self, _success: bool) -> Result<()> {
        Ok(())
    }

    async fn exception(&self, _reason: ExceptionReason) -> Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
