// ABOUTME: Reports the task as successful exactly when its sandbox succeeded

use crate::error::Result;
use crate::plugin::{Plugin, TaskPlugin, TaskPluginOptions};
use async_trait::async_trait;
use hatch_runtime::TaskContext;
use hatch_sandbox::ResultSet;

pub struct SuccessPlugin;

#[async_trait]
impl Plugin for SuccessPlugin {
    fn name(&self) -> &'static str {
        "success"
    }

    async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
        Ok(Box::new(SuccessTaskPlugin {
            context: options.context,
        }))
    }
}

struct SuccessTaskPlugin {
    context: TaskContext,
}

#[async_trait]
impl TaskPlugin for SuccessTaskPlugin {
    async fn stopped(&self, result: &ResultSet) -> Result<bool> {
        if result.was_killed() {
            self.context.log("task was killed");
        } else if let Some(code) = result.exit_code() {
            self.context.log(format!("sandbox exited with code {}", code));
        }
        Ok(result.success())
    }
}
