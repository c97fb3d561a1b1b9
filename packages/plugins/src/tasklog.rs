// ABOUTME: Persists the closed task log to <dir>/<taskId>-<runId>.log
// ABOUTME: Runs on both the finished and the exception path so failed runs keep their log

use crate::error::Result;
use crate::plugin::{Plugin, TaskPlugin, TaskPluginOptions};
use async_trait::async_trait;
use hatch_runtime::{ExceptionReason, TaskContext};
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct TaskLogPlugin {
    dir: PathBuf,
}

impl TaskLogPlugin {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Plugin for TaskLogPlugin {
    fn name(&self) -> &'static str {
        "tasklog"
    }

    async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
        let info = options.info();
        let path = self.dir.join(format!("{}-{}.log", info.task_id, info.run_id));
        Ok(Box::new(TaskLogTaskPlugin {
            context: options.context,
            path,
        }))
    }
}

struct TaskLogTaskPlugin {
    context: TaskContext,
    path: PathBuf,
}

impl TaskLogTaskPlugin {
    async fn persist(&self) -> Result<()> {
        if !self.context.is_log_closed() {
            warn!("Persisting log of {} before it was closed", self.context.info());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, self.context.log_contents()).await?;
        debug!("Wrote task log to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl TaskPlugin for TaskLogTaskPlugin {
    async fn finished(&self, _success: bool) -> Result<()> {
        self.persist().await
    }

    async fn exception(&self, _reason: ExceptionReason) -> Result<()> {
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_runtime::TaskInfo;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_written_on_finish_and_exception() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = TaskLogPlugin::new(dir.path().join("logs"));

        for (run_id, finish) in [(0, true), (1, false)] {
            let context = TaskContext::new(TaskInfo::new("log-task", run_id));
            context.log(format!("run {}", run_id));
            context.close_log().unwrap();

            let task = plugin
                .new_task_plugin(TaskPluginOptions {
                    context,
                    payload: json!({}),
                })
                .await
                .unwrap();
            if finish {
                task.finished(true).await.unwrap();
            } else {
                task.exception(ExceptionReason::InternalError).await.unwrap();
            }
        }

        let first = std::fs::read_to_string(dir.path().join("logs/log-task-0.log")).unwrap();
        let second = std::fs::read_to_string(dir.path().join("logs/log-task-1.log")).unwrap();
        assert!(first.contains("run 0"));
        assert!(second.contains("run 1"));
        assert_eq!(first.lines().count(), 1);
    }
}
