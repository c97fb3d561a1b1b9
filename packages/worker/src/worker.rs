// ABOUTME: Runs many tasks concurrently on one engine and plugin set
// ABOUTME: Tasks rejected for lack of engine capacity are retried after a pause

use crate::config::{EngineKind, WorkerConfig};
use crate::taskrun::TaskRun;
use futures::future::join_all;
use hatch_plugins::{
    ArtifactsPlugin, CachePlugin, EnvPlugin, Plugin, PluginError, PluginSet, SuccessPlugin,
    TaskLogPlugin,
};
use hatch_runtime::{
    ExceptionReason, PayloadSchema, SchemaConflict, TaskContext, TaskInfo, TaskOutcome,
};
use hatch_sandbox::{
    DockerEngine, DockerEngineConfig, Engine, EngineError, MockEngine, MockEngineConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Engine and plugins disagree on the payload: {0}")]
    SchemaConflict(#[from] SchemaConflict),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Plugin {plugin} is enabled but not configured")]
    PluginNotConfigured { plugin: String },
}

/// One task as listed in the worker's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub task_id: String,
    #[serde(default)]
    pub run_id: u32,
    pub payload: Value,
}

impl TaskDefinition {
    pub fn info(&self) -> TaskInfo {
        TaskInfo::new(self.task_id.clone(), self.run_id)
    }
}

/// How often a task that found the engine full is retried.
#[derive(Debug, Clone, Copy)]
pub struct CapacityRetry {
    pub interval: Duration,
    pub limit: u32,
}

impl Default for CapacityRetry {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            limit: 20,
        }
    }
}

pub struct Worker {
    engine: Arc<dyn Engine>,
    plugins: Arc<PluginSet>,
    retry: CapacityRetry,
}

impl Worker {
    /// Fails if the engine and the plugins declare the same payload
    /// property differently.
    pub fn new(
        engine: Arc<dyn Engine>,
        plugins: PluginSet,
        retry: CapacityRetry,
    ) -> Result<Self, WorkerError> {
        PayloadSchema::merge([&engine.payload_schema(), &plugins.payload_schema()])?;
        info!(
            "Worker ready: engine {}, plugins [{}]",
            engine.name(),
            plugins.names().join(", ")
        );
        Ok(Self {
            engine,
            plugins: Arc::new(plugins),
            retry,
        })
    }

    /// Build the engine and plugins named by `config`.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let engine: Arc<dyn Engine> = match config.engine {
            EngineKind::Docker => Arc::new(DockerEngine::connect(DockerEngineConfig {
                endpoint: config.docker_endpoint.clone(),
                max_concurrency: config.max_concurrency,
                pull_timeout: config.image_pull_timeout,
            })?),
            EngineKind::Mock => Arc::new(MockEngine::new(MockEngineConfig {
                max_concurrency: config.max_concurrency,
                ..Default::default()
            })),
        };

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::with_capacity(config.plugins.len());
        for name in &config.plugins {
            let plugin: Arc<dyn Plugin> = match (name.as_str(), &config.artifact_dir, &config.task_log_dir) {
                ("env", _, _) => Arc::new(EnvPlugin),
                ("success", _, _) => Arc::new(SuccessPlugin),
                ("cache", _, _) => Arc::new(CachePlugin::new(Arc::clone(&engine))),
                ("artifacts", Some(dir), _) => Arc::new(ArtifactsPlugin::new(dir)),
                ("tasklog", _, Some(dir)) => Arc::new(TaskLogPlugin::new(dir)),
                _ => {
                    return Err(WorkerError::PluginNotConfigured {
                        plugin: name.clone(),
                    })
                }
            };
            plugins.push(plugin);
        }

        let retry = CapacityRetry {
            interval: config.capacity_retry_interval,
            limit: config.capacity_retry_limit,
        };
        Self::new(engine, PluginSet::new(plugins)?, retry)
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// A fresh run of `task`, ready to be driven stage by stage.
    pub fn new_task_run(&self, task: &TaskDefinition) -> TaskRun {
        TaskRun::new(
            TaskContext::new(task.info()),
            task.payload.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.plugins) as Arc<dyn Plugin>,
        )
    }

    /// Run `task` to its outcome, retrying while the engine is full.
    pub async fn run_task(&self, task: &TaskDefinition) -> TaskOutcome {
        let mut attempt = 0;
        loop {
            let outcome = self.new_task_run(task).run().await;
            if outcome != TaskOutcome::Exception(ExceptionReason::WorkerCapacity) {
                return outcome;
            }
            attempt += 1;
            if attempt > self.retry.limit {
                warn!(
                    "Task {} gave up after {} capacity retries",
                    task.info(),
                    self.retry.limit
                );
                return outcome;
            }
            info!(
                "Engine {} is full, retrying {} in {:?} ({}/{})",
                self.engine.name(),
                task.info(),
                self.retry.interval,
                attempt,
                self.retry.limit
            );
            tokio::time::sleep(self.retry.interval).await;
        }
    }

    /// Run all tasks concurrently; outcomes come back in input order.
    pub async fn run_all(&self, tasks: &[TaskDefinition]) -> Vec<(TaskInfo, TaskOutcome)> {
        join_all(tasks.iter().map(|task| async move {
            let outcome = self.run_task(task).await;
            (task.info(), outcome)
        }))
        .await
    }

    pub async fn dispose(&self) -> Result<(), WorkerError> {
        let plugins = self.plugins.dispose().await;
        let engine = self.engine.dispose().await;
        plugins?;
        engine?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use async_trait::async_trait;
    use hatch_plugins::{TaskPlugin, TaskPluginOptions};
    use serde_json::json;

    #[test]
    fn test_task_definition_from_json() {
        let tasks: Vec<TaskDefinition> = serde_json::from_value(json!([
            {"taskId": "a", "runId": 2, "payload": {"image": "x"}},
            {"taskId": "b", "payload": {}}
        ]))
        .unwrap();
        assert_eq!(tasks[0].info(), TaskInfo::new("a", 2));
        assert_eq!(tasks[1].run_id, 0);
    }

    #[tokio::test]
    async fn test_schema_conflict_with_engine_is_rejected() {
        struct Shadow;

        #[async_trait]
        impl Plugin for Shadow {
            fn name(&self) -> &'static str {
                "shadow"
            }
            fn payload_schema(&self) -> PayloadSchema {
                PayloadSchema::new().property("image", json!({"type": "integer"}), false)
            }
            async fn new_task_plugin(
                &self,
                _options: TaskPluginOptions,
            ) -> hatch_plugins::Result<Box<dyn TaskPlugin>> {
                Err(PluginError::Internal("unused".into()))
            }
        }

        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new(MockEngineConfig::default()));
        let plugins = PluginSet::new(vec![Arc::new(Shadow) as Arc<dyn Plugin>]).unwrap();
        let result = Worker::new(engine, plugins, CapacityRetry::default());
        assert!(matches!(result, Err(WorkerError::SchemaConflict(_))));
    }

    #[tokio::test]
    async fn test_from_config_builds_mock_worker() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let config = WorkerConfig::from_lookup(|name| match name {
            "HATCH_ENGINE" => Some("mock".to_string()),
            "HATCH_TASK_LOG_DIR" => Some(logs.to_string_lossy().into_owned()),
            _ => None,
        })
        .unwrap();

        let worker = Worker::from_config(&config).unwrap();
        assert_eq!(worker.engine().name(), "mock");

        let outcome = worker
            .run_task(&TaskDefinition {
                task_id: "configured".into(),
                run_id: 0,
                payload: json!({"image": "img", "function": "true"}),
            })
            .await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert!(logs.join("configured-0.log").is_file());
        worker.dispose().await.unwrap();
    }
}
