// ABOUTME: Named cache folders that persist across tasks and are mounted into sandboxes
// ABOUTME: One engine volume per cache name, created on first use

use crate::error::Result;
use crate::plugin::{Plugin, TaskPlugin, TaskPluginOptions};
use async_trait::async_trait;
use hatch_runtime::{MalformedPayloadError, PayloadSchema};
use hatch_sandbox::{Engine, SandboxBuilder, Volume};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheMount {
    name: String,
    mount_point: String,
    #[serde(default)]
    read_only: bool,
}

pub struct CachePlugin {
    engine: Arc<dyn Engine>,
    volumes: Arc<Mutex<HashMap<String, Arc<dyn Volume>>>>,
}

impl CachePlugin {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            volumes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Plugin for CachePlugin {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn payload_schema(&self) -> PayloadSchema {
        PayloadSchema::new().property(
            "caches",
            json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "pattern": "^[a-zA-Z0-9_.-]+$"},
                        "mountPoint": {"type": "string"},
                        "readOnly": {"type": "boolean"}
                    },
                    "required": ["name", "mountPoint"],
                    "additionalProperties": false
                }
            }),
            false,
        )
    }

    async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
        let mounts: Vec<CacheMount> = match options.payload.get("caches") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                MalformedPayloadError::new(format!("task.payload.caches: {}", e))
            })?,
            None => Vec::new(),
        };

        let mut resolved = Vec::with_capacity(mounts.len());
        let mut volumes = self.volumes.lock().await;
        for mount in mounts {
            let volume = match volumes.get(&mount.name) {
                Some(volume) => Arc::clone(volume),
                None => {
                    let volume = self.engine.new_cache_folder().await?;
                    info!("Created cache {} as volume {}", mount.name, volume.name());
                    volumes.insert(mount.name.clone(), Arc::clone(&volume));
                    volume
                }
            };
            resolved.push((mount, volume));
        }

        Ok(Box::new(CacheTaskPlugin { mounts: resolved }))
    }

    async fn dispose(&self) -> Result<()> {
        self.volumes.lock().await.clear();
        Ok(())
    }
}

struct CacheTaskPlugin {
    mounts: Vec<(CacheMount, Arc<dyn Volume>)>,
}

#[async_trait]
impl TaskPlugin for CacheTaskPlugin {
    async fn build_sandbox(&self, builder: &dyn SandboxBuilder) -> Result<()> {
        for (mount, volume) in &self.mounts {
            builder.attach_volume(&mount.mount_point, Arc::clone(volume), mount.read_only)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use hatch_runtime::{TaskContext, TaskInfo};
    use hatch_sandbox::{EngineError, MockEngine, MockEngineConfig, SandboxOptions};
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    async fn run(engine: &Arc<MockEngine>, plugin: &CachePlugin, function: &str, caches: Value) -> Result<bool> {
        let context = TaskContext::new(TaskInfo::new("cache-task", 0));
        let builder = engine
            .new_sandbox_builder(SandboxOptions {
                context: context.clone(),
                payload: json!({"image": "img", "function": function, "argument": "/cache/"}),
            })
            .unwrap();
        let task = plugin
            .new_task_plugin(TaskPluginOptions {
                context,
                payload: json!({ "caches": caches }),
            })
            .await?;
        task.build_sandbox(builder.as_ref()).await?;
        let result = builder.start_sandbox().await?.wait_for_result().await?;
        Ok(result.success())
    }

    #[tokio::test]
    async fn test_cache_is_shared_between_tasks() {
        let engine = Arc::new(MockEngine::new(MockEngineConfig::default()));
        let plugin = CachePlugin::new(Arc::clone(&engine) as Arc<dyn Engine>);
        let caches = json!([{"name": "deps", "mountPoint": "/cache/"}]);

        assert!(!run(&engine, &plugin, "get-volume", caches.clone()).await.unwrap());
        assert!(run(&engine, &plugin, "set-volume", caches.clone()).await.unwrap());
        assert!(run(&engine, &plugin, "get-volume", caches).await.unwrap());
        assert_eq!(plugin.cache_names().await, vec!["deps".to_string()]);
    }

    #[tokio::test]
    async fn test_read_only_cache_cannot_be_written() {
        let engine = Arc::new(MockEngine::new(MockEngineConfig::default()));
        let plugin = CachePlugin::new(Arc::clone(&engine) as Arc<dyn Engine>);
        let caches = json!([{"name": "deps", "mountPoint": "/cache/", "readOnly": true}]);

        assert!(!run(&engine, &plugin, "set-volume", caches).await.unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_cache_mounts_conflict() {
        let engine = Arc::new(MockEngine::new(MockEngineConfig::default()));
        let plugin = CachePlugin::new(Arc::clone(&engine) as Arc<dyn Engine>);
        let caches = json!([
            {"name": "a", "mountPoint": "/cache/"},
            {"name": "b", "mountPoint": "/cache/inner/"}
        ]);

        let err = run(&engine, &plugin, "true", caches).await.unwrap_err();
        assert!(matches!(err, PluginError::Engine(EngineError::NamingConflict(_))));
        assert_eq!(engine.running(), 0);
    }
}
