// ABOUTME: Runs a list of plugins as one, concurrently, with a merged payload schema
// ABOUTME: A task succeeds only if every plugin reports success

use crate::error::{merge_errors, Result};
use crate::plugin::{Plugin, TaskPlugin, TaskPluginOptions};
use async_trait::async_trait;
use futures::future::join_all;
use hatch_runtime::{ExceptionReason, PayloadSchema, SchemaConflict};
use hatch_sandbox::{ResultSet, Sandbox, SandboxBuilder};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Collapse hook results into one, keeping the values on success.
fn collect<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => errors.push(e),
        }
    }
    match merge_errors(errors) {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

async fn each<'a, T, F, Fut>(plugins: &'a [Box<dyn TaskPlugin>], hook: F) -> Result<Vec<T>>
where
    F: Fn(&'a dyn TaskPlugin) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    collect(join_all(plugins.iter().map(|p| hook(p.as_ref()))).await)
}

pub struct PluginSet {
    plugins: Vec<Arc<dyn Plugin>>,
    schema: PayloadSchema,
}

impl PluginSet {
    /// Fails if two plugins declare the same payload property differently.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> std::result::Result<Self, SchemaConflict> {
        let schemas: Vec<PayloadSchema> = plugins.iter().map(|p| p.payload_schema()).collect();
        let schema = PayloadSchema::merge(&schemas)?;
        Ok(Self { plugins, schema })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}

#[async_trait]
impl Plugin for PluginSet {
    fn name(&self) -> &'static str {
        "plugin-set"
    }

    fn payload_schema(&self) -> PayloadSchema {
        self.schema.clone()
    }

    async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
        let created = join_all(self.plugins.iter().map(|plugin| {
            let options = TaskPluginOptions {
                context: options.context.clone(),
                payload: plugin.payload_schema().filter(&options.payload),
            };
            async move { plugin.new_task_plugin(options).await }
        }))
        .await;

        let mut plugins = Vec::with_capacity(created.len());
        let mut errors = Vec::new();
        for result in created {
            match result {
                Ok(plugin) => plugins.push(plugin),
                Err(e) => errors.push(e),
            }
        }

        if let Some(error) = merge_errors(errors) {
            // The created instances will never see another hook.
            for result in join_all(plugins.iter().map(|p| p.dispose())).await {
                if let Err(e) = result {
                    warn!("Failed to dispose task plugin after creation error: {}", e);
                }
            }
            return Err(error);
        }

        debug!("Created {} task plugins for {}", plugins.len(), options.info());
        Ok(Box::new(TaskPluginSet { plugins }))
    }

    async fn dispose(&self) -> Result<()> {
        collect(join_all(self.plugins.iter().map(|p| p.dispose())).await).map(|_| ())
    }
}

struct TaskPluginSet {
    plugins: Vec<Box<dyn TaskPlugin>>,
}

#[async_trait]
impl TaskPlugin for TaskPluginSet {
    async fn build_sandbox(&self, builder: &dyn SandboxBuilder) -> Result<()> {
        each(&self.plugins, |p| p.build_sandbox(builder)).await.map(|_| ())
    }

    async fn started(&self, sandbox: &dyn Sandbox) -> Result<()> {
        each(&self.plugins, |p| p.started(sandbox)).await.map(|_| ())
    }

    async fn stopped(&self, result: &ResultSet) -> Result<bool> {
        let verdicts = each(&self.plugins, |p| p.stopped(result)).await?;
        Ok(verdicts.into_iter().all(|success| success))
    }

    async fn finished(&self, success: bool) -> Result<()> {
        each(&self.plugins, |p| p.finished(success)).await.map(|_| ())
    }

    async fn exception(&self, reason: ExceptionReason) -> Result<()> {
        each(&self.plugins, |p| p.exception(reason)).await.map(|_| ())
    }

    async fn dispose(&self) -> Result<()> {
        each(&self.plugins, |p| p.dispose()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use hatch_runtime::{MalformedPayloadError, TaskContext, TaskInfo};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports a fixed verdict and counts disposals.
    struct Verdict {
        name: &'static str,
        success: bool,
        fail_create: bool,
        disposed: Arc<AtomicUsize>,
    }

    struct VerdictTask {
        success: bool,
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Verdict {
        fn name(&self) -> &'static str {
            self.name
        }

        fn payload_schema(&self) -> PayloadSchema {
            PayloadSchema::new().property(self.name, json!({"type": "boolean"}), false)
        }

        async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
            if self.fail_create {
                return Err(MalformedPayloadError::new(format!("{} rejects payload", self.name)).into());
            }
            // Only this plugin's own property survives filtering.
            let keys: Vec<&String> = options.payload.as_object().map(|o| o.keys().collect()).unwrap_or_default();
            assert!(keys.iter().all(|k| k.as_str() == self.name));
            Ok(Box::new(VerdictTask {
                success: self.success,
                disposed: Arc::clone(&self.disposed),
            }))
        }
    }

    #[async_trait]
    impl TaskPlugin for VerdictTask {
        async fn stopped(&self, _result: &ResultSet) -> Result<bool> {
            Ok(self.success)
        }

        async fn dispose(&self) -> Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn verdict(name: &'static str, success: bool, fail_create: bool, disposed: &Arc<AtomicUsize>) -> Arc<dyn Plugin> {
        Arc::new(Verdict {
            name,
            success,
            fail_create,
            disposed: Arc::clone(disposed),
        })
    }

    fn options() -> TaskPluginOptions {
        TaskPluginOptions {
            context: TaskContext::new(TaskInfo::new("set-task", 0)),
            payload: json!({"a": true, "b": false, "image": "x"}),
        }
    }

    struct NoArtifacts;

    #[async_trait]
    impl hatch_sandbox::ArtifactSource for NoArtifacts {
        async fn extract(&self, path: &str) -> hatch_sandbox::Result<Vec<u8>> {
            Err(hatch_sandbox::EngineError::ArtifactNotFound(path.to_string()))
        }
    }

    #[tokio::test]
    async fn test_stopped_is_conjunction() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let result = ResultSet::new(true, Some(0), Arc::new(NoArtifacts));

        let all_good = PluginSet::new(vec![
            verdict("a", true, false, &disposed),
            verdict("b", true, false, &disposed),
        ])
        .unwrap();
        let task = all_good.new_task_plugin(options()).await.unwrap();
        assert!(task.stopped(&result).await.unwrap());

        let one_bad = PluginSet::new(vec![
            verdict("a", true, false, &disposed),
            verdict("b", false, false, &disposed),
        ])
        .unwrap();
        let task = one_bad.new_task_plugin(options()).await.unwrap();
        assert!(!task.stopped(&result).await.unwrap());
        task.dispose().await.unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_creation_failure_disposes_created_plugins() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let set = PluginSet::new(vec![
            verdict("a", true, false, &disposed),
            verdict("b", true, true, &disposed),
        ])
        .unwrap();

        let err = set.new_task_plugin(options()).await.err().expect("creation fails");
        assert!(err.is_malformed_payload());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conflicting_schemas_are_rejected() {
        struct Clash(&'static str);

        #[async_trait]
        impl Plugin for Clash {
            fn name(&self) -> &'static str {
                self.0
            }
            fn payload_schema(&self) -> PayloadSchema {
                let kind = if self.0 == "one" { "string" } else { "integer" };
                PayloadSchema::new().property("shared", json!({"type": kind}), false)
            }
            async fn new_task_plugin(&self, _options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
                Err(PluginError::Internal("unused".into()))
            }
        }

        let result = PluginSet::new(vec![
            Arc::new(Clash("one")) as Arc<dyn Plugin>,
            Arc::new(Clash("two")),
        ]);
        assert_eq!(result.err().map(|e| e.property), Some("shared".to_string()));
    }
}
