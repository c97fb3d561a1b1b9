// ABOUTME: Stage machine running one task: prepare, build, start, wait, report, then tear down
// ABOUTME: Owns at most one builder or sandbox at a time and resolves the task outcome exactly once

use crate::stage::Stage;
use hatch_plugins::{Plugin, PluginError, TaskPlugin, TaskPluginOptions};
use hatch_runtime::{
    ExceptionReason, MalformedPayloadError, PayloadSchema, Resolver, TaskContext, TaskInfo,
    TaskOutcome,
};
use hatch_sandbox::{Engine, EngineError, ResultSet, Sandbox, SandboxBuilder, SandboxOptions};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum TaskRunError {
    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayloadError),

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Plugin error: {0}")]
    Plugin(PluginError),

    /// The run was killed or aborted through its handle.
    #[error("Task run was canceled")]
    Canceled,

    /// A previous stage failed, so no further stage can run.
    #[error("Task run already failed at stage {0}")]
    AlreadyFailed(Stage),

    #[error("Task run has been disposed")]
    Disposed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for TaskRunError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::MalformedPayload(e) => TaskRunError::MalformedPayload(e),
            other => TaskRunError::Engine(other),
        }
    }
}

impl From<PluginError> for TaskRunError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::MalformedPayload(e) => TaskRunError::MalformedPayload(e),
            other => TaskRunError::Plugin(other),
        }
    }
}

impl TaskRunError {
    /// How a run that failed with this error is reported.
    pub fn exception_reason(&self) -> ExceptionReason {
        match self {
            TaskRunError::MalformedPayload(_)
            | TaskRunError::Engine(EngineError::NamingConflict(_))
            | TaskRunError::Plugin(PluginError::Engine(EngineError::NamingConflict(_))) => {
                ExceptionReason::MalformedPayload
            }
            TaskRunError::Engine(EngineError::MaxConcurrencyExceeded) => {
                ExceptionReason::WorkerCapacity
            }
            TaskRunError::Canceled => ExceptionReason::Canceled,
            _ => ExceptionReason::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskRunError>;

struct HandleShared {
    info: TaskInfo,
    outcome: Resolver<TaskOutcome>,
    /// The pending builder, so a kill can discard it before it starts.
    builder: Mutex<Option<Arc<dyn SandboxBuilder>>>,
    /// The live sandbox, so a kill can reach it from outside the run.
    sandbox: Mutex<Option<Arc<dyn Sandbox>>>,
}

/// Cloneable control over a task run from other tasks.
#[derive(Clone)]
pub struct TaskRunHandle {
    shared: Arc<HandleShared>,
}

impl TaskRunHandle {
    fn new(info: TaskInfo) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                info,
                outcome: Resolver::new(),
                builder: Mutex::new(None),
                sandbox: Mutex::new(None),
            }),
        }
    }

    pub fn info(&self) -> &TaskInfo {
        &self.shared.info
    }

    fn sandbox(&self) -> Option<Arc<dyn Sandbox>> {
        self.shared
            .sandbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_builder(&self, builder: Option<Arc<dyn SandboxBuilder>>) {
        *self
            .shared
            .builder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = builder;
    }

    /// Discard the pending builder, waking a run blocked in its start.
    fn discard_builder(&self) {
        let builder = self
            .shared
            .builder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(builder) = builder {
            if let Err(e) = builder.discard() {
                warn!("Failed to discard builder of {}: {}", self.shared.info, e);
            }
        }
    }

    fn set_sandbox(&self, sandbox: Option<Arc<dyn Sandbox>>) {
        *self
            .shared
            .sandbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = sandbox;
    }

    /// Record the outcome. Only the first call has any effect.
    fn resolve(&self, outcome: TaskOutcome) -> bool {
        let won = self.shared.outcome.resolve(outcome);
        if won {
            info!("Task {} resolved as {:?}", self.shared.info, outcome);
        } else {
            debug!("Ignoring late resolution {:?} of {}", outcome, self.shared.info);
        }
        won
    }

    /// Fail the task now and kill its sandbox if one is running.
    ///
    /// A run whose sandbox is not running yet discards its builder and
    /// stops at the next stage. Either way plugins see a failed
    /// `finished` rather than an `exception`, matching the reported
    /// outcome.
    pub async fn kill(&self) {
        if !self.resolve(TaskOutcome::Failed) {
            return;
        }
        self.discard_builder();
        if let Some(sandbox) = self.sandbox() {
            if let Err(e) = sandbox.kill().await {
                warn!("Failed to kill sandbox of {}: {}", self.shared.info, e);
            }
        }
    }

    /// Cancel the task without a verdict.
    pub async fn abort(&self) {
        if !self.resolve(TaskOutcome::Exception(ExceptionReason::Canceled)) {
            return;
        }
        self.discard_builder();
        if let Some(sandbox) = self.sandbox() {
            if let Err(e) = sandbox.abort().await {
                warn!("Failed to abort sandbox of {}: {}", self.shared.info, e);
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.outcome.is_resolved()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.shared.outcome.get()
    }

    pub async fn wait(&self) -> TaskOutcome {
        self.shared.outcome.wait().await
    }
}

/// The builder or the sandbox, never both.
enum Active {
    None,
    Builder(Arc<dyn SandboxBuilder>),
    Sandbox(Arc<dyn Sandbox>),
}

/// One execution of one task.
pub struct TaskRun {
    context: TaskContext,
    payload: Value,
    engine: Arc<dyn Engine>,
    plugin: Arc<dyn Plugin>,
    handle: TaskRunHandle,
    /// Last stage that completed.
    completed: Option<Stage>,
    failure: Option<(Stage, ExceptionReason)>,
    active: Active,
    task_plugin: Option<Box<dyn TaskPlugin>>,
    result: Option<ResultSet>,
    success: bool,
    /// The `finished` hook was called.
    reported: bool,
    disposed: bool,
}

impl TaskRun {
    pub fn new(
        context: TaskContext,
        payload: Value,
        engine: Arc<dyn Engine>,
        plugin: Arc<dyn Plugin>,
    ) -> Self {
        let handle = TaskRunHandle::new(context.info().clone());
        Self {
            context,
            payload,
            engine,
            plugin,
            handle,
            completed: None,
            failure: None,
            active: Active::None,
            task_plugin: None,
            result: None,
            success: false,
            reported: false,
            disposed: false,
        }
    }

    pub fn info(&self) -> &TaskInfo {
        self.context.info()
    }

    pub fn handle(&self) -> TaskRunHandle {
        self.handle.clone()
    }

    pub fn completed_stage(&self) -> Option<Stage> {
        self.completed
    }

    /// Run every stage up to and including `target`. Stages already
    /// completed are not repeated; once a stage failed, nothing runs again.
    pub async fn run_to_stage(&mut self, target: Stage) -> Result<()> {
        if self.disposed {
            return Err(TaskRunError::Disposed);
        }
        if let Some((stage, _)) = self.failure {
            return Err(TaskRunError::AlreadyFailed(stage));
        }

        loop {
            let next = match self.completed {
                None => Stage::Prepare,
                Some(done) if done >= target => return Ok(()),
                Some(done) => match done.next() {
                    Some(next) => next,
                    None => return Ok(()),
                },
            };

            // A kill after the sandbox exists is delivered to the sandbox and
            // the run reports normally; otherwise a resolved handle stops it.
            let canceled = match self.handle.outcome() {
                None => false,
                Some(TaskOutcome::Failed) => next <= Stage::Start,
                Some(_) => true,
            };
            let outcome = if canceled {
                Err(TaskRunError::Canceled)
            } else {
                debug!("Task {} entering stage {}", self.info(), next);
                self.run_stage(next).await
            };

            if let Err(e) = outcome {
                let reason = e.exception_reason();
                match &e {
                    TaskRunError::Canceled => info!("Task {} canceled before {}", self.info(), next),
                    _ => warn!("Task {} failed in stage {}: {}", self.info(), next, e),
                }
                if !self.context.is_log_closed() {
                    self.context.log(format!("stage {} failed: {}", next, e));
                }
                self.failure = Some((next, reason));
                return Err(e);
            }
            self.completed = Some(next);
        }
    }

    /// Run the whole task, tear it down and return its outcome.
    pub async fn run(mut self) -> TaskOutcome {
        // Failures are recorded on the run and reported by `dispose`.
        let _ = self.run_to_stage(Stage::Finished).await;
        self.dispose().await;
        self.handle.wait().await
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Prepare => self.prepare().await,
            Stage::Build => self.build().await,
            Stage::Start => self.start().await,
            Stage::Started => self.started().await,
            Stage::Waiting => self.waiting().await,
            Stage::Stopped => self.stopped().await,
            Stage::Finished => self.finished().await,
        }
    }

    fn task_plugin(&self) -> Result<&dyn TaskPlugin> {
        self.task_plugin
            .as_deref()
            .ok_or_else(|| TaskRunError::Internal("task plugin missing".to_string()))
    }

    async fn prepare(&mut self) -> Result<()> {
        let engine_schema = self.engine.payload_schema();
        let plugin_schema = self.plugin.payload_schema();
        let schema = PayloadSchema::merge([&engine_schema, &plugin_schema])
            .map_err(|e| TaskRunError::Internal(e.to_string()))?;
        let validation = schema.validate(&self.payload);

        let sandbox_options = SandboxOptions {
            context: self.context.clone(),
            payload: engine_schema.filter(&self.payload),
        };
        let plugin_options = TaskPluginOptions {
            context: self.context.clone(),
            payload: plugin_schema.filter(&self.payload),
        };
        let engine = Arc::clone(&self.engine);
        let plugin = Arc::clone(&self.plugin);
        let skip_builder = validation.is_err();

        // Plugins are created even for an invalid payload so log plugins
        // can still report the problem.
        let (builder, task_plugin) = tokio::join!(
            async move {
                if skip_builder {
                    None
                } else {
                    Some(engine.new_sandbox_builder(sandbox_options))
                }
            },
            async move { plugin.new_task_plugin(plugin_options).await },
        );

        let builder_error = match builder {
            Some(Ok(builder)) => {
                let builder: Arc<dyn SandboxBuilder> = Arc::from(builder);
                self.handle.set_builder(Some(Arc::clone(&builder)));
                self.active = Active::Builder(builder);
                None
            }
            Some(Err(e)) => Some(TaskRunError::from(e)),
            None => None,
        };
        let plugin_error = match task_plugin {
            Ok(task_plugin) => {
                self.task_plugin = Some(task_plugin);
                None
            }
            Err(e) => Some(TaskRunError::from(e)),
        };

        validation?;
        match (builder_error, plugin_error) {
            (None, None) => Ok(()),
            (Some(e), None) | (None, Some(e)) => Err(e),
            (Some(b), Some(p)) => {
                if matches!(b, TaskRunError::MalformedPayload(_)) {
                    Err(b)
                } else {
                    Err(p)
                }
            }
        }
    }

    async fn build(&mut self) -> Result<()> {
        let Active::Builder(builder) = &self.active else {
            return Err(TaskRunError::Internal("no sandbox builder to configure".to_string()));
        };
        self.task_plugin()?.build_sandbox(builder.as_ref()).await?;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let Active::Builder(builder) = std::mem::replace(&mut self.active, Active::None) else {
            return Err(TaskRunError::Internal("no sandbox builder to start".to_string()));
        };
        let started = builder.start_sandbox().await;
        self.handle.set_builder(None);
        let sandbox = match started {
            Ok(sandbox) => sandbox,
            // Discarded through the handle while waiting on resolution.
            Err(EngineError::SandboxBuilderDiscarded) if self.handle.is_resolved() => {
                return Err(TaskRunError::Canceled)
            }
            Err(e) => return Err(e.into()),
        };
        self.active = Active::Sandbox(Arc::clone(&sandbox));
        self.handle.set_sandbox(Some(Arc::clone(&sandbox)));

        // A kill that landed before the sandbox was reachable.
        match self.handle.outcome() {
            Some(TaskOutcome::Failed) => sandbox.kill().await?,
            Some(TaskOutcome::Exception(_)) => sandbox.abort().await?,
            _ => {}
        }
        Ok(())
    }

    async fn started(&mut self) -> Result<()> {
        let Active::Sandbox(sandbox) = &self.active else {
            return Err(TaskRunError::Internal("no running sandbox".to_string()));
        };
        self.task_plugin()?.started(sandbox.as_ref()).await?;
        Ok(())
    }

    async fn waiting(&mut self) -> Result<()> {
        let Active::Sandbox(sandbox) = std::mem::replace(&mut self.active, Active::None) else {
            return Err(TaskRunError::Internal("no running sandbox to wait for".to_string()));
        };
        let result = sandbox.wait_for_result().await;
        self.handle.set_sandbox(None);
        drop(sandbox);
        self.result = Some(result?);
        Ok(())
    }

    async fn stopped(&mut self) -> Result<()> {
        let result = self
            .result
            .as_ref()
            .ok_or_else(|| TaskRunError::Internal("no result to report".to_string()))?;
        self.success = self.task_plugin()?.stopped(result).await?;
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the task log cannot be closed; the log is the record of
    /// the run and there is no way to continue without it.
    async fn finished(&mut self) -> Result<()> {
        if let Err(e) = self.context.close_log() {
            error!("Closing the log of {} failed: {}", self.info(), e);
            panic!("failed to close task log of {}: {}", self.info(), e);
        }
        if self.handle.outcome() == Some(TaskOutcome::Failed) {
            self.success = false;
        }
        self.reported = true;
        self.task_plugin()?.finished(self.success).await?;
        self.handle.resolve(if self.success {
            TaskOutcome::Success
        } else {
            TaskOutcome::Failed
        });
        Ok(())
    }

    /// Release everything the run holds and resolve the outcome if no
    /// stage did. Safe to call at any point and more than once.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        match std::mem::replace(&mut self.active, Active::None) {
            Active::Builder(builder) => {
                if let Err(e) = builder.discard() {
                    warn!("Discarding builder of {} failed: {}", self.info(), e);
                }
            }
            Active::Sandbox(sandbox) => {
                if let Err(e) = sandbox.abort().await {
                    warn!("Aborting sandbox of {} failed: {}", self.info(), e);
                }
            }
            Active::None => {}
        }
        self.handle.set_builder(None);
        self.handle.set_sandbox(None);
        self.result = None;

        if !self.context.is_log_closed() {
            if let Err(e) = self.context.close_log() {
                warn!("Closing the log of {} failed: {}", self.info(), e);
            }
        }

        let finished = self.completed == Some(Stage::Finished);
        if !finished {
            match (self.handle.outcome(), self.failure) {
                // Killed before the run could finish on its own.
                (Some(TaskOutcome::Failed), _) => {
                    if let (Some(task_plugin), false) = (&self.task_plugin, self.reported) {
                        if let Err(e) = task_plugin.finished(false).await {
                            warn!("Finished hook of {} failed: {}", self.info(), e);
                        }
                    }
                }
                (outcome, failure) => {
                    let reason = match (outcome, failure) {
                        (Some(TaskOutcome::Exception(reason)), _) => reason,
                        (Some(_), _) => ExceptionReason::Canceled,
                        (None, Some((_, reason))) => reason,
                        (None, None) => ExceptionReason::Canceled,
                    };
                    if let Some(task_plugin) = &self.task_plugin {
                        if let Err(e) = task_plugin.exception(reason).await {
                            warn!("Exception hook of {} failed: {}", self.info(), e);
                        }
                    }
                    self.handle.resolve(TaskOutcome::Exception(reason));
                }
            }
        }

        if let Some(task_plugin) = self.task_plugin.take() {
            if let Err(e) = task_plugin.dispose().await {
                warn!("Disposing task plugin of {} failed: {}", self.info(), e);
            }
        }
    }
}

impl Drop for TaskRun {
    fn drop(&mut self) {
        if !self.disposed {
            warn!("Task run {} dropped without being disposed", self.info());
            if let Active::Builder(builder) = std::mem::replace(&mut self.active, Active::None) {
                let _ = builder.discard();
            }
            self.handle.set_builder(None);
            self.handle.set_sandbox(None);
            self.handle.resolve(TaskOutcome::Exception(ExceptionReason::InternalError));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_plugins::{PluginSet, SuccessPlugin};
    use hatch_sandbox::{MockEngine, MockEngineConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run_with(payload: Value) -> TaskRun {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new(MockEngineConfig::default()));
        let plugins = PluginSet::new(vec![Arc::new(SuccessPlugin) as Arc<dyn Plugin>]).unwrap();
        TaskRun::new(
            TaskContext::new(TaskInfo::new("unit-task", 0)),
            payload,
            engine,
            Arc::new(plugins),
        )
    }

    #[tokio::test]
    async fn test_stages_advance_and_never_repeat() {
        let mut run = run_with(json!({"image": "img", "function": "true"}));

        run.run_to_stage(Stage::Build).await.unwrap();
        assert_eq!(run.completed_stage(), Some(Stage::Build));

        // Asking for an earlier stage is a no-op.
        run.run_to_stage(Stage::Prepare).await.unwrap();
        assert_eq!(run.completed_stage(), Some(Stage::Build));

        run.run_to_stage(Stage::Finished).await.unwrap();
        assert_eq!(run.completed_stage(), Some(Stage::Finished));
        assert_eq!(run.handle().outcome(), Some(TaskOutcome::Success));

        run.dispose().await;
        assert!(matches!(
            run.run_to_stage(Stage::Finished).await,
            Err(TaskRunError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_failure_stops_further_stages() {
        let mut run = run_with(json!({"function": "true"}));

        let err = run.run_to_stage(Stage::Finished).await.unwrap_err();
        assert!(matches!(err, TaskRunError::MalformedPayload(_)));
        assert_eq!(run.completed_stage(), None);
        assert!(matches!(
            run.run_to_stage(Stage::Build).await,
            Err(TaskRunError::AlreadyFailed(Stage::Prepare))
        ));

        run.dispose().await;
        assert_eq!(
            run.handle().outcome(),
            Some(TaskOutcome::Exception(ExceptionReason::MalformedPayload))
        );
    }

    #[test]
    fn test_exception_reasons() {
        assert_eq!(
            TaskRunError::from(EngineError::MaxConcurrencyExceeded).exception_reason(),
            ExceptionReason::WorkerCapacity
        );
        assert_eq!(
            TaskRunError::from(EngineError::NamingConflict("x".into())).exception_reason(),
            ExceptionReason::MalformedPayload
        );
        assert_eq!(
            TaskRunError::from(EngineError::SandboxAborted).exception_reason(),
            ExceptionReason::InternalError
        );
        assert_eq!(TaskRunError::Canceled.exception_reason(), ExceptionReason::Canceled);
    }
}
