// ABOUTME: Engine, SandboxBuilder, Sandbox and Volume contracts implemented by every backend
// ABOUTME: The task runner depends only on these traits, never on a concrete backend

use crate::error::{EngineError, Result};
use crate::result::ResultSet;
use async_trait::async_trait;
use hatch_runtime::{PayloadSchema, Resolver, TaskContext};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

pub mod docker;
pub mod mock;

pub use docker::{DockerEngine, DockerEngineConfig, DockerImage, DockerVolume};
pub use mock::{MockEngine, MockEngineConfig, MockImage, MockVolume};

/// What an engine receives when asked for a new sandbox builder.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub context: TaskContext,
    /// The task payload filtered down to the engine's own properties.
    pub payload: Value,
}

/// An isolation backend (containers, virtual machines, ...).
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Payload properties this engine reads.
    fn payload_schema(&self) -> PayloadSchema;

    /// Admit a new sandbox and start resolving its resources.
    ///
    /// Fails immediately with `MaxConcurrencyExceeded` when every slot is
    /// taken; the slot is returned when the builder is discarded, fails to
    /// start, or its sandbox is dropped.
    fn new_sandbox_builder(&self, options: SandboxOptions) -> Result<Box<dyn SandboxBuilder>>;

    /// Create an empty folder that can be attached to sandboxes of this engine.
    async fn new_cache_folder(&self) -> Result<Arc<dyn Volume>>;

    /// `(running, max)` sandboxes.
    fn capacity(&self) -> (usize, usize);

    async fn dispose(&self) -> Result<()>;
}

/// Single-use accumulator of sandbox configuration.
///
/// All configuration calls are safe to make concurrently and while the
/// engine is still resolving resources in the background.
#[async_trait]
pub trait SandboxBuilder: Send + Sync {
    fn set_environment_variable(&self, name: &str, value: &str) -> Result<()>;

    fn attach_proxy(&self, hostname: &str, handler: Arc<dyn ProxyHandler>) -> Result<()>;

    /// Mount `volume` at `mount_point`.
    ///
    /// # Panics
    ///
    /// Panics if `volume` was not created by this builder's engine.
    fn attach_volume(&self, mount_point: &str, volume: Arc<dyn Volume>, read_only: bool)
        -> Result<()>;

    /// Wait for background resolution and turn the builder into a running
    /// sandbox. The builder is consumed whether or not this succeeds.
    async fn start_sandbox(&self) -> Result<Arc<dyn Sandbox>>;

    /// Give up the builder and release what it holds. Never blocks and is
    /// idempotent.
    fn discard(&self) -> Result<()>;
}

/// A running isolated execution unit.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Wait for termination. An external kill yields a failed result; a
    /// host abort yields `SandboxAborted`.
    async fn wait_for_result(&self) -> Result<ResultSet>;

    /// Terminate the sandbox and report failure.
    async fn kill(&self) -> Result<()>;

    /// Terminate the sandbox without producing a result.
    async fn abort(&self) -> Result<()>;
}

/// A folder created by an engine that survives across sandboxes.
pub trait Volume: Send + Sync + 'static {
    /// Stable backend name, used as the mount source.
    fn name(&self) -> &str;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Serves requests a sandbox makes to an attached proxy hostname.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn handle(&self, request: ProxyRequest) -> ProxyResponse;
}

/// How a sandbox ended; the first of completion, kill or abort wins.
#[derive(Debug, Clone)]
pub(crate) enum SandboxOutcome {
    Finished(ResultSet),
    Aborted,
}

pub(crate) async fn wait_outcome(outcome: &Resolver<SandboxOutcome>) -> Result<ResultSet> {
    match outcome.wait().await {
        SandboxOutcome::Finished(result) => Ok(result),
        SandboxOutcome::Aborted => Err(EngineError::SandboxAborted),
    }
}

/// Recover the backend's own volume type.
///
/// # Panics
///
/// Panics when handed a volume created by another engine; continuing with
/// a foreign volume would leave the sandbox in an inconsistent state.
pub(crate) fn downcast_volume<V: Send + Sync + 'static>(volume: Arc<dyn Volume>, engine: &str) -> Arc<V> {
    let name = volume.name().to_string();
    match volume.into_any().downcast::<V>() {
        Ok(volume) => volume,
        Err(_) => panic!(
            "{} engine was passed volume '{}' of type other than {}",
            engine,
            name,
            std::any::type_name::<V>()
        ),
    }
}
