// ABOUTME: In-process mock engine running scripted functions instead of real workloads
// ABOUTME: Exercises the full builder/sandbox lifecycle without Docker, with controllable image fetches

use super::{
    downcast_volume, wait_outcome, Engine, ProxyHandler, ProxyRequest, Sandbox, SandboxBuilder,
    SandboxOptions, SandboxOutcome, Volume,
};
use crate::admission::{Admission, AdmissionGuard};
use crate::builder::{BuilderCore, StartedBuilder};
use crate::error::{EngineError, Result};
use crate::result::{ArtifactSource, ResultSet};
use async_trait::async_trait;
use hatch_runtime::{
    Fetcher, MalformedPayloadError, PayloadSchema, ResourceCache, ResourceError, ResourceHandle,
    Resolver, TaskContext,
};
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// File written by `set-volume` and looked for by `get-volume`.
const VOLUME_MARKER: &str = "hatch-marker";

/// Images whose name starts with this prefix fail to resolve.
const BROKEN_IMAGE_PREFIX: &str = "broken/";

#[derive(Debug, Clone)]
pub struct MockEngineConfig {
    pub max_concurrency: usize,
    /// Simulated image download time.
    pub image_fetch_delay: Duration,
}

impl Default for MockEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            image_fetch_delay: Duration::from_millis(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockImage {
    pub name: String,
}

struct MockImageFetcher {
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl Fetcher<MockImage> for MockImageFetcher {
    async fn fetch(&self, key: &str) -> std::result::Result<MockImage, ResourceError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if key.starts_with(BROKEN_IMAGE_PREFIX) {
            return Err(ResourceError::Fetch {
                key: key.to_string(),
                reason: "image does not exist".to_string(),
            });
        }
        Ok(MockImage {
            name: key.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum MockFunction {
    True,
    False,
    GetEnv,
    SetVolume,
    GetVolume,
    PingProxy,
    WriteArtifact,
}

#[derive(Debug, Clone, Deserialize)]
struct MockPayload {
    image: String,
    function: MockFunction,
    #[serde(default)]
    argument: String,
    /// Milliseconds to sleep before running the function.
    #[serde(default)]
    delay: u64,
}

/// Folder that lives in memory.
#[derive(Debug)]
pub struct MockVolume {
    name: String,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockVolume {
    fn files(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_file(&self, name: &str, data: &[u8]) {
        self.files().insert(name.to_string(), data.to_vec());
    }

    pub fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        self.files().get(name).cloned()
    }
}

impl Volume for MockVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Engine whose sandboxes run one of a handful of scripted functions.
pub struct MockEngine {
    admission: Admission,
    images: ResourceCache<MockImage>,
}

impl MockEngine {
    pub fn new(config: MockEngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine whose image fetches each wait for one permit of `gate`.
    pub fn with_fetch_gate(config: MockEngineConfig, gate: Arc<Semaphore>) -> Self {
        Self::build(config, Some(gate))
    }

    fn build(config: MockEngineConfig, gate: Option<Arc<Semaphore>>) -> Self {
        let fetcher = MockImageFetcher {
            delay: config.image_fetch_delay,
            gate,
        };
        Self {
            admission: Admission::new(config.max_concurrency),
            images: ResourceCache::new(Arc::new(fetcher) as Arc<dyn Fetcher<MockImage>>),
        }
    }

    pub fn images(&self) -> &ResourceCache<MockImage> {
        &self.images
    }

    pub fn running(&self) -> usize {
        self.admission.running()
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn payload_schema(&self) -> PayloadSchema {
        PayloadSchema::new()
            .property("image", json!({"type": "string", "minLength": 1}), true)
            .property(
                "function",
                json!({
                    "type": "string",
                    "enum": [
                        "true", "false", "get-env", "set-volume",
                        "get-volume", "ping-proxy", "write-artifact"
                    ]
                }),
                true,
            )
            .property("argument", json!({"type": "string"}), false)
            .property("delay", json!({"type": "integer", "minimum": 0}), false)
    }

    fn new_sandbox_builder(&self, options: SandboxOptions) -> Result<Box<dyn SandboxBuilder>> {
        let payload: MockPayload = serde_json::from_value(options.payload).map_err(|e| {
            MalformedPayloadError::new(format!("mock engine payload: {}", e))
        })?;
        let admission = self.admission.try_admit()?;
        debug!(
            "Mock sandbox builder for {} admitted ({}/{})",
            options.context.info(),
            self.admission.running(),
            self.admission.max()
        );

        Ok(Box::new(MockSandboxBuilder {
            core: BuilderCore::spawn(self.images.clone(), payload.image.clone(), admission),
            payload,
            context: options.context,
            volumes: Mutex::new(HashMap::new()),
        }))
    }

    async fn new_cache_folder(&self) -> Result<Arc<dyn Volume>> {
        Ok(Arc::new(MockVolume {
            name: format!("mock-volume-{}", uuid::Uuid::new_v4()),
            files: Mutex::new(BTreeMap::new()),
        }))
    }

    fn capacity(&self) -> (usize, usize) {
        (self.admission.running(), self.admission.max())
    }

    async fn dispose(&self) -> Result<()> {
        self.images.purge_idle().await;
        Ok(())
    }
}

struct MockSandboxBuilder {
    core: BuilderCore<MockImage>,
    payload: MockPayload,
    context: TaskContext,
    /// Attached volumes by name, resolved against the mounts at start.
    volumes: Mutex<HashMap<String, Arc<MockVolume>>>,
}

#[async_trait]
impl SandboxBuilder for MockSandboxBuilder {
    fn set_environment_variable(&self, name: &str, value: &str) -> Result<()> {
        self.core.set_environment_variable(name, value)
    }

    fn attach_proxy(&self, hostname: &str, handler: Arc<dyn ProxyHandler>) -> Result<()> {
        self.core.attach_proxy(hostname, handler)
    }

    fn attach_volume(
        &self,
        mount_point: &str,
        volume: Arc<dyn Volume>,
        read_only: bool,
    ) -> Result<()> {
        let volume = downcast_volume::<MockVolume>(volume, "mock");
        let name = volume.name.clone();
        // Registered first so a concurrent start never sees the mount without its volume.
        let previous = self
            .volumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), volume);
        if let Err(e) = self.core.attach_volume(mount_point, &name, read_only) {
            if previous.is_none() {
                self.volumes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&name);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn start_sandbox(&self) -> Result<Arc<dyn Sandbox>> {
        let started = self.core.start().await?;
        let volumes = std::mem::take(&mut *self.volumes.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(Arc::new(MockSandbox::start(
            started,
            self.payload.clone(),
            self.context.clone(),
            volumes,
        )))
    }

    fn discard(&self) -> Result<()> {
        self.core.discard();
        Ok(())
    }
}

impl Drop for MockSandboxBuilder {
    fn drop(&mut self) {
        self.core.discard();
    }
}

#[derive(Default)]
struct MockArtifacts {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockArtifacts {
    fn files(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArtifactSource for MockArtifacts {
    async fn extract(&self, path: &str) -> Result<Vec<u8>> {
        let matches: Vec<(String, Vec<u8>)> = {
            let files = self.files();
            if path.ends_with('/') {
                files
                    .iter()
                    .filter_map(|(name, data)| {
                        name.strip_prefix(path).map(|rel| (rel.to_string(), data.clone()))
                    })
                    .collect()
            } else {
                files
                    .get(path)
                    .map(|data| {
                        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
                        vec![(file_name, data.clone())]
                    })
                    .unwrap_or_default()
            }
        };
        if matches.is_empty() {
            return Err(EngineError::ArtifactNotFound(path.to_string()));
        }

        let mut archive = tar::Builder::new(Vec::new());
        for (name, data) in matches {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            archive.append_data(&mut header, name, data.as_slice())?;
        }
        Ok(archive.into_inner()?)
    }
}

struct MockSandbox {
    outcome: Resolver<SandboxOutcome>,
    artifacts: Arc<MockArtifacts>,
    run: JoinHandle<()>,
    // Held until the sandbox is disposed.
    _image: ResourceHandle<MockImage>,
    _admission: AdmissionGuard,
}

impl MockSandbox {
    fn start(
        started: StartedBuilder<MockImage>,
        payload: MockPayload,
        context: TaskContext,
        volumes: HashMap<String, Arc<MockVolume>>,
    ) -> Self {
        let StartedBuilder {
            resource,
            config,
            admission,
        } = started;
        let outcome = Resolver::new();
        let artifacts = Arc::new(MockArtifacts::default());

        info!(
            "Starting mock sandbox for {} on image {}",
            context.info(),
            resource.name
        );

        let mounts: Vec<(String, bool, Arc<MockVolume>)> = config
            .mounts
            .iter()
            .filter_map(|m| {
                volumes
                    .get(&m.source)
                    .map(|v| (m.mount_point.clone(), m.read_only, Arc::clone(v)))
            })
            .collect();

        let run = {
            let outcome = outcome.clone();
            let artifacts = Arc::clone(&artifacts);
            tokio::spawn(async move {
                if payload.delay > 0 {
                    tokio::time::sleep(Duration::from_millis(payload.delay)).await;
                }
                let argument = payload.argument.as_str();
                let success = match payload.function {
                    MockFunction::True => true,
                    MockFunction::False => false,
                    MockFunction::GetEnv => match config.env.get(argument) {
                        Some(value) => {
                            context.log(format!("{}={}", argument, value));
                            true
                        }
                        None => {
                            context.log(format!("{} is not set", argument));
                            false
                        }
                    },
                    MockFunction::SetVolume => {
                        match mounts.iter().find(|(point, _, _)| point == argument) {
                            Some((_, false, volume)) => {
                                volume.write_file(VOLUME_MARKER, b"set");
                                true
                            }
                            Some((_, true, _)) => {
                                context.log(format!("{} is mounted read-only", argument));
                                false
                            }
                            None => false,
                        }
                    }
                    MockFunction::GetVolume => mounts
                        .iter()
                        .find(|(point, _, _)| point == argument)
                        .is_some_and(|(_, _, volume)| volume.read_file(VOLUME_MARKER).is_some()),
                    MockFunction::PingProxy => match config.proxies.get(argument) {
                        Some(handler) => {
                            let response = handler
                                .handle(ProxyRequest {
                                    method: "GET".to_string(),
                                    path: "/".to_string(),
                                    body: Vec::new(),
                                })
                                .await;
                            context.write_log(&response.body);
                            response.status == 200
                        }
                        None => {
                            context.log(format!("no proxy named {}", argument));
                            false
                        }
                    },
                    MockFunction::WriteArtifact => {
                        artifacts.files().insert(
                            argument.to_string(),
                            format!("artifact from {}", context.info()).into_bytes(),
                        );
                        true
                    }
                };

                let exit_code = if success { 0 } else { 1 };
                outcome.resolve(SandboxOutcome::Finished(ResultSet::new(
                    success,
                    Some(exit_code),
                    artifacts,
                )));
            })
        };

        Self {
            outcome,
            artifacts,
            run,
            _image: resource,
            _admission: admission,
        }
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn wait_for_result(&self) -> Result<ResultSet> {
        wait_outcome(&self.outcome).await
    }

    async fn kill(&self) -> Result<()> {
        self.run.abort();
        self.outcome.resolve(SandboxOutcome::Finished(ResultSet::killed(
            Arc::clone(&self.artifacts) as Arc<dyn ArtifactSource>,
        )));
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.run.abort();
        self.outcome.resolve(SandboxOutcome::Aborted);
        Ok(())
    }
}

impl Drop for MockSandbox {
    fn drop(&mut self) {
        self.run.abort();
    }
}
