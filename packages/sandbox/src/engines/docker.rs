// ABOUTME: Docker engine running each sandbox as a container through the bollard client
// ABOUTME: Images are shared through the resource cache and containers are removed once nothing references them

use super::{
    downcast_volume, wait_outcome, Engine, ProxyHandler, Sandbox, SandboxBuilder, SandboxOptions,
    SandboxOutcome, Volume,
};
use crate::admission::{Admission, AdmissionGuard};
use crate::builder::{BuilderCore, Mount, SandboxConfig, StartedBuilder};
use crate::error::{EngineError, Result};
use crate::result::{ArtifactSource, ResultSet};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, DownloadFromContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    image::{CreateImageOptions, RemoveImageOptions},
    models::{HostConfig, Mount as ContainerMount, MountTypeEnum},
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
    Docker, API_DEFAULT_VERSION,
};
use futures::StreamExt;
use hatch_runtime::{
    Fetcher, MalformedPayloadError, PayloadSchema, ResourceCache, ResourceError, ResourceHandle,
    Resolver, TaskContext,
};
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Seconds before a request to the Docker daemon times out.
const CLIENT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct DockerEngineConfig {
    /// Unix socket path (`/var/run/docker.sock` or `unix://...`) or a
    /// `tcp://`/`http://` address; `DOCKER_HOST` or the platform default
    /// when unset.
    pub endpoint: Option<String>,
    pub max_concurrency: usize,
    pub pull_timeout: Duration,
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_concurrency: 1,
            pull_timeout: Duration::from_secs(600),
        }
    }
}

/// A locally available image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerImage {
    pub name: String,
    pub id: String,
    /// Pulled by this engine rather than found on the host.
    pub pulled: bool,
}

impl DockerImage {
    /// Only images the engine pulled itself are removed on eviction.
    pub fn removable(&self) -> bool {
        self.pulled
    }
}

struct ImageFetcher {
    client: Docker,
    pull_timeout: Duration,
}

impl ImageFetcher {
    async fn inspect(&self, image: &str) -> std::result::Result<Option<String>, ResourceError> {
        match self.client.inspect_image(image).await {
            Ok(inspect) => Ok(Some(inspect.id.unwrap_or_else(|| image.to_string()))),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(ResourceError::Fetch {
                key: image.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn pull(&self, image: &str) -> std::result::Result<(), ResourceError> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();
            while let Some(item) = stream.next().await {
                let info = item.map_err(|e| e.to_string())?;
                if let Some(error) = info.error {
                    return Err(error);
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status for {}: {}", image, status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(reason)) => Err(ResourceError::Fetch {
                key: image.to_string(),
                reason,
            }),
            Err(_) => Err(ResourceError::Timeout {
                key: image.to_string(),
                seconds: self.pull_timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl Fetcher<DockerImage> for ImageFetcher {
    async fn fetch(&self, key: &str) -> std::result::Result<DockerImage, ResourceError> {
        if let Some(id) = self.inspect(key).await? {
            debug!("Image {} already present on the host", key);
            return Ok(DockerImage {
                name: key.to_string(),
                id,
                pulled: false,
            });
        }
        self.pull(key).await?;
        let id = self.inspect(key).await?.ok_or_else(|| ResourceError::Fetch {
            key: key.to_string(),
            reason: "image missing after pull".to_string(),
        })?;
        Ok(DockerImage {
            name: key.to_string(),
            id,
            pulled: true,
        })
    }

    async fn dispose(&self, key: &str, image: Arc<DockerImage>) {
        if !image.removable() {
            debug!("Keeping host image {} ({})", key, image.id);
            return;
        }
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        match self.client.remove_image(&image.id, Some(options), None).await {
            Ok(_) => debug!("Removed image {} ({})", key, image.id),
            Err(e) => warn!("Failed to remove image {}: {}", key, e),
        }
    }
}

/// Named Docker volume, removed when the last reference is dropped.
pub struct DockerVolume {
    name: String,
    client: Docker,
}

impl Volume for DockerVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for DockerVolume {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Leaking volume {}: no runtime to remove it on", self.name);
            return;
        };
        let client = self.client.clone();
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move {
            let options = RemoveVolumeOptions { force: true };
            if let Err(e) = client.remove_volume(&name, Some(options)).await {
                warn!("Failed to remove volume {}: {}", name, e);
            }
        });
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DockerPayload {
    image: String,
    command: Vec<String>,
}

/// Engine running sandboxes as Docker containers.
pub struct DockerEngine {
    client: Docker,
    admission: Admission,
    images: ResourceCache<DockerImage>,
}

impl DockerEngine {
    /// Connect to the daemon named by `config.endpoint`.
    pub fn connect(config: DockerEngineConfig) -> Result<Self> {
        let client = match config.endpoint.as_deref() {
            None => Docker::connect_with_defaults()?,
            Some(endpoint) if endpoint.starts_with("unix://") || endpoint.starts_with('/') => {
                Docker::connect_with_unix(endpoint, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(endpoint) => {
                Docker::connect_with_http(endpoint, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
        };
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Docker, config: DockerEngineConfig) -> Self {
        let fetcher = ImageFetcher {
            client: client.clone(),
            pull_timeout: config.pull_timeout,
        };
        Self {
            client,
            admission: Admission::new(config.max_concurrency),
            images: ResourceCache::new(Arc::new(fetcher) as Arc<dyn Fetcher<DockerImage>>),
        }
    }

    pub fn images(&self) -> &ResourceCache<DockerImage> {
        &self.images
    }
}

#[async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn payload_schema(&self) -> PayloadSchema {
        PayloadSchema::new()
            .property("image", json!({"type": "string", "minLength": 1}), true)
            .property(
                "command",
                json!({"type": "array", "items": {"type": "string"}}),
                true,
            )
    }

    fn new_sandbox_builder(&self, options: SandboxOptions) -> Result<Box<dyn SandboxBuilder>> {
        let payload: DockerPayload = serde_json::from_value(options.payload).map_err(|e| {
            MalformedPayloadError::new(format!("docker engine payload: {}", e))
        })?;
        let admission = self.admission.try_admit()?;

        Ok(Box::new(DockerSandboxBuilder {
            core: BuilderCore::spawn(self.images.clone(), payload.image.clone(), admission),
            client: self.client.clone(),
            payload,
            context: options.context,
        }))
    }

    async fn new_cache_folder(&self) -> Result<Arc<dyn Volume>> {
        let name = format!("hatch-cache-{}", uuid::Uuid::new_v4());
        let options = CreateVolumeOptions {
            name: name.clone(),
            ..Default::default()
        };
        self.client.create_volume(options).await?;
        debug!("Created volume {}", name);
        Ok(Arc::new(DockerVolume {
            name,
            client: self.client.clone(),
        }))
    }

    fn capacity(&self) -> (usize, usize) {
        (self.admission.running(), self.admission.max())
    }

    async fn dispose(&self) -> Result<()> {
        let purged = self.images.purge_idle().await;
        info!("Docker engine disposed, {} images released", purged.len());
        Ok(())
    }
}

struct DockerSandboxBuilder {
    core: BuilderCore<DockerImage>,
    client: Docker,
    payload: DockerPayload,
    context: TaskContext,
}

#[async_trait]
impl SandboxBuilder for DockerSandboxBuilder {
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
        let volume = downcast_volume::<DockerVolume>(volume, "docker");
        self.core.attach_volume(mount_point, &volume.name, read_only)
    }

    async fn start_sandbox(&self) -> Result<Arc<dyn Sandbox>> {
        let started = self.core.start().await?;
        let sandbox = DockerSandbox::start(
            self.client.clone(),
            started,
            self.payload.command.clone(),
            self.context.clone(),
        )
        .await?;
        Ok(Arc::new(sandbox))
    }

    fn discard(&self) -> Result<()> {
        self.core.discard();
        Ok(())
    }
}

impl Drop for DockerSandboxBuilder {
    fn drop(&mut self) {
        self.core.discard();
    }
}

/// Owns a created container and force-removes it when dropped.
struct ContainerGuard {
    client: Docker,
    id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Leaking container {}: no runtime to remove it on", self.id);
            return;
        };
        let client = self.client.clone();
        let id = std::mem::take(&mut self.id);
        runtime.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            match client.remove_container(&id, Some(options)).await {
                Ok(()) => debug!("Removed container {}", id),
                Err(e) => warn!("Failed to remove container {}: {}", id, e),
            }
        });
    }
}

struct DockerArtifacts {
    container: Arc<ContainerGuard>,
}

#[async_trait]
impl ArtifactSource for DockerArtifacts {
    async fn extract(&self, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self
            .container
            .client
            .download_from_container(&self.container.id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(EngineError::ArtifactNotFound(path.to_string())),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(data)
    }
}

fn container_mounts(mounts: &[Mount]) -> Vec<ContainerMount> {
    mounts
        .iter()
        .map(|m| ContainerMount {
            target: Some(m.target().to_string()),
            source: Some(m.source.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect()
}

fn container_config(image: &DockerImage, command: Vec<String>, config: &SandboxConfig) -> Config<String> {
    let env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let host_config = HostConfig {
        mounts: Some(container_mounts(&config.mounts)),
        cap_drop: Some(vec!["ALL".to_string()]),
        privileged: Some(false),
        ..Default::default()
    };

    Config {
        image: Some(image.id.clone()),
        cmd: Some(command),
        env: Some(env),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Follow container output into the task log until the container exits.
async fn stream_logs(client: Docker, id: String, context: TaskContext) {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        follow: true,
        ..Default::default()
    };
    let mut stream = Box::pin(client.logs(&id, Some(options)));
    while let Some(item) = stream.next().await {
        match item {
            Ok(LogOutput::StdOut { message })
            | Ok(LogOutput::StdErr { message })
            | Ok(LogOutput::Console { message }) => context.write_log(&message),
            Ok(_) => continue,
            Err(e) => {
                warn!("Log stream of container {} ended: {}", id, e);
                break;
            }
        }
    }
}

/// Exit code of the container, `None` if the daemon could not tell.
async fn wait_exit_code(client: &Docker, id: &str) -> Option<i64> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut stream = client.wait_container(id, Some(options));
    match stream.next().await {
        Some(Ok(response)) => Some(response.status_code),
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
        Some(Err(e)) => {
            error!("Waiting for container {} failed: {}", id, e);
            None
        }
        None => None,
    }
}

struct DockerSandbox {
    container: Arc<ContainerGuard>,
    outcome: Resolver<SandboxOutcome>,
    watcher: JoinHandle<()>,
    _image: ResourceHandle<DockerImage>,
    _admission: AdmissionGuard,
}

impl DockerSandbox {
    async fn start(
        client: Docker,
        started: StartedBuilder<DockerImage>,
        command: Vec<String>,
        context: TaskContext,
    ) -> Result<Self> {
        let StartedBuilder {
            resource,
            config,
            admission,
        } = started;

        for hostname in config.proxies.keys() {
            debug!(
                "Proxy {} recorded for {}; containers have no proxy transport",
                hostname,
                context.info()
            );
        }

        let created = client
            .create_container::<String, String>(None, container_config(&resource, command, &config))
            .await?;
        let container = Arc::new(ContainerGuard {
            client: client.clone(),
            id: created.id,
        });
        info!(
            "Created container {} for {} from {}",
            container.id,
            context.info(),
            resource.name
        );

        client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await?;

        let outcome = Resolver::new();
        let watcher = {
            let outcome = outcome.clone();
            let container = Arc::clone(&container);
            tokio::spawn(async move {
                let logs = tokio::spawn(stream_logs(
                    client.clone(),
                    container.id.clone(),
                    context.clone(),
                ));
                let exit_code = wait_exit_code(&client, &container.id).await;
                if let Err(e) = logs.await {
                    warn!("Log streaming task for {} failed: {}", container.id, e);
                }
                if exit_code.is_none() {
                    context.log("container exit code could not be determined");
                }

                let success = exit_code == Some(0);
                debug!("Container {} exited with {:?}", container.id, exit_code);
                outcome.resolve(SandboxOutcome::Finished(ResultSet::new(
                    success,
                    exit_code,
                    Arc::new(DockerArtifacts { container }),
                )));
            })
        };

        Ok(Self {
            container,
            outcome,
            watcher,
            _image: resource,
            _admission: admission,
        })
    }

    async fn kill_container(&self) {
        let options = KillContainerOptions { signal: "SIGKILL" };
        if let Err(e) = self
            .container
            .client
            .kill_container(&self.container.id, Some(options))
            .await
        {
            debug!("Kill of container {} failed: {}", self.container.id, e);
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn wait_for_result(&self) -> Result<ResultSet> {
        wait_outcome(&self.outcome).await
    }

    async fn kill(&self) -> Result<()> {
        let artifacts = Arc::new(DockerArtifacts {
            container: Arc::clone(&self.container),
        });
        if self.outcome.resolve(SandboxOutcome::Finished(ResultSet::killed(artifacts))) {
            info!("Killing container {}", self.container.id);
            self.watcher.abort();
            self.kill_container().await;
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        if self.outcome.resolve(SandboxOutcome::Aborted) {
            info!("Aborting container {}", self.container.id);
            self.watcher.abort();
            self.kill_container().await;
        }
        Ok(())
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
