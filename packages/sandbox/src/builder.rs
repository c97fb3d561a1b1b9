// ABOUTME: Backend-independent sandbox builder state: configuration plus background resource resolution
// ABOUTME: Guarantees the resolved resource is either handed to one sandbox or released, exactly once

use crate::admission::AdmissionGuard;
use crate::engines::ProxyHandler;
use crate::error::{EngineError, Result};
use crate::validation::{
    mount_points_overlap, validate_env_name, validate_mount_point, validate_proxy_name,
};
use hatch_runtime::{ResourceCache, ResourceError, ResourceHandle};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

/// A volume attached at a folder inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Absolute folder path, always ending in `/`.
    pub mount_point: String,
    /// Backend name of the attached volume.
    pub source: String,
    pub read_only: bool,
}

impl Mount {
    /// Mount point without its trailing slash, as container runtimes expect.
    pub fn target(&self) -> &str {
        self.mount_point.trim_end_matches('/')
    }
}

/// Configuration accumulated by plugins before the sandbox starts.
#[derive(Default, Clone)]
pub struct SandboxConfig {
    pub env: BTreeMap<String, String>,
    pub proxies: BTreeMap<String, Arc<dyn ProxyHandler>>,
    pub mounts: Vec<Mount>,
}

impl fmt::Debug for SandboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxConfig")
            .field("env", &self.env)
            .field("proxies", &self.proxies.keys().collect::<Vec<_>>())
            .field("mounts", &self.mounts)
            .finish()
    }
}

/// Where the background resolution stands. One lock guards the whole
/// state so handing the handle over and releasing it are single
/// transitions.
enum Resolution<R> {
    Pending,
    Ready(ResourceHandle<R>),
    Failed(ResourceError),
    /// Discarded by the caller, or consumed by a start attempt.
    Discarded,
}

struct BuilderState<R> {
    resolution: Resolution<R>,
    config: SandboxConfig,
    admission: Option<AdmissionGuard>,
}

struct Shared<R> {
    state: Mutex<BuilderState<R>>,
    /// Wakes a `start` still waiting on resolution.
    discarded: watch::Sender<bool>,
}

impl<R> Shared<R> {
    fn state(&self) -> MutexGuard<'_, BuilderState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a backend needs to turn a builder into a running sandbox.
pub struct StartedBuilder<R> {
    pub resource: ResourceHandle<R>,
    pub config: SandboxConfig,
    pub admission: AdmissionGuard,
}

/// Shared builder machinery used by every engine's `SandboxBuilder`.
///
/// Construction immediately starts resolving `key` against the resource
/// cache on a background task. Configuration calls, `start` and `discard`
/// may run concurrently with that resolution and with each other.
pub struct BuilderCore<R> {
    shared: Arc<Shared<R>>,
    resolved: watch::Receiver<bool>,
    key: String,
}

impl<R: Send + Sync + 'static> BuilderCore<R> {
    /// Start resolving `key` in the background. Must be called within a
    /// tokio runtime.
    pub fn spawn(cache: ResourceCache<R>, key: impl Into<String>, admission: AdmissionGuard) -> Self {
        let key = key.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(BuilderState {
                resolution: Resolution::Pending,
                config: SandboxConfig::default(),
                admission: Some(admission),
            }),
            discarded: watch::channel(false).0,
        });
        let (done_tx, done_rx) = watch::channel(false);

        let task_shared = Arc::clone(&shared);
        let task_key = key.clone();
        tokio::spawn(async move {
            let outcome = cache.require(&task_key).await;

            // Anything left over is released after the lock is dropped.
            let unclaimed = {
                let mut state = task_shared.state();
                if matches!(state.resolution, Resolution::Pending) {
                    state.resolution = match outcome {
                        Ok(handle) => Resolution::Ready(handle),
                        Err(e) => Resolution::Failed(e),
                    };
                    None
                } else {
                    outcome.ok()
                }
            };
            if let Some(handle) = unclaimed {
                debug!("Releasing {} resolved for a discarded builder", handle.key());
                handle.release();
            }

            let _ = done_tx.send(true);
        });

        Self {
            shared,
            resolved: done_rx,
            key,
        }
    }

    /// Key of the resource being resolved.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self.shared.state().resolution, Resolution::Discarded)
    }

    fn configure<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut SandboxConfig) -> Result<()>,
    {
        let mut state = self.shared.state();
        if matches!(state.resolution, Resolution::Discarded) {
            return Err(EngineError::SandboxBuilderDiscarded);
        }
        apply(&mut state.config)
    }

    pub fn set_environment_variable(&self, name: &str, value: &str) -> Result<()> {
        validate_env_name(name)?;
        self.configure(|config| {
            if config.env.contains_key(name) {
                return Err(EngineError::NamingConflict(format!(
                    "environment variable '{}' is already set",
                    name
                )));
            }
            config.env.insert(name.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn attach_proxy(&self, hostname: &str, handler: Arc<dyn ProxyHandler>) -> Result<()> {
        validate_proxy_name(hostname)?;
        self.configure(|config| {
            if config.proxies.contains_key(hostname) {
                return Err(EngineError::NamingConflict(format!(
                    "proxy '{}' is already attached",
                    hostname
                )));
            }
            config.proxies.insert(hostname.to_string(), handler);
            Ok(())
        })
    }

    /// Record a mount of the volume named `source`. Overlapping mount
    /// points are rejected whichever was attached first.
    pub fn attach_volume(&self, mount_point: &str, source: &str, read_only: bool) -> Result<()> {
        validate_mount_point(mount_point)?;
        self.configure(|config| {
            if let Some(existing) = config
                .mounts
                .iter()
                .find(|m| mount_points_overlap(&m.mount_point, mount_point))
            {
                return Err(EngineError::NamingConflict(format!(
                    "mount-point '{}' overlaps '{}'",
                    mount_point, existing.mount_point
                )));
            }
            config.mounts.push(Mount {
                mount_point: mount_point.to_string(),
                source: source.to_string(),
                read_only,
            });
            Ok(())
        })
    }

    /// Wait for resolution, then consume the builder.
    ///
    /// Fails with `SandboxBuilderDiscarded` if the builder was discarded
    /// or already consumed, and with the resolution error if the resource
    /// could not be obtained. On success the resource handle, the
    /// configuration and the admission slot move to the caller.
    pub async fn start(&self) -> Result<StartedBuilder<R>> {
        if self.is_discarded() {
            return Err(EngineError::SandboxBuilderDiscarded);
        }

        let mut resolved = self.resolved.clone();
        let mut discarded = self.shared.discarded.subscribe();
        tokio::select! {
            signalled = async { resolved.wait_for(|done| *done).await.map(|_| ()) } => {
                if signalled.is_err() {
                    warn!("Resolution task for {} ended without signalling", self.key);
                }
            }
            _ = async { discarded.wait_for(|gone| *gone).await.map(|_| ()) } => {
                debug!("Builder for {} discarded while waiting on resolution", self.key);
            }
        }

        let mut state = self.shared.state();
        match std::mem::replace(&mut state.resolution, Resolution::Discarded) {
            Resolution::Discarded => Err(EngineError::SandboxBuilderDiscarded),
            Resolution::Failed(e) => {
                state.admission.take();
                Err(EngineError::Resource(e))
            }
            Resolution::Pending => {
                state.admission.take();
                Err(EngineError::Resource(ResourceError::Abandoned {
                    key: self.key.clone(),
                }))
            }
            Resolution::Ready(resource) => {
                let admission = state.admission.take().ok_or_else(|| {
                    EngineError::Internal("builder lost its admission slot".to_string())
                })?;
                Ok(StartedBuilder {
                    resource,
                    config: std::mem::take(&mut state.config),
                    admission,
                })
            }
        }
    }

    /// Give up the builder. Never blocks and may be called any number of
    /// times. A resource still being resolved is released by the
    /// resolution task when it completes.
    pub fn discard(&self) {
        let (previous, admission) = {
            let mut state = self.shared.state();
            let previous = std::mem::replace(&mut state.resolution, Resolution::Discarded);
            state.config = SandboxConfig::default();
            (previous, state.admission.take())
        };
        self.shared.discarded.send_replace(true);
        if let Resolution::Ready(handle) = previous {
            debug!("Discarding builder, releasing {}", handle.key());
            handle.release();
        }
        drop(admission);
    }
}

impl<R> fmt::Debug for BuilderCore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderCore").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use async_trait::async_trait;
    use hatch_runtime::Fetcher;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Fetcher that blocks until the test hands out a permit.
    struct GatedFetcher {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Fetcher<String> for GatedFetcher {
        async fn fetch(&self, key: &str) -> std::result::Result<String, ResourceError> {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            if key == "broken" {
                return Err(ResourceError::Fetch {
                    key: key.to_string(),
                    reason: "no such image".to_string(),
                });
            }
            Ok(key.to_uppercase())
        }
    }

    fn setup(open: bool) -> (ResourceCache<String>, Arc<Semaphore>, Admission) {
        let gate = Arc::new(Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }));
        let cache = ResourceCache::new(Arc::new(GatedFetcher {
            gate: Arc::clone(&gate),
        }) as Arc<dyn Fetcher<String>>);
        (cache, gate, Admission::new(4))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_start_transfers_resource_and_config() {
        let (cache, _gate, admission) = setup(true);
        let builder = BuilderCore::spawn(cache.clone(), "alpine", admission.try_admit().unwrap());

        builder.set_environment_variable("A", "1").unwrap();
        builder.attach_volume("/cache/", "vol-1", true).unwrap();

        let started = builder.start().await.unwrap();
        assert_eq!(*started.resource, "ALPINE");
        assert_eq!(started.config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(started.config.mounts[0].target(), "/cache");
        assert_eq!(cache.references("alpine"), 1);
        assert_eq!(admission.running(), 1);

        // Consumed: nothing is left for a discard to release.
        builder.discard();
        assert_eq!(cache.references("alpine"), 1);

        drop(started);
        assert_eq!(cache.references("alpine"), 0);
        assert_eq!(admission.running(), 0);
    }

    #[tokio::test]
    async fn test_env_conflict_keeps_first_value() {
        let (cache, _gate, admission) = setup(true);
        let builder = BuilderCore::spawn(cache, "alpine", admission.try_admit().unwrap());

        builder.set_environment_variable("X", "1").unwrap();
        let err = builder.set_environment_variable("X", "2").unwrap_err();
        assert!(matches!(err, EngineError::NamingConflict(_)));

        let started = builder.start().await.unwrap();
        assert_eq!(started.config.env.get("X").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_invalid_names_are_malformed() {
        let (cache, _gate, admission) = setup(true);
        let builder = BuilderCore::spawn(cache, "alpine", admission.try_admit().unwrap());

        assert!(matches!(
            builder.set_environment_variable("A=B", "1"),
            Err(EngineError::MalformedPayload(_))
        ));
        assert!(matches!(
            builder.attach_volume("relative/", "v", false),
            Err(EngineError::MalformedPayload(_))
        ));
        assert!(matches!(
            builder.attach_volume("/a", "v", false),
            Err(EngineError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_mounts_conflict_in_either_order() {
        let (cache, _gate, admission) = setup(true);
        let builder = BuilderCore::spawn(cache, "alpine", admission.try_admit().unwrap());

        builder.attach_volume("/data/", "v1", false).unwrap();
        assert!(matches!(
            builder.attach_volume("/data/sub/", "v2", false),
            Err(EngineError::NamingConflict(_))
        ));
        builder.attach_volume("/other/sub/", "v3", false).unwrap();
        assert!(matches!(
            builder.attach_volume("/other/", "v4", false),
            Err(EngineError::NamingConflict(_))
        ));
        assert!(matches!(
            builder.attach_volume("/data/", "v5", false),
            Err(EngineError::NamingConflict(_))
        ));
        builder.attach_volume("/b/", "v6", false).unwrap();

        let started = builder.start().await.unwrap();
        let points: Vec<_> = started
            .config
            .mounts
            .iter()
            .map(|m| m.mount_point.as_str())
            .collect();
        assert_eq!(points, vec!["/data/", "/other/sub/", "/b/"]);
    }

    #[tokio::test]
    async fn test_discard_before_resolution_releases_when_resolved() {
        let (cache, gate, admission) = setup(false);
        let builder = BuilderCore::spawn(cache.clone(), "alpine", admission.try_admit().unwrap());
        settle().await;

        // Returns immediately although the fetch is still blocked.
        builder.discard();
        assert_eq!(admission.running(), 0);
        assert_eq!(cache.references("alpine"), 1);

        gate.add_permits(1);
        settle().await;

        assert_eq!(cache.references("alpine"), 0);
        let stats = cache.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert!(matches!(
            builder.start().await,
            Err(EngineError::SandboxBuilderDiscarded)
        ));
    }

    #[tokio::test]
    async fn test_start_after_discard_fails() {
        let (cache, _gate, admission) = setup(true);
        let builder = BuilderCore::spawn(cache.clone(), "alpine", admission.try_admit().unwrap());
        settle().await;

        builder.discard();
        assert_eq!(cache.references("alpine"), 0);
        assert!(matches!(
            builder.start().await,
            Err(EngineError::SandboxBuilderDiscarded)
        ));
        assert!(matches!(
            builder.set_environment_variable("A", "1"),
            Err(EngineError::SandboxBuilderDiscarded)
        ));
    }

    #[tokio::test]
    async fn test_discard_while_start_is_waiting() {
        let (cache, gate, admission) = setup(false);
        let builder = Arc::new(BuilderCore::spawn(
            cache.clone(),
            "alpine",
            admission.try_admit().unwrap(),
        ));

        let starter = {
            let builder = Arc::clone(&builder);
            tokio::spawn(async move { builder.start().await.map(|_| ()) })
        };
        settle().await;
        builder.discard();
        gate.add_permits(1);

        assert!(matches!(
            starter.await.unwrap(),
            Err(EngineError::SandboxBuilderDiscarded)
        ));
        settle().await;
        assert_eq!(cache.references("alpine"), 0);
        assert_eq!(cache.stats().released, 1);
    }

    #[tokio::test]
    async fn test_discard_wakes_start_before_resolution_completes() {
        let (cache, gate, admission) = setup(false);
        let builder = Arc::new(BuilderCore::spawn(
            cache.clone(),
            "alpine",
            admission.try_admit().unwrap(),
        ));

        let starter = {
            let builder = Arc::clone(&builder);
            tokio::spawn(async move { builder.start().await.map(|_| ()) })
        };
        settle().await;
        builder.discard();
        assert_eq!(admission.running(), 0);

        // The fetch is still held at the gate.
        let started = tokio::time::timeout(Duration::from_secs(1), starter)
            .await
            .expect("start must not wait for a discarded builder")
            .unwrap();
        assert!(matches!(started, Err(EngineError::SandboxBuilderDiscarded)));

        gate.add_permits(1);
        settle().await;
        assert_eq!(cache.references("alpine"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_discards_release_once() {
        let (cache, _gate, admission) = setup(true);
        let builder = Arc::new(BuilderCore::spawn(
            cache.clone(),
            "alpine",
            admission.try_admit().unwrap(),
        ));
        settle().await;
        assert_eq!(cache.references("alpine"), 1);

        let discards: Vec<_> = (0..32)
            .map(|_| {
                let builder = Arc::clone(&builder);
                tokio::spawn(async move { builder.discard() })
            })
            .collect();
        for discard in discards {
            discard.await.unwrap();
        }

        assert_eq!(cache.references("alpine"), 0);
        assert_eq!(cache.stats().released, 1);
        assert_eq!(admission.running(), 0);
    }

    #[tokio::test]
    async fn test_resolution_error_is_returned_by_start() {
        let (cache, _gate, admission) = setup(true);
        let builder = BuilderCore::spawn(cache.clone(), "broken", admission.try_admit().unwrap());

        let err = builder.start().await.err().expect("start should fail");
        assert!(matches!(err, EngineError::Resource(ResourceError::Fetch { .. })));
        assert_eq!(cache.references("broken"), 0);
        assert_eq!(admission.running(), 0);

        // Consumed by the failed start.
        assert!(matches!(
            builder.start().await,
            Err(EngineError::SandboxBuilderDiscarded)
        ));
    }

    #[tokio::test]
    async fn test_configuration_while_resolution_pending() {
        let (cache, gate, admission) = setup(false);
        let builder = Arc::new(BuilderCore::spawn(
            cache,
            "alpine",
            admission.try_admit().unwrap(),
        ));

        let setters: Vec<_> = (0..8)
            .map(|i| {
                let builder = Arc::clone(&builder);
                tokio::spawn(async move {
                    builder.set_environment_variable(&format!("VAR_{}", i), "x")
                })
            })
            .collect();
        for setter in setters {
            setter.await.unwrap().unwrap();
        }

        gate.add_permits(1);
        let started = builder.start().await.unwrap();
        assert_eq!(started.config.env.len(), 8);
    }
}
