// ABOUTME: Worker configuration read from HATCH_* environment variables
// ABOUTME: Validates ranges and plugin selection up front so the worker never starts half-configured

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_ENGINE: &str = "HATCH_ENGINE";
pub const ENV_MAX_CONCURRENCY: &str = "HATCH_MAX_CONCURRENCY";
pub const ENV_DOCKER_ENDPOINT: &str = "HATCH_DOCKER_ENDPOINT";
pub const ENV_IMAGE_PULL_TIMEOUT_SECS: &str = "HATCH_IMAGE_PULL_TIMEOUT_SECS";
pub const ENV_CAPACITY_RETRY_INTERVAL_MS: &str = "HATCH_CAPACITY_RETRY_INTERVAL_MS";
pub const ENV_CAPACITY_RETRY_LIMIT: &str = "HATCH_CAPACITY_RETRY_LIMIT";
pub const ENV_ARTIFACT_DIR: &str = "HATCH_ARTIFACT_DIR";
pub const ENV_TASK_LOG_DIR: &str = "HATCH_TASK_LOG_DIR";
pub const ENV_PLUGINS: &str = "HATCH_PLUGINS";

pub const MAX_CONCURRENCY_LIMIT: usize = 64;

/// Plugins the worker knows how to build.
pub const KNOWN_PLUGINS: [&str; 5] = ["env", "success", "cache", "artifacts", "tasklog"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number in {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
    #[error("Invalid engine: {0} (expected docker or mock)")]
    InvalidEngine(String),
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("Plugin {plugin} requires {variable} to be set")]
    MissingDirectory {
        plugin: &'static str,
        variable: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
    Mock,
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(EngineKind::Docker),
            "mock" => Ok(EngineKind::Mock),
            _ => Err(ConfigError::InvalidEngine(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub engine: EngineKind,
    pub max_concurrency: usize,
    pub docker_endpoint: Option<String>,
    pub image_pull_timeout: Duration,
    pub capacity_retry_interval: Duration,
    pub capacity_retry_limit: u32,
    pub artifact_dir: Option<PathBuf>,
    pub task_log_dir: Option<PathBuf>,
    /// Enabled plugins, in the order they are run.
    pub plugins: Vec<String>,
}

fn parse_number<T: FromStr<Err = ParseIntError>>(
    name: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|source| ConfigError::InvalidNumber { name, source }),
        None => Ok(default),
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok().filter(|v| !v.is_empty()))
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let engine = lookup(ENV_ENGINE)
            .unwrap_or_else(|| "docker".to_string())
            .parse::<EngineKind>()?;

        let max_concurrency = parse_number(ENV_MAX_CONCURRENCY, lookup(ENV_MAX_CONCURRENCY), 1usize)?;
        if !(1..=MAX_CONCURRENCY_LIMIT).contains(&max_concurrency) {
            return Err(ConfigError::OutOfRange {
                name: ENV_MAX_CONCURRENCY,
                value: max_concurrency,
                min: 1,
                max: MAX_CONCURRENCY_LIMIT,
            });
        }

        let pull_timeout = parse_number(
            ENV_IMAGE_PULL_TIMEOUT_SECS,
            lookup(ENV_IMAGE_PULL_TIMEOUT_SECS),
            600u64,
        )?;
        let retry_interval = parse_number(
            ENV_CAPACITY_RETRY_INTERVAL_MS,
            lookup(ENV_CAPACITY_RETRY_INTERVAL_MS),
            500u64,
        )?;
        let capacity_retry_limit = parse_number(
            ENV_CAPACITY_RETRY_LIMIT,
            lookup(ENV_CAPACITY_RETRY_LIMIT),
            20u32,
        )?;

        let artifact_dir = lookup(ENV_ARTIFACT_DIR).map(PathBuf::from);
        let task_log_dir = lookup(ENV_TASK_LOG_DIR).map(PathBuf::from);

        let plugins = match lookup(ENV_PLUGINS) {
            Some(list) => {
                let plugins: Vec<String> = list
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                for plugin in &plugins {
                    if !KNOWN_PLUGINS.contains(&plugin.as_str()) {
                        return Err(ConfigError::UnknownPlugin(plugin.clone()));
                    }
                }
                if plugins.iter().any(|p| p == "artifacts") && artifact_dir.is_none() {
                    return Err(ConfigError::MissingDirectory {
                        plugin: "artifacts",
                        variable: ENV_ARTIFACT_DIR,
                    });
                }
                if plugins.iter().any(|p| p == "tasklog") && task_log_dir.is_none() {
                    return Err(ConfigError::MissingDirectory {
                        plugin: "tasklog",
                        variable: ENV_TASK_LOG_DIR,
                    });
                }
                plugins
            }
            // Everything whose prerequisites are configured.
            None => KNOWN_PLUGINS
                .iter()
                .filter(|p| match **p {
                    "artifacts" => artifact_dir.is_some(),
                    "tasklog" => task_log_dir.is_some(),
                    _ => true,
                })
                .map(|p| p.to_string())
                .collect(),
        };

        Ok(WorkerConfig {
            engine,
            max_concurrency,
            docker_endpoint: lookup(ENV_DOCKER_ENDPOINT),
            image_pull_timeout: Duration::from_secs(pull_timeout),
            capacity_retry_interval: Duration::from_millis(retry_interval),
            capacity_retry_limit,
            artifact_dir,
            task_log_dir,
            plugins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.engine, EngineKind::Docker);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.image_pull_timeout, Duration::from_secs(600));
        assert_eq!(config.capacity_retry_interval, Duration::from_millis(500));
        assert_eq!(config.capacity_retry_limit, 20);
        assert_eq!(config.docker_endpoint, None);
        assert_eq!(config.plugins, vec!["env", "success", "cache"]);
    }

    #[test]
    fn test_directories_enable_plugins() {
        let config = config(&[
            (ENV_ENGINE, "Mock"),
            (ENV_ARTIFACT_DIR, "/tmp/artifacts"),
            (ENV_TASK_LOG_DIR, "/tmp/logs"),
        ])
        .unwrap();
        assert_eq!(config.engine, EngineKind::Mock);
        assert_eq!(config.plugins, KNOWN_PLUGINS.to_vec());
    }

    #[rstest]
    #[case(&[(ENV_MAX_CONCURRENCY, "0")])]
    #[case(&[(ENV_MAX_CONCURRENCY, "65")])]
    #[case(&[(ENV_MAX_CONCURRENCY, "many")])]
    #[case(&[(ENV_ENGINE, "qemu")])]
    #[case(&[(ENV_PLUGINS, "env,telepathy")])]
    #[case(&[(ENV_PLUGINS, "artifacts")])]
    #[case(&[(ENV_CAPACITY_RETRY_LIMIT, "-1")])]
    fn test_invalid_settings(#[case] vars: &[(&str, &str)]) {
        assert!(config(vars).is_err());
    }

    #[test]
    fn test_explicit_plugin_list() {
        let config = config(&[(ENV_PLUGINS, " success , env ")]).unwrap();
        assert_eq!(config.plugins, vec!["success", "env"]);
    }
}
