// ABOUTME: Engine configuration loaded from SHELLBOX_* environment variables
// ABOUTME: Groups container, watchdog, and task registry settings with documented defaults

use crate::constants::*;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("{name} must be greater than zero")]
    MustBePositive { name: &'static str },
}

/// Container build and runtime settings
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub image_name: String,
    pub base_image_name: String,
    pub container_name: String,
    /// Directory holding `Dockerfile.base` and `Dockerfile`; also the build context
    pub dockerfile_dir: PathBuf,
    pub exec_user: Option<String>,
    /// Run task scripts under `bash -l` so the image's profile sets PATH
    pub login_shell: bool,
    pub memory_mb: u64,
    pub cpus: f32,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
    pub exec_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image_name: "shellbox-runner".to_string(),
            base_image_name: "shellbox-base".to_string(),
            container_name: "shellbox-sandbox".to_string(),
            dockerfile_dir: PathBuf::from("docker"),
            exec_user: Some("ubuntu".to_string()),
            login_shell: true,
            memory_mb: 4096,
            cpus: 2.0,
            readiness_timeout: Duration::from_secs(60),
            readiness_poll: Duration::from_millis(500),
            exec_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Watchdog probing and restart policy
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub max_restarts: u32,
    /// Base delay after a failed rebuild, doubled per attempt
    pub rebuild_backoff: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 3,
            max_restarts: 5,
            rebuild_backoff: Duration::from_secs(2),
        }
    }
}

/// Task registry timing and retention
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub default_timeout: Duration,
    pub poll_interval: Duration,
    /// Probe process liveness every N polls
    pub liveness_every: u32,
    pub retention: Duration,
    /// Terminal tasks whose output was read are pruned after this grace
    pub read_grace: Duration,
    pub prune_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(200),
            liveness_every: 5,
            retention: Duration::from_secs(3600),
            read_grace: Duration::from_secs(60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_dir: PathBuf,
    pub env_file: PathBuf,
    pub container: ContainerSettings,
    pub watchdog: WatchdogConfig,
    pub registry: RegistryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            env_file: PathBuf::from("local/.env"),
            container: ContainerSettings::default(),
            watchdog: WatchdogConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(dir) = lookup(SHELLBOX_WORKSPACE_DIR) {
            config.workspace_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup(SHELLBOX_ENV_FILE) {
            config.env_file = PathBuf::from(file);
        }

        let container = &mut config.container;
        if let Some(name) = lookup(SHELLBOX_IMAGE_NAME) {
            container.image_name = name;
        }
        if let Some(name) = lookup(SHELLBOX_BASE_IMAGE_NAME) {
            container.base_image_name = name;
        }
        if let Some(name) = lookup(SHELLBOX_CONTAINER_NAME) {
            container.container_name = name;
        }
        if let Some(dir) = lookup(SHELLBOX_DOCKERFILE_DIR) {
            container.dockerfile_dir = PathBuf::from(dir);
        }
        if let Some(user) = lookup(SHELLBOX_EXEC_USER) {
            let user = user.trim().to_string();
            container.exec_user = if user.is_empty() { None } else { Some(user) };
        }
        if let Some(mb) = parse(&lookup, SHELLBOX_MEMORY_MB)? {
            container.memory_mb = positive(SHELLBOX_MEMORY_MB, mb)?;
        }
        if let Some(cpus) = parse::<f32, _>(&lookup, SHELLBOX_CPUS)? {
            if cpus <= 0.0 {
                return Err(ConfigError::MustBePositive {
                    name: SHELLBOX_CPUS,
                });
            }
            container.cpus = cpus;
        }
        if let Some(secs) = parse(&lookup, SHELLBOX_READINESS_TIMEOUT_SECONDS)? {
            container.readiness_timeout =
                Duration::from_secs(positive(SHELLBOX_READINESS_TIMEOUT_SECONDS, secs)?);
        }
        if let Some(retries) = parse(&lookup, SHELLBOX_EXEC_RETRIES)? {
            container.exec_retries = retries;
        }

        let watchdog = &mut config.watchdog;
        if let Some(secs) = parse(&lookup, SHELLBOX_WATCHDOG_INTERVAL_SECONDS)? {
            watchdog.interval =
                Duration::from_secs(positive(SHELLBOX_WATCHDOG_INTERVAL_SECONDS, secs)?);
        }
        if let Some(threshold) = parse::<u64, _>(&lookup, SHELLBOX_WATCHDOG_FAILURE_THRESHOLD)? {
            watchdog.failure_threshold =
                positive(SHELLBOX_WATCHDOG_FAILURE_THRESHOLD, threshold)? as u32;
        }
        if let Some(max) = parse(&lookup, SHELLBOX_WATCHDOG_MAX_RESTARTS)? {
            watchdog.max_restarts = max;
        }

        let registry = &mut config.registry;
        if let Some(secs) = parse(&lookup, SHELLBOX_DEFAULT_TIMEOUT_SECONDS)? {
            registry.default_timeout =
                Duration::from_secs(positive(SHELLBOX_DEFAULT_TIMEOUT_SECONDS, secs)?);
        }
        if let Some(secs) = parse(&lookup, SHELLBOX_TASK_RETENTION_SECONDS)? {
            registry.retention = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name,
                value: raw.clone(),
            }),
    }
}

fn positive(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::MustBePositive { name })
    } else {
        Ok(value)
    }
}
