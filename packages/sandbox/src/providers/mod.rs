// ABOUTME: Provider trait for the container runtime backing the sandbox
// ABOUTME: Abstracts image builds, container lifecycle, and exec so callers never touch Docker directly

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Exec error: {0}")]
    ExecError(String),

    #[error("Image error: {0}")]
    ImageError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Container configuration for creating the sandbox
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// One `docker build` invocation
#[derive(Debug, Clone)]
pub struct ImageBuild {
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub tag: String,
    pub build_args: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
}

/// Container runtime information
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Stopped,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

/// Execution result from running a command in a container
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Container runtime backing the sandbox
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the runtime daemon is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Check if an image tag exists locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build an image from a Dockerfile
    async fn build_image(&self, build: &ImageBuild) -> Result<()>;

    /// Create and start a container, returning its id
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Start an existing container
    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a container
    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    /// Remove a container
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// Look up a container by name or id; `None` when it does not exist
    async fn find_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>>;

    /// Run a command inside a container and wait for it to finish
    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        user: Option<String>,
    ) -> Result<ExecResult>;

    /// Last `tail` lines of the container's own log
    async fn container_logs(&self, container_id: &str, tail: usize) -> Result<String>;

    /// Raw inspect document for diagnostics
    async fn inspect_raw(&self, container_id: &str) -> Result<Value>;
}
