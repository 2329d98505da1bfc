// ABOUTME: Docker provider implementation for the sandbox container
// ABOUTME: Uses bollard for container lifecycle and exec, the docker CLI for layered image builds

use super::{
    ContainerConfig, ContainerInfo, ContainerStatus, ExecResult, ImageBuild, Provider,
    ProviderError, Result,
};
use crate::docker_cli;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    Docker,
};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
}

impl DockerProvider {
    /// Connect to the local Docker daemon
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            label_prefix: "shellbox".to_string(),
        }
    }

    /// Convert our config to bollard config
    fn to_bollard_config(&self, config: &ContainerConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());

        let binds: Vec<String> = config
            .volumes
            .iter()
            .map(|v| {
                format!(
                    "{}:{}:{}",
                    v.host_path,
                    v.container_path,
                    if v.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            binds: Some(binds),
            memory: Some((config.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((config.cpu_cores as f64 * 1_000_000_000.0) as i64),
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: config.command.clone(),
            env: Some(env),
            working_dir: config.working_dir.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Convert bollard container status to our status
    fn convert_status(state: &str) -> ContainerStatus {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" | "removing" => ContainerStatus::Stopped,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Unknown(other.to_string()),
        }
    }

    /// Map bollard errors onto provider errors, keeping 404 distinct
    fn classify(err: BollardError, subject: &str) -> ProviderError {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => ProviderError::NotFound(subject.to_string()),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => ProviderError::ContainerError(format!("{} ({}): {}", subject, status_code, message)),
            other => ProviderError::ConnectionError(other.to_string()),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn build_image(&self, build: &ImageBuild) -> Result<()> {
        docker_cli::build_docker_image(build).await
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        info!("Creating container: {}", config.name);

        let bollard_config = self.to_bollard_config(config);
        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), bollard_config)
            .await
            .map_err(|e| Self::classify(e, &config.name))?;

        debug!("Created container: {}", container.id);

        self.start_container(&container.id).await?;

        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Already running
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Self::classify(e, container_id)),
        }
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Self::classify(e, container_id)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(Self::classify(e, container_id)),
        }
    }

    async fn find_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>> {
        let inspect = match self.client.inspect_container(name_or_id, None).await {
            Ok(inspect) => inspect,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(Self::classify(e, name_or_id)),
        };

        let status = inspect
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|s| Self::convert_status(s.as_ref()))
            .unwrap_or_else(|| ContainerStatus::Unknown("no state".to_string()));

        let started_at = inspect
            .state
            .as_ref()
            .and_then(|state| state.started_at.as_ref())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(Some(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| name_or_id.to_string()),
            name: inspect
                .name
                .unwrap_or_else(|| name_or_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            started_at,
        }))
    }

    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        user: Option<String>,
    ) -> Result<ExecResult> {
        debug!(
            "Executing command in container {}: {:?}",
            container_id, command
        );

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            user,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| Self::classify(e, container_id))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(ProviderError::ExecError(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::ExecError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let exit_code = exec_inspect.exit_code.ok_or_else(|| {
            ProviderError::ExecError(format!("Exec {} finished without an exit code", exec.id))
        })?;

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn container_logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut logs = self.client.logs(container_id, Some(options));
        let mut text = String::new();

        while let Some(result) = logs.next().await {
            match result {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    text.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(Self::classify(e, container_id)),
            }
        }

        Ok(text)
    }

    async fn inspect_raw(&self, container_id: &str) -> Result<Value> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| Self::classify(e, container_id))?;

        serde_json::to_value(inspect).map_err(|e| ProviderError::ContainerError(e.to_string()))
    }
}
