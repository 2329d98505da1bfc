// ABOUTME: Sandbox engine facade wiring the environment, scripts, container, tasks, and metrics together
// ABOUTME: Routes tagged tool requests through a single match and records every call's duration

use crate::config::EngineConfig;
use crate::env::{self, EnvironmentSet};
use crate::error::{Result, SandboxError};
use crate::lifecycle::{ContainerLifecycle, SandboxContainer};
use crate::metrics::MetricsCollector;
use crate::providers::Provider;
use crate::registry::{DispatchOptions, DispatchOutcome, KillOutcome, TaskListEntry, TaskRegistry};
use crate::script::{ScriptMaterializer, ScriptOptions};
use crate::task::{KillSignal, TaskStatus};
use crate::watchdog::Watchdog;
use crate::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    ExecuteCommand {
        command: String,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        background: bool,
        #[serde(default)]
        kill_after_seconds: Option<u64>,
    },
    TaskStatus {
        task_id: String,
    },
    TaskOutput {
        task_id: String,
        #[serde(default)]
        tail: Option<usize>,
    },
    TaskKill {
        task_id: String,
        #[serde(default)]
        signal: Option<String>,
        #[serde(default)]
        escalate_after_seconds: Option<u64>,
    },
    TaskList {
        #[serde(default)]
        include_status: bool,
    },
    ReloadEnvironment,
    SandboxStatus,
    SandboxReset,
}

impl ToolRequest {
    /// Name used for metrics and logs
    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolRequest::ExecuteCommand { .. } => "execute_command",
            ToolRequest::TaskStatus { .. } => "task_status",
            ToolRequest::TaskOutput { .. } => "task_output",
            ToolRequest::TaskKill { .. } => "task_kill",
            ToolRequest::TaskList { .. } => "task_list",
            ToolRequest::ReloadEnvironment => "reload_environment",
            ToolRequest::SandboxStatus => "sandbox_status",
            ToolRequest::SandboxReset => "sandbox_reset",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResponse {
    Execution(DispatchOutcome),
    TaskStatus(TaskStatus),
    TaskOutput { task_id: String, output: String },
    TaskKill(KillOutcome),
    TaskList { tasks: Vec<TaskListEntry> },
    Environment(EnvironmentSummary),
    Sandbox(SandboxContainer),
}

/// Names only; values may be secrets
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSummary {
    pub path: PathBuf,
    pub variables: Vec<String>,
    pub missing_file: bool,
}

/// A command as the engine receives it
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub command: String,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub background: bool,
    pub kill_after: Option<Duration>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct SandboxEngine {
    env_file: PathBuf,
    environment: RwLock<EnvironmentSet>,
    workspace: Workspace,
    materializer: ScriptMaterializer,
    lifecycle: Arc<ContainerLifecycle>,
    registry: Arc<TaskRegistry>,
    watchdog: Watchdog,
    metrics: Arc<MetricsCollector>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxEngine {
    /// Build an engine over the configured workspace; fails if the environment file is malformed
    pub fn new(config: EngineConfig, provider: Arc<dyn Provider>) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_dir)?;
        let host_root = std::fs::canonicalize(&config.workspace_dir)?;
        Self::with_workspace(config, provider, Workspace::new(host_root))
    }

    /// Build an engine over an explicit workspace mapping
    pub fn with_workspace(
        config: EngineConfig,
        provider: Arc<dyn Provider>,
        workspace: Workspace,
    ) -> Result<Self> {
        let loaded = env::load(&config.env_file)?;
        info!(
            "Loaded {} environment variables from {}",
            loaded.vars.len(),
            config.env_file.display()
        );

        let lifecycle = Arc::new(ContainerLifecycle::new(
            provider,
            workspace.clone(),
            config.container.clone(),
        ));
        let registry = Arc::new(TaskRegistry::new(lifecycle.clone(), config.registry.clone()));
        let watchdog = Watchdog::new(lifecycle.clone(), config.watchdog.clone());

        Ok(Self {
            env_file: config.env_file,
            environment: RwLock::new(loaded.vars),
            materializer: ScriptMaterializer::new(workspace.clone()),
            workspace,
            lifecycle,
            registry,
            watchdog,
            metrics: Arc::new(MetricsCollector::new()),
            janitor: Mutex::new(None),
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn lifecycle(&self) -> &Arc<ContainerLifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub async fn environment(&self) -> EnvironmentSet {
        self.environment.read().await.clone()
    }

    /// Bring the container up, then start the watchdog and the task janitor
    pub async fn start(&self) -> Result<String> {
        self.workspace.prepare()?;
        let stale = self.materializer.remove_all().await?;
        if stale > 0 {
            info!("Removed {} leftover scripts", stale);
        }

        let container_id = self.lifecycle.ensure_ready().await?;
        self.watchdog.start().await;

        let mut janitor = self.janitor.lock().await;
        if janitor.is_none() {
            *janitor = Some(self.registry.spawn_janitor());
        }
        self.metrics.set_up(true);

        info!("Sandbox engine started with container {}", container_id);
        Ok(container_id)
    }

    /// Stop background loops and the container; task logs stay in the workspace
    pub async fn shutdown(&self) -> Result<()> {
        self.metrics.set_up(false);
        self.watchdog.stop().await;
        if let Some(janitor) = self.janitor.lock().await.take() {
            janitor.abort();
        }

        self.lifecycle.shutdown().await;
        let removed = self.materializer.remove_all().await?;
        info!("Sandbox engine stopped ({} scripts removed)", removed);
        Ok(())
    }

    /// Materialize `request.command` and hand it to the task registry
    pub async fn execute_command(&self, request: CommandRequest) -> Result<DispatchOutcome> {
        if request.command.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("command is empty".to_string()));
        }

        let mut extra_env = EnvironmentSet::new();
        for (name, value) in request.env {
            extra_env.insert(name, value)?;
        }
        let options = ScriptOptions {
            working_dir: request.working_dir,
            extra_env,
        };

        let task_id = Uuid::new_v4().to_string();
        let environment = self.environment().await;
        let script = self
            .materializer
            .materialize(&task_id, &request.command, &environment, &options)
            .await?;

        let dispatch = DispatchOptions {
            timeout: request.timeout,
            background: request.background,
            kill_after: request.kill_after,
        };
        match self.registry.dispatch(script, dispatch).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(cleanup) = self.materializer.remove(&task_id).await {
                    warn!("Failed to remove script for task {}: {}", task_id, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Re-read the environment file; the previous set stays active on failure
    pub async fn reload_environment(&self) -> Result<EnvironmentSummary> {
        let loaded = env::load(&self.env_file)?;
        let summary = EnvironmentSummary {
            path: self.env_file.clone(),
            variables: loaded.vars.iter().map(|(name, _)| name.to_string()).collect(),
            missing_file: loaded.missing_file.is_some(),
        };

        *self.environment.write().await = loaded.vars;
        info!(
            "Reloaded {} environment variables from {}",
            summary.variables.len(),
            self.env_file.display()
        );
        Ok(summary)
    }

    /// Dispatch one tool call and record how long it took
    pub async fn handle(&self, request: ToolRequest) -> Result<ToolResponse> {
        let tool = request.tool_name();
        let started = Instant::now();

        let result = match request {
            ToolRequest::ExecuteCommand {
                command,
                working_dir,
                env,
                timeout_seconds,
                background,
                kill_after_seconds,
            } => self
                .execute_command(CommandRequest {
                    command,
                    working_dir,
                    env,
                    timeout: timeout_seconds.map(Duration::from_secs),
                    background,
                    kill_after: kill_after_seconds.map(Duration::from_secs),
                })
                .await
                .map(ToolResponse::Execution),
            ToolRequest::TaskStatus { task_id } => self
                .registry
                .status(&task_id)
                .await
                .map(ToolResponse::TaskStatus),
            ToolRequest::TaskOutput { task_id, tail } => {
                let output = self.registry.output(&task_id, tail).await;
                output.map(|output| ToolResponse::TaskOutput { task_id, output })
            }
            ToolRequest::TaskKill {
                task_id,
                signal,
                escalate_after_seconds,
            } => match signal.as_deref().map(str::parse::<KillSignal>).transpose() {
                Ok(signal) => self
                    .registry
                    .kill(
                        &task_id,
                        signal.unwrap_or_default(),
                        escalate_after_seconds.map(Duration::from_secs),
                    )
                    .await
                    .map(ToolResponse::TaskKill),
                Err(e) => Err(SandboxError::InvalidRequest(e)),
            },
            ToolRequest::TaskList { include_status } => Ok(ToolResponse::TaskList {
                tasks: self.registry.list(include_status).await,
            }),
            ToolRequest::ReloadEnvironment => self
                .reload_environment()
                .await
                .map(ToolResponse::Environment),
            ToolRequest::SandboxStatus => Ok(ToolResponse::Sandbox(self.lifecycle.status())),
            ToolRequest::SandboxReset => Ok(ToolResponse::Sandbox(self.lifecycle.reset().await)),
        };

        let elapsed = started.elapsed();
        self.metrics.record(tool, elapsed);
        match &result {
            Ok(_) => info!("{} completed in {:?}", tool, elapsed),
            Err(e) => warn!("{} failed after {:?}: {}", tool, elapsed, e),
        }
        result
    }
}
