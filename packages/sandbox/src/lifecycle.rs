// ABOUTME: Lifecycle manager that owns the single sandbox container
// ABOUTME: Builds layered images, starts and probes the container, and serializes rebuilds behind one lock

use crate::config::ContainerSettings;
use crate::constants::{LABEL_MANAGED, LABEL_WORKSPACE};
use crate::diagnostics::{self, Capture, DiagnosticsReport};
use crate::error::{Result, SandboxError};
use crate::providers::{ContainerConfig, ExecResult, ImageBuild, Provider, VolumeMount};
use crate::script::{shell_quote, ExecutionScript};
use crate::task::KillSignal;
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Polls (100 ms apart) a repeated launch waits for the first one to record its pid
const LAUNCH_CLAIM_POLLS: u32 = 50;

/// Exits 0 while any non-zombie process remains in process group `$1`
const GROUP_ALIVE_SCRIPT: &str = r#"pgid=$1
for d in /proc/[0-9]*; do
  read -r line 2>/dev/null < "$d/stat" || continue
  set -- ${line##*) }
  [ "$3" = "$pgid" ] && [ "$1" != Z ] && exit 0
done
exit 1"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Absent,
    Building,
    Starting,
    Ready,
    Healthy,
    Unhealthy,
    Stopped,
}

/// The managed container as last observed
#[derive(Debug, Clone, Serialize)]
pub struct SandboxContainer {
    pub id: Option<String>,
    pub name: String,
    pub state: ContainerState,
    pub image_tag: String,
    pub workspace_path: PathBuf,
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
    /// Set once restarts are exhausted; cleared only by `reset()`
    pub permanently_unhealthy: bool,
    pub last_error: Option<String>,
}

/// A detached script execution inside the container
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub task_id: String,
    /// Leader of the task's process group
    pub pid: u32,
    pub output_path: PathBuf,
    pub code_path: PathBuf,
    pub pid_path: PathBuf,
}

impl ProcessHandle {
    fn paths(workspace: &Workspace, task_id: &str) -> (PathBuf, PathBuf, PathBuf) {
        let dir = workspace.task_logs_dir();
        (
            dir.join(format!("task_{}.out", task_id)),
            dir.join(format!("task_{}.code", task_id)),
            dir.join(format!("task_{}.pid", task_id)),
        )
    }

    /// Read the recorded exit code, if the process has finished
    pub async fn exit_code(&self) -> Option<i32> {
        let text = tokio::fs::read_to_string(&self.code_path).await.ok()?;
        text.trim().parse().ok()
    }

    pub fn files(&self) -> [&Path; 3] {
        [&self.output_path, &self.code_path, &self.pid_path]
    }
}

/// Shell text that starts `script` in its own process group and prints the leader pid
///
/// The pid file doubles as a launch claim: a second delivery of the same launcher
/// (an exec retried after the first one already started) reports the recorded pid
/// instead of running the script again.
fn launcher_command(
    script: &Path,
    output: &Path,
    code: &Path,
    pid_file: &Path,
    login_shell: bool,
) -> String {
    let shell = if login_shell { "bash -l" } else { "bash" };
    let pid_tmp = shell_quote(&format!("{}.tmp", pid_file.to_string_lossy()));
    let pid_file = shell_quote(&pid_file.to_string_lossy());
    format!(
        "if ! ( set -C; : > {pid_file} ) 2>/dev/null; then\n\
         i=0\n\
         while [ \"$i\" -lt {claim_polls} ]; do\n\
         if [ -s {pid_file} ]; then cat {pid_file}; exit 0; fi\n\
         i=$((i + 1)); sleep 0.1\n\
         done\n\
         echo \"launch already claimed but no pid was recorded\" >&2\n\
         exit 1\n\
         fi\n\
         set -m\n\
         bash -c '{shell} \"$0\" > \"$1\" 2>&1; echo $? > \"$2.tmp\" && mv -f \"$2.tmp\" \"$2\"' {script} {output} {code} < /dev/null > /dev/null 2>&1 &\n\
         pid=$!\n\
         echo \"$pid\" > {pid_tmp} && mv -f {pid_tmp} {pid_file}\n\
         echo \"$pid\"\n",
        shell = shell,
        claim_polls = LAUNCH_CLAIM_POLLS,
        script = shell_quote(&script.to_string_lossy()),
        output = shell_quote(&output.to_string_lossy()),
        code = shell_quote(&code.to_string_lossy()),
        pid_tmp = pid_tmp,
        pid_file = pid_file,
    )
}

/// Sole owner of the sandbox container
pub struct ContainerLifecycle {
    provider: Arc<dyn Provider>,
    workspace: Workspace,
    settings: ContainerSettings,
    /// Lifecycle lock; every transition happens while holding it
    container: Mutex<SandboxContainer>,
    published: watch::Sender<SandboxContainer>,
    last_script: watch::Sender<Option<PathBuf>>,
}

impl ContainerLifecycle {
    pub fn new(provider: Arc<dyn Provider>, workspace: Workspace, settings: ContainerSettings) -> Self {
        let initial = SandboxContainer {
            id: None,
            name: settings.container_name.clone(),
            state: ContainerState::Absent,
            image_tag: settings.image_name.clone(),
            workspace_path: workspace.host_root().to_path_buf(),
            last_health_check: None,
            restart_count: 0,
            permanently_unhealthy: false,
            last_error: None,
        };
        let (published, _) = watch::channel(initial.clone());
        let (last_script, _) = watch::channel(None);

        Self {
            provider,
            workspace,
            settings,
            container: Mutex::new(initial),
            published,
            last_script,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Latest published container record; never waits on the lifecycle lock
    pub fn status(&self) -> SandboxContainer {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SandboxContainer> {
        self.published.subscribe()
    }

    fn publish(&self, container: &SandboxContainer) {
        self.published.send_replace(container.clone());
    }

    fn transition(&self, container: &mut SandboxContainer, state: ContainerState) {
        if container.state != state {
            debug!(
                "Container {} state {:?} -> {:?}",
                container.name, container.state, state
            );
        }
        container.state = state;
        self.publish(container);
    }

    /// Bring the container to `healthy`, building and starting as needed; returns its id
    pub async fn ensure_ready(&self) -> Result<String> {
        let mut container = self.container.lock().await;
        self.ensure_ready_locked(&mut container).await
    }

    async fn ensure_ready_locked(&self, container: &mut SandboxContainer) -> Result<String> {
        if container.permanently_unhealthy {
            return Err(SandboxError::ContainerUnavailable(format!(
                "container {} is marked permanently unhealthy; reset required",
                container.name
            )));
        }

        if container.state == ContainerState::Healthy {
            if let Some(id) = &container.id {
                return Ok(id.clone());
            }
        }

        match self.bring_up(container).await {
            Ok(id) => {
                container.last_error = None;
                container.last_health_check = Some(Utc::now());
                self.transition(container, ContainerState::Healthy);
                info!("Sandbox container {} is healthy ({})", container.name, id);
                Ok(id)
            }
            Err(e) => {
                error!("Failed to bring up container {}: {}", container.name, e);
                container.last_error = Some(e.to_string());
                let state = if container.id.is_some() {
                    ContainerState::Unhealthy
                } else {
                    ContainerState::Absent
                };
                self.transition(container, state);
                Err(e)
            }
        }
    }

    async fn bring_up(&self, container: &mut SandboxContainer) -> Result<String> {
        self.workspace.prepare()?;

        if !self.provider.image_exists(&self.settings.image_name).await? {
            self.transition(container, ContainerState::Building);
            self.build_images(false).await?;
        }

        self.transition(container, ContainerState::Starting);
        let id = match self
            .provider
            .find_container(&self.settings.container_name)
            .await?
        {
            Some(info) if info.status.is_running() => {
                debug!("Reusing running container {}", info.id);
                info.id
            }
            Some(info) => {
                warn!(
                    "Container {} found in state {:?}; restarting",
                    info.id, info.status
                );
                self.capture_diagnostics(Some(&info.id), "container found stopped")
                    .await;
                match self.provider.start_container(&info.id).await {
                    Ok(()) => info.id,
                    Err(e) => {
                        warn!("Restart of {} failed ({}); recreating", info.id, e);
                        self.provider.remove_container(&info.id, true).await?;
                        self.provider
                            .create_container(&self.container_config())
                            .await?
                    }
                }
            }
            None => {
                self.provider
                    .create_container(&self.container_config())
                    .await?
            }
        };
        container.id = Some(id.clone());
        self.publish(container);

        self.wait_until_ready(&id).await?;
        self.transition(container, ContainerState::Ready);
        self.write_readiness_marker(container).await?;
        Ok(id)
    }

    /// Build the base layer (when missing or forced) and then the runner layer
    async fn build_images(&self, force: bool) -> Result<()> {
        let dir = &self.settings.dockerfile_dir;
        let labels = vec![(LABEL_MANAGED.to_string(), "true".to_string())];

        let base = ImageBuild {
            dockerfile: dir.join("Dockerfile.base"),
            context: dir.clone(),
            tag: self.settings.base_image_name.clone(),
            build_args: vec![],
            labels: labels.clone(),
        };
        let needs_base = force
            || !self
                .provider
                .image_exists(&base.tag)
                .await
                .map_err(|e| build_failed(&base.tag, e))?;
        if needs_base {
            self.provider
                .build_image(&base)
                .await
                .map_err(|e| build_failed(&base.tag, e))?;
        }

        let runner = ImageBuild {
            dockerfile: dir.join("Dockerfile"),
            context: dir.clone(),
            tag: self.settings.image_name.clone(),
            build_args: vec![(
                "BASE_IMAGE".to_string(),
                self.settings.base_image_name.clone(),
            )],
            labels,
        };
        self.provider
            .build_image(&runner)
            .await
            .map_err(|e| build_failed(&runner.tag, e))
    }

    fn container_config(&self) -> ContainerConfig {
        let host_root = self.workspace.host_root().display().to_string();
        ContainerConfig {
            image: self.settings.image_name.clone(),
            name: self.settings.container_name.clone(),
            env_vars: HashMap::new(),
            volumes: vec![VolumeMount {
                host_path: host_root.clone(),
                container_path: self.workspace.container_root().display().to_string(),
                readonly: false,
            }],
            cpu_cores: self.settings.cpus,
            memory_mb: self.settings.memory_mb,
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(self.workspace.container_root().display().to_string()),
            labels: HashMap::from([(LABEL_WORKSPACE.to_string(), host_root)]),
        }
    }

    /// Poll a no-op exec until it succeeds or the readiness budget runs out
    async fn wait_until_ready(&self, container_id: &str) -> Result<()> {
        let deadline = Instant::now() + self.settings.readiness_timeout;
        loop {
            match self
                .provider
                .exec_command(
                    container_id,
                    vec!["true".to_string()],
                    self.settings.exec_user.clone(),
                )
                .await
            {
                Ok(result) if result.success() => return Ok(()),
                Ok(result) => debug!("Readiness probe exited with {}", result.exit_code),
                Err(e) => debug!("Readiness probe failed: {}", e),
            }

            if Instant::now() >= deadline {
                return Err(SandboxError::ContainerUnavailable(format!(
                    "container {} not ready within {:?}",
                    container_id, self.settings.readiness_timeout
                )));
            }
            time::sleep(self.settings.readiness_poll).await;
        }
    }

    async fn write_readiness_marker(&self, container: &SandboxContainer) -> Result<()> {
        let marker = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now().to_rfc3339(),
            "up": true,
            "container": {
                "name": container.name,
                "id": container.id,
                "running": true,
            },
            "server": {
                "pid": std::process::id(),
            },
        });

        let path = self.workspace.readiness_marker();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&marker)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote readiness marker {}", path.display());
        Ok(())
    }

    /// Liveness probe, skipped (`None`) while another lifecycle operation holds the lock
    pub async fn try_probe(&self) -> Option<Result<()>> {
        let mut container = self.container.try_lock().ok()?;
        Some(self.probe_locked(&mut container).await)
    }

    /// Liveness probe that waits for the lifecycle lock
    pub async fn probe(&self) -> Result<()> {
        let mut container = self.container.lock().await;
        self.probe_locked(&mut container).await
    }

    async fn probe_locked(&self, container: &mut SandboxContainer) -> Result<()> {
        let result = self.check_alive(container).await;
        match &result {
            Ok(()) => {
                container.last_health_check = Some(Utc::now());
                if !container.permanently_unhealthy {
                    self.transition(container, ContainerState::Healthy);
                }
            }
            Err(e) => {
                container.last_error = Some(e.to_string());
                if container.id.is_some() {
                    self.transition(container, ContainerState::Unhealthy);
                }
            }
        }
        result
    }

    async fn check_alive(&self, container: &mut SandboxContainer) -> Result<()> {
        let info = self
            .provider
            .find_container(&self.settings.container_name)
            .await?
            .ok_or_else(|| {
                SandboxError::ContainerUnavailable(format!(
                    "container {} does not exist",
                    self.settings.container_name
                ))
            })?;

        if !info.status.is_running() {
            return Err(SandboxError::ContainerUnavailable(format!(
                "container {} is {:?}",
                info.id, info.status
            )));
        }

        if container.id.as_deref() != Some(info.id.as_str()) {
            debug!("Container id changed to {}", info.id);
            container.id = Some(info.id.clone());
        }

        let result = self
            .provider
            .exec_command(
                &info.id,
                vec!["true".to_string()],
                self.settings.exec_user.clone(),
            )
            .await?;
        if !result.success() {
            return Err(SandboxError::ContainerUnavailable(format!(
                "no-op exec exited with {}",
                result.exit_code
            )));
        }
        Ok(())
    }

    /// Tear down the container and rebuild everything from `absent`
    pub async fn rebuild(&self) -> Result<String> {
        let mut container = self.container.lock().await;
        self.rebuild_locked(&mut container).await
    }

    /// Capture diagnostics, then rebuild, without releasing the lock in between
    pub async fn recover(&self, reason: &str) -> Result<String> {
        let mut container = self.container.lock().await;
        let id = container.id.clone();
        self.capture_diagnostics(id.as_deref(), reason).await;
        self.rebuild_locked(&mut container).await
    }

    async fn rebuild_locked(&self, container: &mut SandboxContainer) -> Result<String> {
        container.restart_count += 1;
        info!(
            "Rebuilding sandbox container {} (restart {})",
            container.name, container.restart_count
        );

        self.teardown(container).await;
        self.transition(container, ContainerState::Building);
        if let Err(e) = self.build_images(true).await {
            container.last_error = Some(e.to_string());
            self.transition(container, ContainerState::Absent);
            return Err(e);
        }
        self.ensure_ready_locked(container).await
    }

    /// Stop and remove the container; failures are logged, not returned
    async fn teardown(&self, container: &mut SandboxContainer) {
        let existing = match self
            .provider
            .find_container(&self.settings.container_name)
            .await
        {
            Ok(found) => found.map(|info| info.id),
            Err(e) => {
                warn!("Could not look up container for teardown: {}", e);
                container.id.clone()
            }
        };

        if let Some(id) = existing {
            if let Err(e) = self.provider.stop_container(&id, 10).await {
                warn!("Failed to stop container {}: {}", id, e);
            }
            if let Err(e) = self.provider.remove_container(&id, true).await {
                warn!("Failed to remove container {}: {}", id, e);
            }
        }

        container.id = None;
        self.transition(container, ContainerState::Absent);
    }

    /// Stop attempting recovery until `reset()`
    pub async fn mark_permanently_unhealthy(&self, reason: &str) {
        let mut container = self.container.lock().await;
        error!(
            "Marking container {} permanently unhealthy: {}",
            container.name, reason
        );
        container.permanently_unhealthy = true;
        container.last_error = Some(reason.to_string());
        self.transition(&mut container, ContainerState::Unhealthy);
    }

    /// Clear the permanent-unhealthy flag and the restart counter
    pub async fn reset(&self) -> SandboxContainer {
        let mut container = self.container.lock().await;
        info!("Resetting container {} health state", container.name);
        container.permanently_unhealthy = false;
        container.restart_count = 0;
        container.last_error = None;
        if container.state == ContainerState::Healthy {
            self.publish(&container);
        } else {
            let state = if container.id.is_some() {
                ContainerState::Unhealthy
            } else {
                ContainerState::Absent
            };
            self.transition(&mut container, state);
        }
        container.clone()
    }

    /// Stop the container (best-effort); the workspace keeps its files
    pub async fn shutdown(&self) {
        let mut container = self.container.lock().await;
        if let Some(id) = container.id.clone() {
            if let Err(e) = self.provider.stop_container(&id, 10).await {
                warn!("Failed to stop container {}: {}", id, e);
            }
        }
        self.transition(&mut container, ContainerState::Stopped);
        let _ = tokio::fs::remove_file(self.workspace.readiness_marker()).await;
    }

    /// Write diagnostics for `container_id`; failures are only logged
    pub async fn capture_diagnostics(
        &self,
        container_id: Option<&str>,
        reason: &str,
    ) -> Option<DiagnosticsReport> {
        let last_script = self.last_script.borrow().clone();
        let request = Capture {
            container_id,
            reason,
            last_script: last_script.as_deref(),
            exec_user: self.settings.exec_user.clone(),
        };

        match diagnostics::capture(self.provider.as_ref(), &self.workspace, request).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Failed to capture diagnostics: {}", e);
                None
            }
        }
    }

    /// Downgrade a healthy container after a failed exec so the next call re-inspects it
    async fn mark_suspect(&self, container_id: &str) {
        let mut container = self.container.lock().await;
        if container.state == ContainerState::Healthy
            && container.id.as_deref() == Some(container_id)
        {
            self.transition(&mut container, ContainerState::Unhealthy);
        }
    }

    /// Run `command` in the container, retrying transient failures with backoff
    pub async fn run_with_retry(&self, command: Vec<String>) -> Result<ExecResult> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.ensure_ready().await {
                Ok(id) => self
                    .provider
                    .exec_command(&id, command.clone(), self.settings.exec_user.clone())
                    .await
                    .map_err(|e| (Some(id), SandboxError::from(e))),
                Err(e) => Err((None, e)),
            };

            let err = match outcome {
                Ok(result) => return Ok(result),
                Err((_, e)) if !e.is_transient() || self.status().permanently_unhealthy => {
                    return Err(e)
                }
                Err((id, e)) => {
                    if let Some(id) = id {
                        self.mark_suspect(&id).await;
                    }
                    e
                }
            };

            attempt += 1;
            if attempt > self.settings.exec_retries {
                return Err(SandboxError::ContainerUnavailable(format!(
                    "giving up after {} attempts: {}",
                    attempt, err
                )));
            }

            let delay = self.settings.retry_backoff * 2u32.saturating_pow(attempt - 1);
            warn!(
                "Exec attempt {} failed ({}); retrying in {:?}",
                attempt, err, delay
            );
            time::sleep(delay).await;
        }
    }

    /// Launch a materialized script detached in its own process group
    pub async fn exec_in_container(&self, script: &ExecutionScript) -> Result<ProcessHandle> {
        self.last_script.send_replace(Some(script.host_path.clone()));

        let (output_path, code_path, pid_path) =
            ProcessHandle::paths(&self.workspace, &script.task_id);
        if let Some(dir) = output_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let launcher = launcher_command(
            &script.container_path,
            &self.workspace.to_container_path(&output_path)?,
            &self.workspace.to_container_path(&code_path)?,
            &self.workspace.to_container_path(&pid_path)?,
            self.settings.login_shell,
        );

        let result = self
            .run_with_retry(vec!["bash".to_string(), "-c".to_string(), launcher])
            .await?;
        if !result.success() {
            return Err(SandboxError::ContainerUnavailable(format!(
                "launcher for task {} exited with {}: {}",
                script.task_id,
                result.exit_code,
                result.stderr_lossy().trim()
            )));
        }

        let stdout = result.stdout_lossy();
        let pid = stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                SandboxError::ContainerUnavailable(format!(
                    "launcher for task {} did not report a pid: {:?}",
                    script.task_id, stdout
                ))
            })?;

        debug!("Task {} started as process group {}", script.task_id, pid);
        Ok(ProcessHandle {
            task_id: script.task_id.clone(),
            pid,
            output_path,
            code_path,
            pid_path,
        })
    }

    /// Deliver `signal` to a task's process group; `false` when no such group exists
    pub async fn signal_process(&self, pid: u32, signal: KillSignal) -> Result<bool> {
        let command = format!("kill -s {} -- -{}", signal.as_str(), pid);
        let result = self
            .run_with_retry(vec!["bash".to_string(), "-c".to_string(), command])
            .await?;
        Ok(result.success())
    }

    /// Whether a task's process group still has live members
    ///
    /// Single attempt against the current container; never triggers a bring-up.
    pub async fn process_alive(&self, pid: u32) -> Result<bool> {
        let id = self.status().id.ok_or_else(|| {
            SandboxError::ContainerUnavailable("no container to probe".to_string())
        })?;
        let result = self
            .provider
            .exec_command(
                &id,
                vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    GROUP_ALIVE_SCRIPT.to_string(),
                    "group-alive".to_string(),
                    pid.to_string(),
                ],
                self.settings.exec_user.clone(),
            )
            .await?;
        Ok(result.success())
    }
}

fn build_failed(tag: &str, err: crate::providers::ProviderError) -> SandboxError {
    SandboxError::BuildFailed {
        tag: tag.to_string(),
        details: err.to_string(),
    }
}
