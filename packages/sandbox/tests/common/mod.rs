// ABOUTME: Host-shell provider standing in for Docker in integration tests
// ABOUTME: Runs "container" execs on the host with the workspace mounted at its own path

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use shellbox_sandbox::providers::{
    ContainerConfig, ContainerInfo, ContainerStatus, ExecResult, ImageBuild, Provider,
    ProviderError, Result,
};
use shellbox_sandbox::{ContainerLifecycle, EngineConfig, SandboxEngine, Workspace};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    running: bool,
}

#[derive(Default)]
pub struct HostProvider {
    images: Mutex<HashSet<String>>,
    builds: Mutex<Vec<String>>,
    container: Mutex<Option<FakeContainer>>,
    created: AtomicU32,
    starts: AtomicU32,
    exec_failures: AtomicU32,
    lost_replies: AtomicU32,
    build_delay_ms: AtomicU64,
    fail_builds: AtomicBool,
    fail_starts: AtomicBool,
}

impl HostProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stop the container as if its main process died
    pub fn crash(&self) {
        if let Some(container) = self.container.lock().unwrap().as_mut() {
            container.running = false;
        }
    }

    /// Fail the next `count` execs with a connection error
    pub fn fail_next_execs(&self, count: u32) {
        self.exec_failures.store(count, Ordering::SeqCst);
    }

    /// Run the next `count` execs, then report a stream error instead of their result
    pub fn lose_next_replies(&self, count: u32) {
        self.lost_replies.store(count, Ordering::SeqCst);
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Make every image build take `delay`
    pub fn slow_builds(&self, delay: Duration) {
        self.build_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn builds(&self) -> Vec<String> {
        self.builds.lock().unwrap().clone()
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn container_id(&self) -> Option<String> {
        self.container.lock().unwrap().as_ref().map(|c| c.id.clone())
    }

    fn running_id(&self, container_id: &str) -> Result<()> {
        match self.container.lock().unwrap().as_ref() {
            Some(c) if c.id == container_id && c.running => Ok(()),
            Some(c) if c.id == container_id => Err(ProviderError::ContainerError(format!(
                "container {} is not running",
                container_id
            ))),
            _ => Err(ProviderError::NotFound(container_id.to_string())),
        }
    }
}

#[async_trait]
impl Provider for HostProvider {
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn build_image(&self, build: &ImageBuild) -> Result<()> {
        let delay = self.build_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(ProviderError::ImageError(format!(
                "build of {} failed: step 3/7 exited 100",
                build.tag
            )));
        }
        self.builds.lock().unwrap().push(build.tag.clone());
        self.images.lock().unwrap().insert(build.tag.clone());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{:0>12}{}", n, "f00dfeedbeef");
        *self.container.lock().unwrap() = Some(FakeContainer {
            id: id.clone(),
            name: config.name.clone(),
            running: true,
        });
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("start refused".to_string()));
        }
        let mut guard = self.container.lock().unwrap();
        match guard.as_mut() {
            Some(c) if c.id == container_id => {
                c.running = true;
                self.starts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(ProviderError::NotFound(container_id.to_string())),
        }
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u64) -> Result<()> {
        if let Some(c) = self.container.lock().unwrap().as_mut() {
            if c.id == container_id {
                c.running = false;
            }
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        let mut guard = self.container.lock().unwrap();
        if guard.as_ref().map(|c| c.id == container_id).unwrap_or(false) {
            *guard = None;
        }
        Ok(())
    }

    async fn find_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>> {
        Ok(self
            .container
            .lock()
            .unwrap()
            .as_ref()
            .filter(|c| c.name == name_or_id || c.id == name_or_id)
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.name.clone(),
                status: if c.running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                },
                started_at: None,
            }))
    }

    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        _user: Option<String>,
    ) -> Result<ExecResult> {
        self.running_id(container_id)?;

        let failing = self
            .exec_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::ConnectionError(
                "connection reset by peer".to_string(),
            ));
        }

        let (program, args) = command
            .split_first()
            .ok_or_else(|| ProviderError::ExecError("empty command".to_string()))?;
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let lost = self
            .lost_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(ProviderError::ExecError(
                "stream reset after start".to_string(),
            ));
        }

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn container_logs(&self, container_id: &str, _tail: usize) -> Result<String> {
        Ok(format!("logs for {}\n", container_id))
    }

    async fn inspect_raw(&self, container_id: &str) -> Result<Value> {
        let running = self.running_id(container_id).is_ok();
        Ok(json!({
            "Id": container_id,
            "State": {
                "Status": if running { "running" } else { "exited" },
                "Running": running,
                "ExitCode": if running { 0 } else { 137 },
            }
        }))
    }
}

/// Config tuned for fast host-backed tests
pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workspace_dir = root.to_path_buf();
    config.env_file = root.join("local.env");

    config.container.exec_user = None;
    config.container.login_shell = false;
    config.container.readiness_timeout = Duration::from_millis(300);
    config.container.readiness_poll = Duration::from_millis(20);
    config.container.retry_backoff = Duration::from_millis(10);
    config.container.exec_retries = 2;

    config.watchdog.interval = Duration::from_millis(50);
    config.watchdog.rebuild_backoff = Duration::from_millis(10);

    config.registry.poll_interval = Duration::from_millis(50);
    config.registry.liveness_every = 2;
    config.registry.read_grace = Duration::ZERO;
    config.registry.prune_interval = Duration::from_secs(3600);
    config
}

/// Workspace whose "container" path is the host path itself
pub fn host_workspace(root: &Path) -> Workspace {
    Workspace::with_container_root(root, root)
}

pub struct Harness {
    pub dir: TempDir,
    pub provider: Arc<HostProvider>,
    pub engine: SandboxEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let mut config = test_config(&root);
        adjust(&mut config);

        let provider = HostProvider::new();
        let engine =
            SandboxEngine::with_workspace(config, provider.clone(), host_workspace(&root)).unwrap();
        Self {
            dir,
            provider,
            engine,
        }
    }

    pub fn lifecycle(&self) -> &Arc<ContainerLifecycle> {
        self.engine.lifecycle()
    }
}
