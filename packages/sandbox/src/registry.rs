// ABOUTME: Task registry tracking every dispatched script execution
// ABOUTME: Supervises processes, answers status/output queries, delivers signals, and prunes finished tasks

use crate::config::RegistryConfig;
use crate::error::{Result, SandboxError};
use crate::lifecycle::{ContainerLifecycle, ProcessHandle};
use crate::script::ExecutionScript;
use crate::task::{KillSignal, TaskState, TaskStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// How a dispatch should be awaited
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Foreground wait budget; `None` uses the configured default
    pub timeout: Option<Duration>,
    pub background: bool,
    /// Hard runtime limit; the task is killed and marked timed-out past it
    pub kill_after: Option<Duration>,
}

/// What the caller gets back from `dispatch`
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    /// Output so far (foreground only)
    pub output: Option<String>,
    /// Foreground wait ended before the task finished
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    /// False when the task was already terminal and nothing was sent
    pub signal_sent: bool,
    pub escalated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskListEntry {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

struct TaskEntry {
    script: ExecutionScript,
    status: watch::Sender<TaskStatus>,
    handle: OnceLock<ProcessHandle>,
    output_read: AtomicBool,
}

impl TaskEntry {
    fn snapshot(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    fn is_terminal(&self) -> bool {
        self.status.borrow().state.is_terminal()
    }

    /// Apply a transition atomically; returns whether it took effect
    fn transition(&self, next: TaskState, exit_code: Option<i32>) -> bool {
        self.status
            .send_if_modified(|status| status.transition(next, exit_code))
    }

    /// Wait until terminal or `timeout`; `None` on timeout
    async fn wait_terminal(&self, timeout: Duration) -> Option<TaskStatus> {
        let mut rx = self.status.subscribe();
        let waited = time::timeout(timeout, async {
            match rx.wait_for(|status| status.state.is_terminal()).await {
                Ok(status) => status.clone(),
                Err(_) => self.snapshot(),
            }
        })
        .await;
        waited.ok()
    }
}

/// Owner of all task state
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
    lifecycle: Arc<ContainerLifecycle>,
    config: RegistryConfig,
}

impl TaskRegistry {
    pub fn new(lifecycle: Arc<ContainerLifecycle>, config: RegistryConfig) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            lifecycle,
            config,
        }
    }

    async fn entry(&self, task_id: &str) -> Result<Arc<TaskEntry>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownTask(task_id.to_string()))
    }

    /// Register and launch a materialized script
    pub async fn dispatch(
        self: &Arc<Self>,
        script: ExecutionScript,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome> {
        let task_id = script.task_id.clone();
        let (status, _) = watch::channel(TaskStatus::pending(&task_id, options.background));
        let entry = Arc::new(TaskEntry {
            script,
            status,
            handle: OnceLock::new(),
            output_read: AtomicBool::new(false),
        });

        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(SandboxError::InvalidRequest(format!(
                    "task id {} already registered",
                    task_id
                )));
            }
            tasks.insert(task_id.clone(), entry.clone());
        }

        let handle = match self.lifecycle.exec_in_container(&entry.script).await {
            Ok(handle) => handle,
            Err(e) => {
                // Never started: roll the registration back
                warn!("Task {} failed to launch: {}", task_id, e);
                self.tasks.write().await.remove(&task_id);
                return Err(e);
            }
        };

        let _ = entry.handle.set(handle.clone());
        entry.transition(TaskState::Running, None);
        info!(
            "Task {} running (pid {}, background: {})",
            task_id, handle.pid, options.background
        );

        tokio::spawn(self.clone().supervise(entry.clone(), handle, options.kill_after));

        if options.background {
            return Ok(DispatchOutcome {
                task_id,
                status: entry.snapshot(),
                output: None,
                timed_out: false,
            });
        }

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        match entry.wait_terminal(timeout).await {
            Some(status) => {
                let output = self.read_output(&entry, None).await?;
                entry.output_read.store(true, Ordering::SeqCst);
                Ok(DispatchOutcome {
                    task_id,
                    status,
                    output: Some(output),
                    timed_out: false,
                })
            }
            None => {
                debug!("Task {} still running after {:?}", task_id, timeout);
                Ok(DispatchOutcome {
                    task_id,
                    status: entry.snapshot(),
                    output: Some(self.read_output(&entry, None).await?),
                    timed_out: true,
                })
            }
        }
    }

    /// Poll for completion until the task reaches a terminal state
    async fn supervise(
        self: Arc<Self>,
        entry: Arc<TaskEntry>,
        handle: ProcessHandle,
        kill_after: Option<Duration>,
    ) {
        let mut interval = time::interval(self.config.poll_interval);
        let deadline = kill_after.map(|limit| time::Instant::now() + limit);
        let liveness_every = self.config.liveness_every.max(1);
        let mut deadline_hit = false;
        let mut polls: u32 = 0;

        loop {
            interval.tick().await;
            if entry.is_terminal() {
                break;
            }

            if let Some(code) = handle.exit_code().await {
                self.finish(&entry, Some(code), deadline_hit);
                break;
            }

            if let Some(deadline) = deadline {
                if !deadline_hit && time::Instant::now() >= deadline {
                    warn!(
                        "Task {} exceeded its runtime limit; killing",
                        handle.task_id
                    );
                    deadline_hit = true;
                    if let Err(e) = self
                        .lifecycle
                        .signal_process(handle.pid, KillSignal::Kill)
                        .await
                    {
                        warn!("Failed to kill task {}: {}", handle.task_id, e);
                    }
                }
            }

            polls = polls.wrapping_add(1);
            if polls % liveness_every != 0 {
                continue;
            }

            match self.lifecycle.process_alive(handle.pid).await {
                Ok(true) => {}
                Ok(false) => {
                    // The code file is written just before the group exits
                    let code = handle.exit_code().await;
                    self.finish(&entry, code, deadline_hit);
                    break;
                }
                Err(e) => debug!("Liveness check for task {} failed: {}", handle.task_id, e),
            }
        }
    }

    fn finish(&self, entry: &TaskEntry, exit_code: Option<i32>, deadline_hit: bool) {
        let kill_requested = entry.status.borrow().kill_requested.is_some();
        let (state, code) = match exit_code {
            _ if deadline_hit => (TaskState::TimedOut, None),
            Some(code) if kill_requested && code != 0 => (TaskState::Killed, None),
            Some(code) => (TaskState::from_exit_code(code), Some(code)),
            None => (TaskState::Killed, None),
        };

        if entry.transition(state, code) {
            info!(
                "Task {} finished: {} (exit code {:?})",
                entry.script.task_id, state, code
            );
        }
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.entry(task_id).await?.snapshot())
    }

    /// Accumulated output; `tail` keeps only the last N lines
    pub async fn output(&self, task_id: &str, tail: Option<usize>) -> Result<String> {
        let entry = self.entry(task_id).await?;
        let terminal = entry.is_terminal();
        let output = self.read_output(&entry, tail).await?;
        if terminal {
            entry.output_read.store(true, Ordering::SeqCst);
        }
        Ok(output)
    }

    async fn read_output(&self, entry: &TaskEntry, tail: Option<usize>) -> Result<String> {
        let Some(handle) = entry.handle.get() else {
            return Ok(String::new());
        };

        let bytes = match tokio::fs::read(&handle.output_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();

        Ok(match tail {
            Some(lines) => tail_lines(&text, lines),
            None => text,
        })
    }

    /// Signal a task; terminal tasks are reported unchanged
    pub async fn kill(
        &self,
        task_id: &str,
        signal: KillSignal,
        escalate_after: Option<Duration>,
    ) -> Result<KillOutcome> {
        let entry = self.entry(task_id).await?;
        if entry.is_terminal() {
            return Ok(KillOutcome {
                task_id: task_id.to_string(),
                status: entry.snapshot(),
                signal_sent: false,
                escalated: false,
            });
        }

        let handle = entry.handle.get().cloned().ok_or_else(|| SandboxError::KillFailed {
            task_id: task_id.to_string(),
            details: "task has not started yet".to_string(),
        })?;

        entry.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            status.kill_requested = Some(signal);
            true
        });

        info!("Sending {} to task {} (pid {})", signal, task_id, handle.pid);
        let delivered = match self.lifecycle.signal_process(handle.pid, signal).await {
            Ok(delivered) => delivered,
            Err(e) => {
                if entry.is_terminal() {
                    false
                } else {
                    return Err(SandboxError::KillFailed {
                        task_id: task_id.to_string(),
                        details: e.to_string(),
                    });
                }
            }
        };

        if !delivered {
            // Group already gone; the supervisor records the exit shortly
            let settle = self.config.poll_interval * (self.config.liveness_every.max(1) + 2);
            if entry.wait_terminal(settle).await.is_none() {
                return Err(SandboxError::KillFailed {
                    task_id: task_id.to_string(),
                    details: format!("process group {} not found", handle.pid),
                });
            }
        }

        let mut escalated = false;
        if let Some(grace) = escalate_after {
            if signal != KillSignal::Kill && entry.wait_terminal(grace).await.is_none() {
                warn!(
                    "Task {} still running {:?} after {}; sending KILL",
                    task_id, grace, signal
                );
                self.lifecycle
                    .signal_process(handle.pid, KillSignal::Kill)
                    .await
                    .map_err(|e| SandboxError::KillFailed {
                        task_id: task_id.to_string(),
                        details: e.to_string(),
                    })?;
                escalated = true;
            }
        }

        Ok(KillOutcome {
            task_id: task_id.to_string(),
            status: entry.snapshot(),
            signal_sent: delivered,
            escalated,
        })
    }

    /// Wait for a task to finish; `ExecutionTimeout` leaves it running
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Result<TaskStatus> {
        let entry = self.entry(task_id).await?;
        entry
            .wait_terminal(timeout)
            .await
            .ok_or_else(|| SandboxError::ExecutionTimeout {
                task_id: task_id.to_string(),
                seconds: timeout.as_secs(),
            })
    }

    /// Known task ids, oldest first, optionally with their status
    pub async fn list(&self, include_status: bool) -> Vec<TaskListEntry> {
        let tasks = self.tasks.read().await;
        let mut entries: Vec<(chrono::DateTime<Utc>, TaskListEntry)> = tasks
            .iter()
            .map(|(id, entry)| {
                let status = entry.snapshot();
                (
                    status.created_at,
                    TaskListEntry {
                        task_id: id.clone(),
                        status: include_status.then_some(status),
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.task_id.cmp(&b.1.task_id)));
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Drop terminal tasks past their retention and delete their files
    pub async fn prune(&self) -> usize {
        let now = Utc::now();

        let removed: Vec<Arc<TaskEntry>> = {
            let mut tasks = self.tasks.write().await;
            let expired: Vec<String> = tasks
                .iter()
                .filter(|(_, entry)| {
                    let status = entry.snapshot();
                    let Some(ended_at) = status.ended_at else {
                        return false;
                    };
                    if !status.state.is_terminal() {
                        return false;
                    }
                    let age = now
                        .signed_duration_since(ended_at)
                        .to_std()
                        .unwrap_or_default();
                    (entry.output_read.load(Ordering::SeqCst) && age >= self.config.read_grace)
                        || age >= self.config.retention
                })
                .map(|(id, _)| id.clone())
                .collect();

            expired
                .iter()
                .filter_map(|id| tasks.remove(id))
                .collect()
        };

        for entry in &removed {
            remove_quietly(&entry.script.host_path).await;
            if let Some(handle) = entry.handle.get() {
                for path in handle.files() {
                    remove_quietly(path).await;
                }
            }
        }

        if !removed.is_empty() {
            info!("Pruned {} finished tasks", removed.len());
        }
        removed.len()
    }

    /// Periodically prune until the returned handle is aborted
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.prune_interval;
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.prune().await;
            }
        })
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Last `lines` lines of `text`, keeping a trailing newline if present
pub fn tail_lines(text: &str, lines: usize) -> String {
    if lines == 0 {
        return String::new();
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    let start = body
        .rmatch_indices('\n')
        .nth(lines - 1)
        .map(|(index, _)| index + 1)
        .unwrap_or(0);
    text[start..].to_string()
}
