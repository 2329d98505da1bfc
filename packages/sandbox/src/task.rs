// ABOUTME: Task state model for dispatched script executions
// ABOUTME: Monotonic state transitions, exit code invariants, and named kill signals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Killed | TaskState::TimedOut
        )
    }

    /// Terminal state for a process that reported an exit code
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        }
    }

    fn progress(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Killed => "killed",
            TaskState::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KillSignal {
    #[default]
    Term,
    Kill,
    Int,
    Hup,
}

impl KillSignal {
    /// Name accepted by `kill -s`
    pub fn as_str(self) -> &'static str {
        match self {
            KillSignal::Term => "TERM",
            KillSignal::Kill => "KILL",
            KillSignal::Int => "INT",
            KillSignal::Hup => "HUP",
        }
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KillSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "TERM" | "15" => Ok(KillSignal::Term),
            "KILL" | "9" => Ok(KillSignal::Kill),
            "INT" | "2" => Ok(KillSignal::Int),
            "HUP" | "1" => Ok(KillSignal::Hup),
            _ => Err(format!("unsupported signal: {}", s)),
        }
    }
}

/// Point-in-time view of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub background: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub kill_requested: Option<KillSignal>,
}

impl TaskStatus {
    pub fn pending(task_id: impl Into<String>, background: bool) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Pending,
            running: true,
            exit_code: None,
            background,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            kill_requested: None,
        }
    }

    /// Move to `next`; backward moves and moves out of a terminal state are refused
    ///
    /// The exit code is kept only for succeeded/failed, and those two states
    /// are refused without one.
    pub fn transition(&mut self, next: TaskState, exit_code: Option<i32>) -> bool {
        if self.state.is_terminal() || next.progress() <= self.state.progress() {
            return false;
        }

        let exit_code = match next {
            TaskState::Succeeded | TaskState::Failed => match exit_code {
                Some(code) => Some(code),
                None => return false,
            },
            _ => None,
        };

        let now = Utc::now();
        if next == TaskState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
        }

        self.state = next;
        self.exit_code = exit_code;
        self.running = !next.is_terminal();
        true
    }
}
