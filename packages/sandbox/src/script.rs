// ABOUTME: Script materializer turning command strings into executable workspace scripts
// ABOUTME: Commands always travel through a file so their quoting is never re-split into argv

use crate::env::EnvironmentSet;
use crate::error::{Result, SandboxError};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const INTERPRETER: &str = "#!/usr/bin/env bash";

/// Owner-only: scripts carry exported environment values
const SCRIPT_MODE: u32 = 0o700;

/// One materialized command
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionScript {
    pub task_id: String,
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(skip)]
    pub env: EnvironmentSet,
    pub command: String,
    /// Normalized workspace-relative directory
    pub working_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Per-dispatch script options
#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    pub working_dir: Option<String>,
    /// Layered over the file environment
    pub extra_env: EnvironmentSet,
}

/// Single-quote a value for POSIX shells
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct ScriptMaterializer {
    workspace: Workspace,
}

impl ScriptMaterializer {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn script_path(&self, task_id: &str) -> PathBuf {
        self.workspace
            .scripts_dir()
            .join(format!("task_{}.sh", task_id))
    }

    /// Script text: interpreter, exports, optional cd, then the command verbatim
    pub fn render(command: &str, env: &EnvironmentSet, working_dir: Option<&Path>) -> String {
        let mut script = String::with_capacity(command.len() + 64 * (env.len() + 2));
        script.push_str(INTERPRETER);
        script.push('\n');

        for (name, value) in env.iter() {
            script.push_str(&format!("export {}={}\n", name, shell_quote(value)));
        }

        if let Some(dir) = working_dir {
            script.push_str(&format!(
                "cd -- {} || exit 1\n",
                shell_quote(&dir.to_string_lossy())
            ));
        }

        script.push_str(command);
        if !command.ends_with('\n') {
            script.push('\n');
        }
        script
    }

    /// Write the script for `task_id` into the scripts directory, executable by its owner only
    pub async fn materialize(
        &self,
        task_id: &str,
        command: &str,
        env: &EnvironmentSet,
        options: &ScriptOptions,
    ) -> Result<ExecutionScript> {
        if task_id.is_empty()
            || !task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SandboxError::InvalidRequest(format!(
                "task id {:?} is not usable as a file name",
                task_id
            )));
        }

        let working_dir = match options.working_dir.as_deref() {
            Some(dir) => Some(self.workspace.normalize_relative(dir)?),
            None => None,
        };
        let container_dir = working_dir
            .as_ref()
            .map(|dir| self.workspace.container_root().join(dir));

        let env = env.merged(&options.extra_env);
        let body = Self::render(command, &env, container_dir.as_deref());

        let host_path = self.script_path(task_id);
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&host_path, body).await?;
        tokio::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(SCRIPT_MODE)).await?;

        let container_path = self.workspace.to_container_path(&host_path)?;
        debug!(
            "Materialized script for task {} at {}",
            task_id,
            host_path.display()
        );

        Ok(ExecutionScript {
            task_id: task_id.to_string(),
            host_path,
            container_path,
            env,
            command: command.to_string(),
            working_dir,
            created_at: Utc::now(),
        })
    }

    /// Delete a script file; a missing file is not an error
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.script_path(task_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every leftover `task_*.sh`, returning how many were removed
    pub async fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(self.workspace.scripts_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("task_") && name.ends_with(".sh") {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}
