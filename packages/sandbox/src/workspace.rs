// ABOUTME: Host and container views of the mounted workspace directory
// ABOUTME: Resolves script, log, marker, and diagnostics paths and rejects escaping relative paths

use crate::constants::{
    AGENT_DIR, CONTAINER_WORKSPACE, DIAGNOSTICS_DIR, READINESS_MARKER, SCRIPTS_DIR, TASK_LOGS_DIR,
};
use crate::error::{Result, SandboxError};
use std::path::{Component, Path, PathBuf};

/// Workspace root as seen from the host and from inside the container
#[derive(Debug, Clone)]
pub struct Workspace {
    host_root: PathBuf,
    container_root: PathBuf,
}

impl Workspace {
    /// Workspace mounted at the standard in-container location
    pub fn new(host_root: impl Into<PathBuf>) -> Self {
        Self::with_container_root(host_root, CONTAINER_WORKSPACE)
    }

    pub fn with_container_root(
        host_root: impl Into<PathBuf>,
        container_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host_root: host_root.into(),
            container_root: container_root.into(),
        }
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn container_root(&self) -> &Path {
        &self.container_root
    }

    /// Create the agent directories on the host side
    pub fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(self.scripts_dir())?;
        std::fs::create_dir_all(self.task_logs_dir())?;
        std::fs::create_dir_all(self.diagnostics_dir())?;
        Ok(())
    }

    pub fn agent_dir(&self) -> PathBuf {
        self.host_root.join(AGENT_DIR)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.agent_dir().join(SCRIPTS_DIR)
    }

    pub fn task_logs_dir(&self) -> PathBuf {
        self.agent_dir().join(TASK_LOGS_DIR)
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.agent_dir().join(DIAGNOSTICS_DIR)
    }

    pub fn readiness_marker(&self) -> PathBuf {
        self.agent_dir().join(READINESS_MARKER)
    }

    /// Translate a host path under the workspace into its in-container path
    pub fn to_container_path(&self, host_path: &Path) -> Result<PathBuf> {
        let relative = host_path.strip_prefix(&self.host_root).map_err(|_| {
            SandboxError::InvalidPath(format!(
                "{} is outside the workspace {}",
                host_path.display(),
                self.host_root.display()
            ))
        })?;
        Ok(self.container_root.join(relative))
    }

    /// Normalize a caller-supplied workspace-relative path
    ///
    /// Absolute paths and paths that climb above the root are rejected.
    /// An empty or `.` path normalizes to an empty relative path.
    pub fn normalize_relative(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let mut normalized = PathBuf::new();

        for component in path.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::InvalidPath(format!(
                            "{:?} escapes the workspace",
                            relative
                        )));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::InvalidPath(format!(
                        "{:?} must be relative to the workspace",
                        relative
                    )));
                }
            }
        }

        Ok(normalized)
    }
}
