// ABOUTME: Environment variable names and fixed workspace locations
// ABOUTME: Centralized definitions shared by configuration, layout, and the server binary

// Workspace & environment file
pub const SHELLBOX_WORKSPACE_DIR: &str = "SHELLBOX_WORKSPACE_DIR";
pub const SHELLBOX_ENV_FILE: &str = "SHELLBOX_ENV_FILE";

// Images & container
pub const SHELLBOX_IMAGE_NAME: &str = "SHELLBOX_IMAGE_NAME";
pub const SHELLBOX_BASE_IMAGE_NAME: &str = "SHELLBOX_BASE_IMAGE_NAME";
pub const SHELLBOX_CONTAINER_NAME: &str = "SHELLBOX_CONTAINER_NAME";
pub const SHELLBOX_DOCKERFILE_DIR: &str = "SHELLBOX_DOCKERFILE_DIR";
pub const SHELLBOX_EXEC_USER: &str = "SHELLBOX_EXEC_USER";
pub const SHELLBOX_MEMORY_MB: &str = "SHELLBOX_MEMORY_MB";
pub const SHELLBOX_CPUS: &str = "SHELLBOX_CPUS";

// Timeouts & retry policy
pub const SHELLBOX_DEFAULT_TIMEOUT_SECONDS: &str = "SHELLBOX_DEFAULT_TIMEOUT_SECONDS";
pub const SHELLBOX_READINESS_TIMEOUT_SECONDS: &str = "SHELLBOX_READINESS_TIMEOUT_SECONDS";
pub const SHELLBOX_EXEC_RETRIES: &str = "SHELLBOX_EXEC_RETRIES";

// Watchdog
pub const SHELLBOX_WATCHDOG_INTERVAL_SECONDS: &str = "SHELLBOX_WATCHDOG_INTERVAL_SECONDS";
pub const SHELLBOX_WATCHDOG_FAILURE_THRESHOLD: &str = "SHELLBOX_WATCHDOG_FAILURE_THRESHOLD";
pub const SHELLBOX_WATCHDOG_MAX_RESTARTS: &str = "SHELLBOX_WATCHDOG_MAX_RESTARTS";

// Task retention
pub const SHELLBOX_TASK_RETENTION_SECONDS: &str = "SHELLBOX_TASK_RETENTION_SECONDS";

/// Where the workspace is mounted inside the container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Agent-owned directory at the workspace root
pub const AGENT_DIR: &str = ".agent";
pub const SCRIPTS_DIR: &str = "tmp_scripts";
pub const TASK_LOGS_DIR: &str = "task_logs";
pub const DIAGNOSTICS_DIR: &str = "container";
pub const READINESS_MARKER: &str = "sandbox_ready.json";

/// Container labels
pub const LABEL_MANAGED: &str = "shellbox.managed";
pub const LABEL_WORKSPACE: &str = "shellbox.workspace";
