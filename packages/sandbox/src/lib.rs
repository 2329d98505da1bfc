// ABOUTME: Sandbox execution engine running shell commands inside one managed container
// ABOUTME: Exposes the environment loader, script materializer, container lifecycle, task registry, watchdog, and metrics

pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod docker_cli;
pub mod engine;
pub mod env;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod providers;
pub mod registry;
pub mod script;
pub mod task;
pub mod watchdog;
pub mod workspace;

pub use config::{ConfigError, ContainerSettings, EngineConfig, RegistryConfig, WatchdogConfig};
pub use engine::{CommandRequest, EnvironmentSummary, SandboxEngine, ToolRequest, ToolResponse};
pub use env::{EnvironmentSet, LoadedEnvironment};
pub use error::{Result, SandboxError};
pub use lifecycle::{ContainerLifecycle, ContainerState, ProcessHandle, SandboxContainer};
pub use metrics::{MetricSnapshot, MetricsCollector, ToolStats};
pub use providers::{DockerProvider, Provider, ProviderError};
pub use registry::{DispatchOptions, DispatchOutcome, KillOutcome, TaskListEntry, TaskRegistry};
pub use script::{ExecutionScript, ScriptMaterializer, ScriptOptions};
pub use task::{KillSignal, TaskState, TaskStatus};
pub use watchdog::{ProbeTracker, Watchdog, WatchdogEvent};
pub use workspace::Workspace;
