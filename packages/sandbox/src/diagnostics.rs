// ABOUTME: Best-effort capture of container state before recovery
// ABOUTME: Writes inspect output, recent logs, process list, and the last script into the workspace

use crate::error::Result;
use crate::providers::Provider;
use crate::workspace::Workspace;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Container log lines kept per capture
pub const LOG_TAIL_LINES: usize = 2000;

/// State fields copied into the summary
const SUMMARY_FIELDS: &[&str] = &[
    "Status",
    "Running",
    "Paused",
    "Restarting",
    "OOMKilled",
    "Dead",
    "ExitCode",
    "Error",
    "StartedAt",
    "FinishedAt",
];

#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub prefix: String,
    pub files: Vec<PathBuf>,
}

/// Inputs describing what to capture
pub struct Capture<'a> {
    pub container_id: Option<&'a str>,
    pub reason: &'a str,
    pub last_script: Option<&'a Path>,
    pub exec_user: Option<String>,
}

pub async fn capture(
    provider: &dyn Provider,
    workspace: &Workspace,
    request: Capture<'_>,
) -> Result<DiagnosticsReport> {
    let dir = workspace.diagnostics_dir();
    tokio::fs::create_dir_all(&dir).await?;

    let short_id: String = request
        .container_id
        .unwrap_or("none")
        .chars()
        .take(12)
        .collect();
    let prefix = format!("diag_{}_{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"), short_id);
    let mut files = Vec::new();

    let inspect = match request.container_id {
        Some(id) => provider
            .inspect_raw(id)
            .await
            .map_err(|e| e.to_string()),
        None => Err("no container id".to_string()),
    };

    let mut summary = format!(
        "reason: {}\ncaptured_at: {}\ncontainer: {}\n",
        request.reason,
        Utc::now().to_rfc3339(),
        request.container_id.unwrap_or("none")
    );
    match &inspect {
        Ok(doc) => summary.push_str(&summarize_state(doc)),
        Err(e) => summary.push_str(&format!("inspect_error: {}\n", e)),
    }
    files.push(write(&dir, &prefix, "summary.txt", &summary).await?);

    let inspect_text = match &inspect {
        Ok(doc) => serde_json::to_string_pretty(doc)?,
        Err(e) => format!("{{\"error\": {}}}", Value::String(e.clone())),
    };
    files.push(write(&dir, &prefix, "inspect.json", &inspect_text).await?);

    if let Some(id) = request.container_id {
        let logs = provider
            .container_logs(id, LOG_TAIL_LINES)
            .await
            .unwrap_or_else(|e| format!("failed to read container logs: {}", e));
        files.push(write(&dir, &prefix, "logs.txt", &logs).await?);

        let processes = match provider
            .exec_command(
                id,
                vec!["ps".to_string(), "auxww".to_string()],
                request.exec_user.clone(),
            )
            .await
        {
            Ok(result) => result.stdout_lossy(),
            Err(e) => format!("failed to list processes: {}", e),
        };
        files.push(write(&dir, &prefix, "processes.txt", &processes).await?);
    }

    if let Some(script) = request.last_script {
        let text = match tokio::fs::read_to_string(script).await {
            Ok(text) => format!("# {}\n{}", script.display(), redact_exports(&text)),
            Err(e) => format!("# {}\nunreadable: {}\n", script.display(), e),
        };
        files.push(write(&dir, &prefix, "last_script.txt", &text).await?);
    }

    info!(
        "Captured {} diagnostics files with prefix {} ({})",
        files.len(),
        prefix,
        request.reason
    );

    Ok(DiagnosticsReport { prefix, files })
}

/// Replace the value of every `export NAME=...` line; the command body is kept
fn redact_exports(script: &str) -> String {
    let mut out = String::with_capacity(script.len());
    for line in script.lines() {
        match line
            .strip_prefix("export ")
            .and_then(|rest| rest.split_once('='))
        {
            Some((name, _)) => out.push_str(&format!("export {}=<redacted>\n", name)),
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

fn summarize_state(doc: &Value) -> String {
    let mut out = String::new();
    let state = doc.get("State");
    for field in SUMMARY_FIELDS {
        let value = state
            .and_then(|s| s.get(*field))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("{}: {}\n", field, value));
    }
    out
}

async fn write(dir: &Path, prefix: &str, suffix: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.join(format!("{}_{}", prefix, suffix));
    if let Err(e) = tokio::fs::write(&path, contents).await {
        warn!("Failed to write diagnostics file {}: {}", path.display(), e);
        return Err(e.into());
    }
    Ok(path)
}
