// ABOUTME: Docker CLI wrapper for building sandbox images
// ABOUTME: Shells out to `docker build` so layered Dockerfiles build exactly as they do by hand

use crate::providers::{ImageBuild, ProviderError, Result};
use tokio::process::Command;
use tracing::{debug, info};

/// Number of trailing build-output lines kept in error messages
const BUILD_ERROR_TAIL_LINES: usize = 40;

/// Assemble the argument list for `docker build`
pub fn build_args(build: &ImageBuild) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--progress=plain".to_string(),
        "-t".to_string(),
        build.tag.clone(),
        "-f".to_string(),
        build.dockerfile.display().to_string(),
    ];

    for (key, value) in &build.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (key, value) in &build.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(build.context.display().to_string());
    args
}

/// Build a Docker image, failing with the tail of the build log
pub async fn build_docker_image(build: &ImageBuild) -> Result<()> {
    if !build.dockerfile.exists() {
        return Err(ProviderError::ImageError(format!(
            "Dockerfile not found: {}",
            build.dockerfile.display()
        )));
    }

    info!(
        "Building image {} from {}",
        build.tag,
        build.dockerfile.display()
    );

    let args = build_args(build);
    debug!("docker {}", args.join(" "));

    let output = Command::new("docker")
        .args(&args)
        .output()
        .await
        .map_err(|e| ProviderError::ImageError(format!("Failed to run docker build: {}", e)))?;

    if !output.status.success() {
        // --progress=plain writes the build log to stderr
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let start = lines.len().saturating_sub(BUILD_ERROR_TAIL_LINES);
        return Err(ProviderError::ImageError(format!(
            "docker build exited with {}: {}",
            output.status,
            lines[start..].join("\n")
        )));
    }

    info!("Built image {}", build.tag);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_args_layout() {
        let build = ImageBuild {
            dockerfile: PathBuf::from("/ctx/Dockerfile"),
            context: PathBuf::from("/ctx"),
            tag: "shellbox-runner".to_string(),
            build_args: vec![("BASE_IMAGE".to_string(), "shellbox-base".to_string())],
            labels: vec![("shellbox.managed".to_string(), "true".to_string())],
        };

        let args = build_args(&build);
        assert_eq!(&args[..6], &["build", "--progress=plain", "-t", "shellbox-runner", "-f", "/ctx/Dockerfile"]);
        assert!(args.contains(&"BASE_IMAGE=shellbox-base".to_string()));
        assert!(args.contains(&"shellbox.managed=true".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/ctx"));
    }

    #[tokio::test]
    async fn test_missing_dockerfile_is_rejected() {
        let build = ImageBuild {
            dockerfile: PathBuf::from("/nonexistent/Dockerfile"),
            context: PathBuf::from("/nonexistent"),
            tag: "shellbox-test".to_string(),
            build_args: vec![],
            labels: vec![],
        };

        let err = build_docker_image(&build).await.unwrap_err();
        assert!(err.to_string().contains("Dockerfile not found"));
    }
}
