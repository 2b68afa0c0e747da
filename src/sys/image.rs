// src/sys/image.rs

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::BackendError;
use crate::sys::command::Program;

/// A `--build-arg` pair. Values may hold credentials and are zeroized on drop.
pub struct BuildArg {
    pub name: String,
    pub value: Zeroizing<String>,
}

impl BuildArg {
    pub fn new(name: impl Into<String>, value: Zeroizing<String>) -> Self {
        Self { name: name.into(), value }
    }
}

/// Builds the shared base image and per-member images with `docker build`.
pub struct ImageBuilder {
    docker: Program,
    build_dir: PathBuf,
    base_tag: String,
}

impl ImageBuilder {
    pub fn new(docker: Program, build_dir: PathBuf, base_tag: String) -> Self {
        Self { docker, build_dir, base_tag }
    }

    pub async fn image_exists(&self, tag: &str) -> Result<bool, BackendError> {
        Ok(self.docker.run(["image", "inspect", tag]).await?.success)
    }

    /// Builds `Dockerfile.base` once; later member builds layer on top of it.
    pub async fn ensure_base(&self) -> Result<(), BackendError> {
        if self.image_exists(&self.base_tag).await? {
            return Ok(());
        }
        let dockerfile = self.build_dir.join("Dockerfile.base");
        if !dockerfile.exists() {
            return Err(BackendError::unavailable(format!(
                "base Dockerfile not found at {:?}",
                dockerfile
            )));
        }
        info!(tag = %self.base_tag, "building base image");
        self.build(&self.base_tag, Some(&dockerfile), &[]).await
    }

    pub async fn build_member(&self, tag: &str, args: &[BuildArg]) -> Result<(), BackendError> {
        self.ensure_base().await?;
        info!(tag, "building member image");
        self.build(tag, None, args).await
    }

    pub async fn remove(&self, tag: &str) -> Result<(), BackendError> {
        let out = self.docker.run(["rmi", tag]).await?;
        if !out.success && !out.stderr.contains("No such image") {
            return Err(BackendError::unavailable(format!(
                "failed to remove image {}: {}",
                tag,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn build(&self, tag: &str, dockerfile: Option<&Path>, args: &[BuildArg]) -> Result<(), BackendError> {
        let mut cmd = self.docker.command();
        cmd.arg("build");
        if let Some(file) = dockerfile {
            cmd.arg("-f").arg(file);
        }
        for arg in args {
            cmd.arg("--build-arg")
                .arg(Zeroizing::new(format!("{}={}", arg.name, arg.value.as_str())).as_str());
        }
        cmd.arg("-t").arg(tag).arg(&self.build_dir);

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::unavailable(format!("failed to spawn docker build: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::unavailable("docker build stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::unavailable("docker build stderr unavailable"))?;

        // Stream both pipes into the log so long builds stay observable.
        let tag_out = tag.to_string();
        let out_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(tag = %tag_out, "[STDOUT] {}", line);
            }
        });

        // BuildKit writes progress to stderr; keep the tail for error reports.
        let tag_err = tag.to_string();
        let err_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(tag = %tag_err, "[STDERR] {}", line);
                tail.push(line);
                if tail.len() > 20 {
                    tail.remove(0);
                }
            }
            tail
        });

        let status = child
            .wait()
            .await
            .map_err(|e| BackendError::unavailable(format!("docker build did not finish: {}", e)))?;
        let _ = out_task.await;
        let tail = err_task.await.unwrap_or_default();

        if !status.success() {
            return Err(BackendError::unavailable(format!(
                "docker build of {} exited with code {}: {}",
                tag,
                status.code().unwrap_or(-1),
                tail.join("\n")
            )));
        }
        Ok(())
    }
}
