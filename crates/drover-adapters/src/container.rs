//! Docker container clone manager.
//!
//! Wraps a [`WorktreeCloneManager`] clone with a sandboxed container:
//! the worktree contents are copied in via a tar pipe over `docker cp`
//! (never bind-mounted), so an agent running inside the container
//! cannot touch the host filesystem outside its copy. Results are
//! copied back out the same way before the worktree itself is handed
//! to the lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use drover_core::adapters::{AdapterError, AdapterResult, CloneManager};
use tokio::process::Command;

use crate::git::WorktreeCloneManager;

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub extra_flags: Vec<String>,
}

/// Clone manager that materializes a host worktree per task and mirrors
/// it into a freshly created, non-bind-mounted container.
pub struct ContainerCloneManager {
    config: ContainerConfig,
    worktrees: WorktreeCloneManager,
    containers: StdMutex<std::collections::HashMap<String, ContainerHandle>>,
}

struct ContainerHandle {
    container_id: String,
    host_path: PathBuf,
}

impl ContainerCloneManager {
    pub fn new(config: ContainerConfig, worktrees: WorktreeCloneManager) -> Self {
        ContainerCloneManager { config, worktrees, containers: StdMutex::new(std::collections::HashMap::new()) }
    }

    fn container_name(task_id: &str) -> String {
        let sanitize = |s: &str| -> String {
            s.chars().map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' }).collect()
        };
        format!("drover-{}", sanitize(task_id))
    }

    async fn copy_into_container(container_id: &str, host_path: &Path) -> AdapterResult<()> {
        let mkdir = Command::new("docker")
            .args(["exec", container_id, "mkdir", "-p", "/workspace"])
            .output()
            .await
            .map_err(|e| AdapterError::Clone(format!("docker exec mkdir: {e}")))?;
        if !mkdir.status.success() {
            return Err(AdapterError::Clone(format!(
                "docker exec mkdir -p /workspace failed: {}",
                String::from_utf8_lossy(&mkdir.stderr)
            )));
        }

        let tar_cmd = format!(
            "tar -C {} --exclude='.git' -cf - . | docker cp - {}:/workspace",
            shell_escape(host_path),
            container_id,
        );
        let output = Command::new("sh")
            .args(["-c", &tar_cmd])
            .output()
            .await
            .map_err(|e| AdapterError::Clone(format!("copy into container: {e}")))?;
        if !output.status.success() {
            return Err(AdapterError::Clone(format!(
                "copy into container failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn copy_from_container(container_id: &str, host_path: &Path) -> AdapterResult<()> {
        let tar_cmd = format!(
            "docker cp {}:/workspace/. - | tar -C {} --exclude='.git' -xf -",
            container_id,
            shell_escape(host_path),
        );
        let output = Command::new("sh")
            .args(["-c", &tar_cmd])
            .output()
            .await
            .map_err(|e| AdapterError::Clone(format!("copy from container: {e}")))?;
        if !output.status.success() {
            return Err(AdapterError::Clone(format!(
                "copy from container failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

fn shell_escape(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

#[async_trait]
impl CloneManager for ContainerCloneManager {
    async fn clone_for_task(&self, task_id: &str, repo_root: &Path) -> AdapterResult<PathBuf> {
        let host_path = self.worktrees.clone_for_task(task_id, repo_root).await?;
        let container_name = Self::container_name(task_id);

        let mut args = vec!["create".to_string(), "--name".to_string(), container_name.clone(), "-w".to_string(), "/workspace".to_string()];
        args.extend(self.config.extra_flags.iter().cloned());
        args.push(self.config.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());

        let create = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| AdapterError::Clone(format!("docker create: {e}")))?;
        if !create.status.success() {
            let _ = self.worktrees.cleanup(task_id).await;
            return Err(AdapterError::Clone(format!("docker create failed: {}", String::from_utf8_lossy(&create.stderr))));
        }
        let container_id = String::from_utf8_lossy(&create.stdout).trim().to_string();

        let start = Command::new("docker")
            .args(["start", &container_id])
            .output()
            .await
            .map_err(|e| AdapterError::Clone(format!("docker start: {e}")))?;
        if !start.status.success() {
            let _ = Command::new("docker").args(["rm", "-f", &container_id]).output().await;
            let _ = self.worktrees.cleanup(task_id).await;
            return Err(AdapterError::Clone(format!("docker start failed: {}", String::from_utf8_lossy(&start.stderr))));
        }

        if let Err(e) = Self::copy_into_container(&container_id, &host_path).await {
            let _ = Command::new("docker").args(["rm", "-f", &container_id]).output().await;
            let _ = self.worktrees.cleanup(task_id).await;
            return Err(e);
        }

        self.containers
            .lock()
            .unwrap()
            .insert(task_id.to_string(), ContainerHandle { container_id, host_path: host_path.clone() });

        Ok(PathBuf::from("/workspace"))
    }

    async fn cleanup(&self, task_id: &str) -> AdapterResult<()> {
        let handle = self.containers.lock().unwrap().remove(task_id);
        if let Some(handle) = handle {
            Self::copy_from_container(&handle.container_id, &handle.host_path).await?;
            let rm = Command::new("docker")
                .args(["rm", "-f", &handle.container_id])
                .output()
                .await
                .map_err(|e| AdapterError::Clone(format!("docker rm: {e}")))?;
            if !rm.status.success() && !String::from_utf8_lossy(&rm.stderr).contains("No such container") {
                return Err(AdapterError::Clone(format!("docker rm -f failed: {}", String::from_utf8_lossy(&rm.stderr))));
            }
        }
        self.worktrees.cleanup(task_id).await
    }
}
