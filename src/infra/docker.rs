//! Container runtime adapter
//!
//! All container operations go through the `ContainerRuntime` trait so the
//! orchestrator can be exercised against a mock runtime. The production
//! implementation shells out to the `docker` CLI.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::service::ServiceSpec;
use crate::error::{OrchestratorError, Result};
use crate::infra::command::CommandRunner;

/// Observed container state, as reported by the runtime
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerState {
    /// No container under that name
    Missing,
    /// Running, with the runtime's own health status when one is declared
    /// ("healthy", "starting", "unhealthy", or None without a healthcheck)
    Running { health: Option<String> },
    /// Exists but not running
    Stopped,
}

/// 容器运行时接口
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 查询容器状态
    async fn container_state(&self, name: &str) -> Result<ContainerState>;

    /// 停止并移除同名容器（不存在时为 no-op，保证幂等替换）
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// 以给定名字启动服务容器
    async fn start_service(
        &self,
        name: &str,
        spec: &ServiceSpec,
        env: &HashMap<String, String>,
        data_root: &std::path::Path,
    ) -> Result<()>;
}

/// Production runtime: the `docker` CLI
pub struct DockerCli {
    command_timeout: Duration,
    start_timeout: Duration,
    cancel: CancellationToken,
}

impl DockerCli {
    pub fn new(command_timeout: Duration, start_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            command_timeout,
            start_timeout,
            cancel,
        }
    }

    fn command_error(command: &str, e: impl std::fmt::Display) -> OrchestratorError {
        OrchestratorError::CommandFailed {
            command: command.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn container_state(&self, name: &str) -> Result<ContainerState> {
        // {{.State.Status}} + health in one inspect call
        let output = CommandRunner::run_simple(
            "docker",
            &[
                "inspect",
                "--format",
                "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}",
                name,
            ],
            self.command_timeout,
        )
        .await
        .map_err(|e| Self::command_error("docker inspect", e))?;

        if !output.status.success() {
            // docker inspect exits nonzero for unknown names
            return Ok(ContainerState::Missing);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim();
        let (status, health) = line.split_once('|').unwrap_or((line, ""));
        match status {
            "running" => Ok(ContainerState::Running {
                health: if health.is_empty() {
                    None
                } else {
                    Some(health.to_string())
                },
            }),
            "" => Ok(ContainerState::Missing),
            _ => Ok(ContainerState::Stopped),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        if self.container_state(name).await? == ContainerState::Missing {
            return Ok(());
        }
        let output = CommandRunner::run_simple(
            "docker",
            &["rm", "-f", name],
            self.command_timeout,
        )
        .await
        .map_err(|e| Self::command_error("docker rm", e))?;

        if !output.status.success() {
            return Err(Self::command_error(
                "docker rm",
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }

    async fn start_service(
        &self,
        name: &str,
        spec: &ServiceSpec,
        env: &HashMap<String, String>,
        data_root: &std::path::Path,
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--restart".into(),
            "unless-stopped".into(),
        ];

        for port in &spec.exposed_ports {
            args.push("-p".into());
            args.push(port.clone());
        }

        if let Some(ref volume) = spec.data_volume {
            let host_path: PathBuf = data_root.join(&volume.subdir);
            tokio::fs::create_dir_all(&host_path).await?;
            args.push("-v".into());
            args.push(format!("{}:/data/{}", host_path.display(), volume.subdir));
        }

        for key in &spec.required_env_keys {
            if let Some(value) = env.get(key) {
                args.push("-e".into());
                args.push(format!("{}={}", key, value));
            }
        }

        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let label = format!("docker run {}", name);
        let result = CommandRunner::run_logged(
            "docker",
            &arg_refs,
            None,
            &label,
            self.cancel.clone(),
            self.start_timeout,
        )
        .await
        .map_err(|e| match e {
            crate::infra::command::CommandError::Cancelled => OrchestratorError::Cancelled,
            other => Self::command_error("docker run", other),
        })?;

        if !result.status.success() {
            return Err(Self::command_error(
                "docker run",
                format!(
                    "exit code {}",
                    result.status.code().unwrap_or(-1)
                ),
            ));
        }
        Ok(())
    }
}
