//! 命令执行器
//!
//! 提供统一的外部命令执行接口，支持：
//! - 实时日志流式输出（stdout/stderr 按行写入 tracing）
//! - 超时控制
//! - 取消支持

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(std::io::Error),

    #[error("Command timed out")]
    Timeout,

    #[error("Command was cancelled")]
    Cancelled,

    #[error("Failed to wait for command: {0}")]
    WaitFailed(std::io::Error),
}

/// 命令执行结果
pub struct CommandResult {
    /// 退出状态
    pub status: ExitStatus,
    /// 是否因超时而终止
    pub timed_out: bool,
}

impl CommandRunner {
    /// 执行命令并将输出逐行写入 tracing
    ///
    /// `label` 标识日志来源（如 "docker pull api"），用于区分并行
    /// 启动的多个服务的输出
    pub async fn run_logged(
        program: &str,
        args: &[&str],
        work_dir: Option<&Path>,
        label: &str,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = work_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(CommandError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_label = label.to_string();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(source = %stdout_label, stream = "stdout", "{}", line);
                }
            }
        });

        let stderr_label = label.to_string();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(source = %stderr_label, stream = "stderr", "{}", line);
                }
            }
        });

        // 等待命令完成，支持超时和取消
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(source = %label, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(source = %label, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                let status = child.wait().await.map_err(CommandError::WaitFailed)?;
                Ok(CommandResult { status, timed_out: true })
            }
            status = child.wait() => {
                let status = status.map_err(CommandError::WaitFailed)?;
                Ok(CommandResult { status, timed_out: false })
            }
        };

        // 等待日志读取完成
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        result
    }

    /// 执行简单命令（捕获输出，无流式日志）
    ///
    /// 用于短命令（如 docker inspect）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program).args(args).output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout)
            }
        }
    }
}
