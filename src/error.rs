//! 统一错误处理
//!
//! 提供 `OrchestratorError` 枚举覆盖整个编排流程的错误分类，
//! 并映射到 CLI 退出码

use std::path::PathBuf;
use thiserror::Error;

/// 编排错误类型
///
/// 分类：配置 / 迁移 / 编排 / 验证 / 回滚，外加锁与底层 I/O。
/// 每个变体携带足够的上下文（路径、服务名、尝试次数）供上层决定
/// 隔离、重试还是升级。
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// 状态检查自身失败（I/O 错误不得被当作 Absent 吞掉）
    #[error("Inspection of environment '{environment}' failed: {source}")]
    InspectionFailed {
        environment: String,
        #[source]
        source: std::io::Error,
    },

    /// 配置不完整，列出缺失的键
    #[error("Configuration incomplete, missing required keys: {}", missing.join(", "))]
    ConfigIncomplete { missing: Vec<String> },

    /// 必需工件的迁移失败
    #[error("Migration of required artifact '{artifact}' failed: {reason}")]
    MigrationBlocked { artifact: String, reason: String },

    /// 服务依赖图存在环
    #[error("Service dependency cycle involving: {}", services.join(", "))]
    DependencyCycle { services: Vec<String> },

    /// 服务注册表自身不合法（重名、未知依赖）
    #[error("Invalid service registry: {reason}")]
    InvalidServiceRegistry { reason: String },

    /// 服务在重试耗尽后仍未就绪
    #[error("Service '{service}' failed to start after {attempts} attempts: {reason}")]
    ServiceStartFailed {
        service: String,
        attempts: u32,
        reason: String,
    },

    /// 健康检查返回明确的 unhealthy（终态，重试无意义）
    #[error("Service '{service}' reported unhealthy")]
    ServiceUnhealthy { service: String },

    /// 健康等待超时
    #[error("Service '{service}' did not become healthy within {timeout_secs}s")]
    HealthTimeout { service: String, timeout_secs: u64 },

    /// 回滚失败，需要人工介入
    #[error("Rollback failed: {reason}; manual operator intervention required")]
    RollbackFailed { reason: String },

    /// 环境已被另一次编排运行锁定
    #[error("Environment '{environment}' is locked by another orchestration run")]
    EnvironmentLocked { environment: String },

    /// 无可用快照
    #[error("No snapshot available for environment '{environment}'")]
    NoSnapshot { environment: String },

    /// 快照恢复前校验失败
    #[error("Snapshot '{id}' verification failed: {reason}")]
    SnapshotCorrupt { id: String, reason: String },

    /// 运行被操作员取消
    #[error("Orchestration cancelled")]
    Cancelled,

    /// 外部命令执行失败
    #[error("Command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// 底层 I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 清单或配置文件解析失败
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl OrchestratorError {
    /// 映射到 CLI 退出码
    ///
    /// 0 成功；1 配置不完整；2 必需工件迁移失败；3 服务启动失败；
    /// 4 回滚失败；5 环境被锁定；其余错误统一 10。
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::ConfigIncomplete { .. } => 1,
            OrchestratorError::MigrationBlocked { .. } => 2,
            OrchestratorError::ServiceStartFailed { .. }
            | OrchestratorError::ServiceUnhealthy { .. }
            | OrchestratorError::HealthTimeout { .. } => 3,
            OrchestratorError::RollbackFailed { .. } => 4,
            OrchestratorError::EnvironmentLocked { .. } => 5,
            _ => 10,
        }
    }
}

/// 编排结果别名
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            OrchestratorError::ConfigIncomplete {
                missing: vec!["DB_PASSWORD".into()]
            }
            .exit_code(),
            1
        );
        assert_eq!(
            OrchestratorError::MigrationBlocked {
                artifact: "db".into(),
                reason: "checksum mismatch".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            OrchestratorError::ServiceStartFailed {
                service: "api".into(),
                attempts: 3,
                reason: "timeout".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            OrchestratorError::RollbackFailed {
                reason: "restore failed".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            OrchestratorError::EnvironmentLocked {
                environment: "dev".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(OrchestratorError::Cancelled.exit_code(), 10);
    }

    #[test]
    fn test_missing_keys_in_message() {
        let err = OrchestratorError::ConfigIncomplete {
            missing: vec!["DB_PASSWORD".into(), "JWT_SECRET".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("DB_PASSWORD"));
        assert!(msg.contains("JWT_SECRET"));
    }
}
