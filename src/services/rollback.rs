//! 回滚控制器
//!
//! 破坏性阶段失败时自动触发，也可由操作员手动触发。
//! 回滚自身失败是整个系统唯一不再尝试自动恢复的情形，
//! 以 `RollbackFailed` 终态上报，等待人工介入。

use std::collections::HashMap;
use tracing::{error, info};

use crate::config::synthesize;
use crate::domain::service::ServiceSpec;
use crate::error::{OrchestratorError, Result};
use crate::services::backup::BackupManager;
use crate::services::context::OrchestrateContext;
use crate::services::orchestrator::ServiceOrchestrator;

/// 回滚控制器
pub struct RollbackController;

impl RollbackController {
    /// 回滚到最近一个有效快照
    ///
    /// 步骤：停止全部目标服务 → 恢复快照 → 按恢复后的配置重启 →
    /// 健康验证。任一步失败都归入 `RollbackFailed`。
    pub async fn rollback(ctx: &OrchestrateContext, specs: &[ServiceSpec]) -> Result<()> {
        let manifest = BackupManager::latest(ctx)
            .await
            .map_err(Self::as_rollback_failure)?
            .ok_or_else(|| OrchestratorError::NoSnapshot {
                environment: ctx.environment.clone(),
            })?;

        info!(
            environment = %ctx.environment,
            snapshot = %manifest.snapshot.id,
            "Rolling back to snapshot"
        );

        ServiceOrchestrator::stop_all(ctx, specs)
            .await
            .map_err(Self::as_rollback_failure)?;

        BackupManager::restore(ctx, &manifest)
            .await
            .map_err(Self::as_rollback_failure)?;

        // 从恢复后的配置存储重建容器环境变量
        let env = Self::restored_env(ctx).await.map_err(Self::as_rollback_failure)?;

        ServiceOrchestrator::start(ctx, specs, &env)
            .await
            .map_err(Self::as_rollback_failure)?;

        info!(
            environment = %ctx.environment,
            snapshot = %manifest.snapshot.id,
            "Rollback complete, services healthy"
        );
        Ok(())
    }

    async fn restored_env(ctx: &OrchestrateContext) -> Result<HashMap<String, String>> {
        let raw = tokio::fs::read_to_string(&ctx.paths.config_store).await?;
        Ok(synthesize::parse_store(&raw).into_iter().collect())
    }

    fn as_rollback_failure(e: OrchestratorError) -> OrchestratorError {
        error!(error = %e, "Rollback step failed");
        OrchestratorError::RollbackFailed {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::{default_services, HealthStatus};
    use crate::services::test_support::{test_context, ScriptedProbe, ScriptedRuntime};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn seed_healthy_env(ctx: &OrchestrateContext) {
        tokio::fs::create_dir_all(&ctx.paths.config_dir).await.unwrap();
        tokio::fs::write(
            &ctx.paths.config_store,
            b"DB_PASSWORD=pw\nJWT_SECRET=jwt\n",
        )
        .await
        .unwrap();
        let data = ctx.paths.data_dir.join("postgres");
        tokio::fs::create_dir_all(&data).await.unwrap();
        tokio::fs::write(data.join("base.db"), b"known-good").await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_state() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::healthy());
        let ctx = test_context(
            dir.path(),
            runtime.clone(),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        let specs = default_services("dev");
        seed_healthy_env(&ctx).await;

        BackupManager::snapshot(&ctx, &[PathBuf::from("data"), PathBuf::from("config")])
            .await
            .unwrap();

        // 模拟部署中途破坏了数据
        tokio::fs::write(
            ctx.paths.data_dir.join("postgres/base.db"),
            b"half migrated garbage",
        )
        .await
        .unwrap();

        RollbackController::rollback(&ctx, &specs).await.unwrap();

        // 字节级恢复
        let data = tokio::fs::read(ctx.paths.data_dir.join("postgres/base.db"))
            .await
            .unwrap();
        assert_eq!(data, b"known-good");
        // 服务集按依赖序重启
        let order = runtime.start_order();
        assert_eq!(order.len(), specs.len());
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("dev-db") < pos("dev-api"));
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_reports_no_snapshot() {
        let dir = tempdir().unwrap();
        let ctx = test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        let err = RollbackController::rollback(&ctx, &default_services("dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoSnapshot { .. }));
    }

    #[tokio::test]
    async fn test_failed_restart_surfaces_rollback_failed() {
        let dir = tempdir().unwrap();
        // db 永远起不来
        let runtime = Arc::new(ScriptedRuntime::failing_first("dev-db", 99));
        let ctx = test_context(
            dir.path(),
            runtime,
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        seed_healthy_env(&ctx).await;
        BackupManager::snapshot(&ctx, &[PathBuf::from("data"), PathBuf::from("config")])
            .await
            .unwrap();

        let err = RollbackController::rollback(&ctx, &default_services("dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RollbackFailed { .. }));
    }
}
