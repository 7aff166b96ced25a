//! 部署编排主流程
//!
//! 单个环境从任意状态收敛到 TargetHealthy 的阶段序列：
//!
//! 1. 环境锁
//! 2. StateInspector 归类当前状态
//! 3. 旧版数据迁移（仅当存在未吸收的旧版数据）
//! 4. 配置合成（任何 required-missing 都在此阻断）
//! 5. 快照（任何停止/替换之前）
//! 6. 依赖序启动 + 健康门控
//! 7. 终态验证
//!
//! 破坏性阶段（6 起）失败且已有快照时自动回滚；之前的失败只报告
//! 部分状态，无需回滚。

use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::synthesize;
use crate::domain::migration::MigrationManifest;
use crate::domain::service::{load_services, ServiceSpec};
use crate::domain::snapshot::Snapshot;
use crate::domain::state::DeploymentState;
use crate::error::{OrchestratorError, Result};
use crate::infra::fsutil;
use crate::infra::lock::EnvironmentLock;
use crate::services::backup::BackupManager;
use crate::services::context::OrchestrateContext;
use crate::services::inspector::{ServiceReport, StateInspector};
use crate::services::migrator::{self, DataMigrator};
use crate::services::orchestrator::ServiceOrchestrator;
use crate::services::rollback::RollbackController;

/// 快照覆盖的环境内相对路径
fn snapshot_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("data"), PathBuf::from("config")]
}

/// 加载服务注册表：优先环境内清单，其次内置/环境变量默认
pub async fn load_specs(ctx: &OrchestrateContext) -> Result<Vec<ServiceSpec>> {
    match tokio::fs::read(&ctx.paths.services_manifest).await {
        Ok(bytes) => match serde_json::from_slice::<Vec<ServiceSpec>>(&bytes) {
            Ok(specs) => return Ok(specs),
            Err(e) => {
                warn!(error = %e, "Service manifest unreadable, falling back to defaults");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(load_services(&ctx.environment))
}

/// 执行完整部署编排，幂等
///
/// 返回结束时的部署状态；所有失败以带上下文的类型化错误上抛
pub async fn deploy(ctx: &OrchestrateContext, force_config: bool) -> Result<DeploymentState> {
    let _lock = EnvironmentLock::acquire(&ctx.paths.lock_path, &ctx.environment)?;
    let specs = load_specs(ctx).await?;

    info!(environment = %ctx.environment, services = specs.len(), "=== Deploy started ===");

    // [1/6] 状态归类
    let state = StateInspector::inspect(ctx, &specs).await?;
    info!(environment = %ctx.environment, state = %state, "[1/6] Current state");
    if state == DeploymentState::TargetHealthy {
        info!(environment = %ctx.environment, "Already healthy, nothing to do");
        return Ok(state);
    }
    ctx.check_cancelled()?;

    ensure_layout(ctx, &specs).await?;

    // [2/6] 旧版数据迁移（无损，不删源）
    let categories = migrator::categories_from_specs(&specs);
    let mut migration_manifest = MigrationManifest::load(&ctx.paths.manifest_dir).await?;
    if DataMigrator::has_unabsorbed_legacy(ctx, &categories, &migration_manifest).await? {
        info!(environment = %ctx.environment, "[2/6] Migrating legacy artifacts");
        let records = DataMigrator::migrate(ctx, &categories, &mut migration_manifest).await?;
        info!(records = records.len(), "[2/6] Migration pass complete");
    } else {
        info!("[2/6] No unabsorbed legacy data, skipping migration");
    }
    ctx.check_cancelled()?;

    // [3/6] 配置合成
    let config = synthesize::ensure(&ctx.paths, &specs, force_config).await?;
    info!("[3/6] Configuration complete");
    ctx.check_cancelled()?;

    // [4/6] 破坏性步骤前的快照
    let snapshot = BackupManager::snapshot(ctx, &snapshot_paths()).await?;
    info!(snapshot = %snapshot.id, "[4/6] Snapshot created");
    ctx.check_cancelled()?;

    // [5/6] 依赖序启动
    info!("[5/6] Starting services");
    if let Err(cause) = ServiceOrchestrator::start(ctx, &specs, &config.as_map()).await {
        return Err(auto_rollback(ctx, &specs, &snapshot, cause).await);
    }

    // [6/6] 终态验证
    let (final_state, reports) = StateInspector::inspect_with_report(ctx, &specs).await?;
    if final_state != DeploymentState::TargetHealthy {
        let unhealthy = reports
            .iter()
            .find(|r| r.status != crate::domain::service::HealthStatus::Healthy)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let cause = OrchestratorError::ServiceUnhealthy { service: unhealthy };
        return Err(auto_rollback(ctx, &specs, &snapshot, cause).await);
    }

    info!(environment = %ctx.environment, "[6/6] === Deploy complete, target healthy ===");
    Ok(final_state)
}

/// 破坏性阶段失败：有快照则自动回滚，之后仍报告原始失败原因
///
/// 回滚自身失败时以 `RollbackFailed` 覆盖（需要人工介入的终态）
async fn auto_rollback(
    ctx: &OrchestrateContext,
    specs: &[ServiceSpec],
    snapshot: &Snapshot,
    cause: OrchestratorError,
) -> OrchestratorError {
    warn!(
        environment = %ctx.environment,
        snapshot = %snapshot.id,
        cause = %cause,
        "Destructive phase failed, rolling back automatically"
    );
    match RollbackController::rollback(ctx, specs).await {
        Ok(()) => {
            info!(environment = %ctx.environment, "Auto-rollback succeeded");
            cause
        }
        Err(rollback_err) => {
            warn!(error = %rollback_err, "Auto-rollback failed");
            rollback_err
        }
    }
}

/// 创建目标布局骨架并固化服务清单
async fn ensure_layout(ctx: &OrchestrateContext, specs: &[ServiceSpec]) -> Result<()> {
    tokio::fs::create_dir_all(&ctx.paths.data_dir).await?;
    tokio::fs::create_dir_all(&ctx.paths.config_dir).await?;
    tokio::fs::create_dir_all(&ctx.paths.snapshots_dir).await?;

    if !tokio::fs::try_exists(&ctx.paths.services_manifest).await? {
        let bytes = serde_json::to_vec_pretty(specs).map_err(|e| OrchestratorError::Parse {
            path: ctx.paths.services_manifest.clone(),
            source: e,
        })?;
        fsutil::atomic_write(&ctx.paths.services_manifest, &bytes).await?;
        info!(path = %ctx.paths.services_manifest.display(), "Service manifest written");
    }
    Ok(())
}

/// status 命令：归类状态 + 逐服务健康
pub async fn status(ctx: &OrchestrateContext) -> Result<(DeploymentState, Vec<ServiceReport>)> {
    let specs = load_specs(ctx).await?;
    StateInspector::inspect_with_report(ctx, &specs).await
}

/// 手动回滚到最近快照
pub async fn manual_rollback(ctx: &OrchestrateContext) -> Result<()> {
    let _lock = EnvironmentLock::acquire(&ctx.paths.lock_path, &ctx.environment)?;
    let specs = load_specs(ctx).await?;
    RollbackController::rollback(ctx, &specs).await
}

/// 显式的旧版数据删除，迁移路径上绝不自动执行
///
/// 仅当每个必需工件都有 Verified 记录时才允许；返回被删除的源路径
pub async fn purge_legacy(ctx: &OrchestrateContext) -> Result<Vec<PathBuf>> {
    let _lock = EnvironmentLock::acquire(&ctx.paths.lock_path, &ctx.environment)?;
    let specs = load_specs(ctx).await?;
    let categories = migrator::categories_from_specs(&specs);
    let manifest = MigrationManifest::load(&ctx.paths.manifest_dir).await?;

    for category in categories.iter().filter(|c| c.required) {
        if manifest.verified(&category.name).is_none() {
            return Err(OrchestratorError::MigrationBlocked {
                artifact: category.name.clone(),
                reason: "not yet verified, refusing to delete legacy source".to_string(),
            });
        }
    }

    let mut removed = Vec::new();
    for category in &categories {
        // 只删已验证吸收的源
        if manifest.verified(&category.name).is_none() {
            continue;
        }
        let source = ctx.settings.legacy_root.join(&category.legacy_rel);
        if tokio::fs::try_exists(&source).await? {
            info!(path = %source.display(), "Removing verified legacy source");
            if tokio::fs::metadata(&source).await?.is_dir() {
                tokio::fs::remove_dir_all(&source).await?;
            } else {
                tokio::fs::remove_file(&source).await?;
            }
            removed.push(source);
        }
    }
    Ok(removed)
}
