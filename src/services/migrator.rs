//! 数据迁移器
//!
//! 将旧版布局中的持久工件无损迁入目标布局：
//! - 清单中已有 Verified 记录的工件直接跳过（幂等）
//! - 复制后比对源/目标校验和，一致才记 Verified
//! - 单个工件失败不中断其他工件（部分失败隔离）
//! - 绝不删除旧版源数据 —— 删除是独立的操作员命令 `purge-legacy`

use std::path::PathBuf;
use tracing::{info, warn};

use crate::domain::migration::{MigrationManifest, MigrationRecord, MigrationStatus};
use crate::domain::service::ServiceSpec;
use crate::error::{OrchestratorError, Result};
use crate::infra::fsutil;
use crate::services::context::OrchestrateContext;

/// 待迁移的工件类别
#[derive(Clone, Debug)]
pub struct ArtifactCategory {
    /// 工件名（清单键）
    pub name: String,
    /// 旧版布局中的相对路径
    pub legacy_rel: PathBuf,
    /// 目标布局 data/ 下的相对路径
    pub target_rel: PathBuf,
    /// 失败时是否阻塞编排
    pub required: bool,
}

/// 由服务注册表推导工件类别
///
/// 每个声明了数据卷的服务对应一个类别；卷的 required 标志决定
/// 迁移失败是阻塞还是警告（可再生缓存为警告）
pub fn categories_from_specs(specs: &[ServiceSpec]) -> Vec<ArtifactCategory> {
    specs
        .iter()
        .filter_map(|spec| {
            spec.data_volume.as_ref().map(|volume| ArtifactCategory {
                name: volume.subdir.clone(),
                legacy_rel: PathBuf::from(&volume.subdir),
                target_rel: PathBuf::from(&volume.subdir),
                required: volume.required,
            })
        })
        .collect()
}

/// 数据迁移器
pub struct DataMigrator;

impl DataMigrator {
    /// 执行迁移，返回本次运行产生的记录
    ///
    /// 清单在处理完每个工件后立即原子落盘，崩溃后重跑不会重复
    /// 已验证的复制
    pub async fn migrate(
        ctx: &OrchestrateContext,
        categories: &[ArtifactCategory],
        manifest: &mut MigrationManifest,
    ) -> Result<Vec<MigrationRecord>> {
        let mut produced = Vec::new();

        for category in categories {
            ctx.check_cancelled()?;

            // 幂等：已验证的工件不再碰
            if manifest.verified(&category.name).is_some() {
                info!(artifact = %category.name, "Already verified, skipping");
                continue;
            }

            let source = ctx.settings.legacy_root.join(&category.legacy_rel);
            let dest = ctx.paths.data_dir.join(&category.target_rel);
            let mut record = MigrationRecord::pending(&category.name, &source, &dest);

            let source_exists = match tokio::fs::metadata(&source).await {
                Ok(meta) => meta.is_file() || fsutil::dir_has_content(&source).await?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };
            if !source_exists {
                record.status = MigrationStatus::Skipped;
                record.error = Some("no legacy source".to_string());
                info!(artifact = %category.name, "No legacy source, skipping");
                manifest.push(record.clone());
                manifest.save(&ctx.paths.manifest_dir).await?;
                produced.push(record);
                continue;
            }

            match Self::migrate_one(&mut record).await {
                Ok(()) => {
                    info!(
                        artifact = %category.name,
                        bytes = record.byte_count,
                        "Artifact migrated and verified"
                    );
                }
                Err(reason) => {
                    // 部分失败隔离：记录后继续下一个工件
                    record.status = MigrationStatus::Failed;
                    record.error = Some(reason.clone());
                    warn!(artifact = %category.name, reason = %reason, "Artifact migration failed");
                }
            }
            manifest.push(record.clone());
            manifest.save(&ctx.paths.manifest_dir).await?;
            produced.push(record);
        }

        // 阻塞判定：必需工件存在 Failed 记录
        for category in categories.iter().filter(|c| c.required) {
            if manifest.verified(&category.name).is_some() {
                continue;
            }
            if let Some(failed) = manifest
                .records
                .iter()
                .rev()
                .find(|r| r.artifact == category.name && r.status == MigrationStatus::Failed)
            {
                return Err(OrchestratorError::MigrationBlocked {
                    artifact: category.name.clone(),
                    reason: failed
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }

        Ok(produced)
    }

    /// 复制单个工件并校验
    async fn migrate_one(record: &mut MigrationRecord) -> std::result::Result<(), String> {
        let source_checksum = fsutil::path_checksum(&record.source_path)
            .await
            .map_err(|e| format!("checksum of source failed: {}", e))?;

        let bytes = fsutil::copy_path(&record.source_path, &record.dest_path)
            .await
            .map_err(|e| format!("copy failed: {}", e))?;

        let dest_checksum = fsutil::path_checksum(&record.dest_path)
            .await
            .map_err(|e| format!("checksum of destination failed: {}", e))?;

        if dest_checksum != source_checksum {
            return Err(format!(
                "checksum mismatch: source {} destination {}",
                source_checksum, dest_checksum
            ));
        }

        record.byte_count = bytes;
        record.checksum = Some(source_checksum);
        record.status = MigrationStatus::Verified;
        Ok(())
    }

    /// 是否仍有未吸收的旧版数据（决定 deploy 是否需要迁移阶段）
    pub async fn has_unabsorbed_legacy(
        ctx: &OrchestrateContext,
        categories: &[ArtifactCategory],
        manifest: &MigrationManifest,
    ) -> Result<bool> {
        for category in categories {
            if manifest.verified(&category.name).is_some() {
                continue;
            }
            let source = ctx.settings.legacy_root.join(&category.legacy_rel);
            if fsutil::dir_has_content(&source).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::HealthStatus;
    use crate::services::test_support::{test_context, ScriptedProbe, ScriptedRuntime};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ctx_with_dirs(dir: &tempfile::TempDir) -> OrchestrateContext {
        test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        )
    }

    async fn seed_legacy(ctx: &OrchestrateContext, subdir: &str, files: &[(&str, &[u8])]) {
        let root = ctx.settings.legacy_root.join(subdir);
        tokio::fs::create_dir_all(&root).await.unwrap();
        for (name, content) in files {
            tokio::fs::write(root.join(name), content).await.unwrap();
        }
    }

    fn category(name: &str, required: bool) -> ArtifactCategory {
        ArtifactCategory {
            name: name.to_string(),
            legacy_rel: PathBuf::from(name),
            target_rel: PathBuf::from(name),
            required,
        }
    }

    #[tokio::test]
    async fn test_migrates_and_verifies() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with_dirs(&dir);
        tokio::fs::create_dir_all(&ctx.paths.root).await.unwrap();
        seed_legacy(&ctx, "postgres", &[("base.db", b"pg-bytes")]).await;

        let categories = vec![category("postgres", true)];
        let mut manifest = MigrationManifest::new();
        let records = DataMigrator::migrate(&ctx, &categories, &mut manifest)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, MigrationStatus::Verified);
        assert_eq!(records[0].byte_count, 8);
        // 目标收到数据
        let copied = tokio::fs::read(ctx.paths.data_dir.join("postgres/base.db"))
            .await
            .unwrap();
        assert_eq!(copied, b"pg-bytes");
        // 旧版源未被删除
        assert!(ctx
            .settings
            .legacy_root
            .join("postgres/base.db")
            .exists());
    }

    #[tokio::test]
    async fn test_second_run_skips_verified() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with_dirs(&dir);
        tokio::fs::create_dir_all(&ctx.paths.root).await.unwrap();
        seed_legacy(&ctx, "models", &[("weights.bin", b"4gb-pretend")]).await;

        let categories = vec![category("models", false)];
        let mut manifest = MigrationManifest::new();
        DataMigrator::migrate(&ctx, &categories, &mut manifest)
            .await
            .unwrap();

        // 移除目标副本后重跑：Verified 记录使其直接跳过，不再复制字节
        tokio::fs::remove_dir_all(ctx.paths.data_dir.join("models"))
            .await
            .unwrap();
        let mut reloaded = MigrationManifest::load(&ctx.paths.manifest_dir).await.unwrap();
        let second = DataMigrator::migrate(&ctx, &categories, &mut reloaded)
            .await
            .unwrap();
        assert!(second.is_empty());
        assert!(!ctx.paths.data_dir.join("models").exists());

        let verified: Vec<_> = reloaded
            .records
            .iter()
            .filter(|r| r.status == MigrationStatus::Verified)
            .collect();
        assert_eq!(verified.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_recorded_as_skipped() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with_dirs(&dir);
        tokio::fs::create_dir_all(&ctx.paths.root).await.unwrap();

        let categories = vec![category("postgres", true)];
        let mut manifest = MigrationManifest::new();
        let records = DataMigrator::migrate(&ctx, &categories, &mut manifest)
            .await
            .unwrap();
        assert_eq!(records[0].status, MigrationStatus::Skipped);
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_block_required_success() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with_dirs(&dir);
        tokio::fs::create_dir_all(&ctx.paths.root).await.unwrap();
        seed_legacy(&ctx, "postgres", &[("base.db", b"pg")]).await;
        seed_legacy(&ctx, "models", &[("weights.bin", b"w")]).await;
        // models 的目标路径被一个文件占住，复制将失败
        tokio::fs::create_dir_all(&ctx.paths.data_dir).await.unwrap();
        tokio::fs::write(ctx.paths.data_dir.join("models"), b"in the way")
            .await
            .unwrap();

        let categories = vec![category("postgres", true), category("models", false)];
        let mut manifest = MigrationManifest::new();
        let result = DataMigrator::migrate(&ctx, &categories, &mut manifest).await;

        // 可选工件失败只是警告，必需工件已验证
        assert!(result.is_ok());
        assert!(manifest.verified("postgres").is_some());
        assert_eq!(manifest.failed_artifacts().len(), 1);
    }

    #[tokio::test]
    async fn test_required_failure_blocks() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with_dirs(&dir);
        tokio::fs::create_dir_all(&ctx.paths.root).await.unwrap();
        seed_legacy(&ctx, "postgres", &[("base.db", b"pg")]).await;
        tokio::fs::create_dir_all(&ctx.paths.data_dir).await.unwrap();
        tokio::fs::write(ctx.paths.data_dir.join("postgres"), b"in the way")
            .await
            .unwrap();

        let categories = vec![category("postgres", true)];
        let mut manifest = MigrationManifest::new();
        let err = DataMigrator::migrate(&ctx, &categories, &mut manifest)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MigrationBlocked { .. }));
    }

    #[tokio::test]
    async fn test_has_unabsorbed_legacy() {
        let dir = tempdir().unwrap();
        let ctx = ctx_with_dirs(&dir);
        tokio::fs::create_dir_all(&ctx.paths.root).await.unwrap();
        let categories = vec![category("postgres", true)];
        let manifest = MigrationManifest::new();

        assert!(!DataMigrator::has_unabsorbed_legacy(&ctx, &categories, &manifest)
            .await
            .unwrap());

        seed_legacy(&ctx, "postgres", &[("base.db", b"pg")]).await;
        assert!(DataMigrator::has_unabsorbed_legacy(&ctx, &categories, &manifest)
            .await
            .unwrap());
    }
}
