//! 备份管理器
//!
//! 在任何破坏性步骤（移除既有容器、非纯增量的改写）之前对持久
//! 状态做快照。恢复为全有或全无：先在旁路暂存并校验，任何校验
//! 失败都发生在第一次交换之前；交换用 rename 完成。

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::domain::snapshot::{
    Snapshot, SnapshotManifest, SNAPSHOT_DATA_DIR, SNAPSHOT_MANIFEST_NAME,
};
use crate::error::{OrchestratorError, Result};
use crate::infra::fsutil;
use crate::services::context::OrchestrateContext;

/// 备份管理器
pub struct BackupManager;

impl BackupManager {
    /// 创建快照
    ///
    /// `paths` 为环境根的相对路径；不存在的路径记录在清单中但无
    /// 数据（恢复时代表“该路径应为空”）。完成后按保留策略清理
    /// 最旧的快照。
    pub async fn snapshot(ctx: &OrchestrateContext, paths: &[PathBuf]) -> Result<Snapshot> {
        let mut id = Snapshot::new_id(Utc::now());
        // 同一毫秒内的连续快照：追加序号保持 ID 唯一且可排序
        let mut seq = 0u32;
        while tokio::fs::try_exists(&ctx.paths.snapshots_dir.join(&id)).await? {
            seq += 1;
            id = format!("{}-{}", Snapshot::new_id(Utc::now()), seq);
        }
        let bundle_dir = ctx.paths.snapshots_dir.join(&id);
        let data_dir = bundle_dir.join(SNAPSHOT_DATA_DIR);
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut checksums = std::collections::BTreeMap::new();
        let mut total_bytes = 0u64;
        for rel in paths {
            let live = ctx.paths.root.join(rel);
            if !tokio::fs::try_exists(&live).await? {
                continue;
            }
            let staged = data_dir.join(rel);
            total_bytes += fsutil::copy_path(&live, &staged).await?;
            checksums.insert(rel.clone(), fsutil::path_checksum(&staged).await?);
        }

        let snapshot = Snapshot {
            id: id.clone(),
            covered_paths: paths.to_vec(),
            total_bytes,
            created_at: Utc::now(),
        };
        let manifest = SnapshotManifest {
            snapshot: snapshot.clone(),
            checksums,
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|e| OrchestratorError::Parse {
                path: bundle_dir.join(SNAPSHOT_MANIFEST_NAME),
                source: e,
            })?;
        // 原子写清单：清单存在即代表快照完整可用
        fsutil::atomic_write(&bundle_dir.join(SNAPSHOT_MANIFEST_NAME), &manifest_bytes).await?;

        info!(
            snapshot = %id,
            bytes = total_bytes,
            paths = paths.len(),
            "Snapshot created"
        );

        Self::apply_retention(ctx).await?;
        Ok(snapshot)
    }

    /// 最近一个有效快照（清单可解析）
    pub async fn latest(ctx: &OrchestrateContext) -> Result<Option<SnapshotManifest>> {
        let mut ids = Self::list_ids(ctx).await?;
        // ID 基于时间戳，字典序即时间序
        ids.sort();
        while let Some(id) = ids.pop() {
            match Self::load_manifest(ctx, &id).await {
                Ok(manifest) => return Ok(Some(manifest)),
                Err(e) => {
                    warn!(snapshot = %id, error = %e, "Skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    /// 恢复快照：staging 校验通过后才做第一次交换
    pub async fn restore(ctx: &OrchestrateContext, manifest: &SnapshotManifest) -> Result<()> {
        let bundle_dir = ctx.paths.snapshots_dir.join(&manifest.snapshot.id);
        let data_dir = bundle_dir.join(SNAPSHOT_DATA_DIR);

        // 第一遍：校验快照内容与清单一致
        for (rel, expected) in &manifest.checksums {
            let staged = data_dir.join(rel);
            let actual = fsutil::path_checksum(&staged).await.map_err(|e| {
                OrchestratorError::SnapshotCorrupt {
                    id: manifest.snapshot.id.clone(),
                    reason: format!("{} unreadable: {}", rel.display(), e),
                }
            })?;
            if &actual != expected {
                return Err(OrchestratorError::SnapshotCorrupt {
                    id: manifest.snapshot.id.clone(),
                    reason: format!("checksum mismatch for {}", rel.display()),
                });
            }
        }

        // 第二遍：为全部覆盖路径就位暂存副本并清理残留，任何失败
        // 都发生在第一次交换之前
        struct Swap {
            live: PathBuf,
            incoming: PathBuf,
            outgoing: PathBuf,
            had_data: bool,
        }
        let mut swaps = Vec::with_capacity(manifest.snapshot.covered_paths.len());
        for rel in &manifest.snapshot.covered_paths {
            let live = ctx.paths.root.join(rel);
            let staged = data_dir.join(rel);
            let incoming = Self::sibling(&live, "restore-incoming");
            let outgoing = Self::sibling(&live, "restore-outgoing");

            // 上次中断的恢复可能残留暂存路径，交换前必须让出位置
            Self::remove_stale(&incoming).await?;
            Self::remove_stale(&outgoing).await?;

            let had_data = tokio::fs::try_exists(&staged).await?;
            if had_data {
                if let Some(parent) = incoming.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                fsutil::copy_path(&staged, &incoming).await?;
            }
            swaps.push(Swap {
                live,
                incoming,
                outgoing,
                had_data,
            });
        }

        // 第三遍：全部就绪后才开始 rename 交换
        for swap in &swaps {
            if tokio::fs::try_exists(&swap.live).await? {
                tokio::fs::rename(&swap.live, &swap.outgoing).await?;
            }
            if swap.had_data {
                tokio::fs::rename(&swap.incoming, &swap.live).await?;
            }
        }
        for swap in &swaps {
            let _ = tokio::fs::remove_dir_all(&swap.outgoing).await;
        }

        info!(snapshot = %manifest.snapshot.id, "Snapshot restored");
        Ok(())
    }

    /// 删除残留的暂存路径，文件或目录均可；不存在为 no-op
    async fn remove_stale(path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(tokio::fs::remove_dir_all(path).await?),
            Ok(_) => Ok(tokio::fs::remove_file(path).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 删除超出保留数量的最旧快照
    async fn apply_retention(ctx: &OrchestrateContext) -> Result<()> {
        let mut ids = Self::list_ids(ctx).await?;
        ids.sort();
        let keep = ctx.settings.snapshot_retention.max(1);
        while ids.len() > keep {
            let oldest = ids.remove(0);
            let dir = ctx.paths.snapshots_dir.join(&oldest);
            info!(snapshot = %oldest, "Removing snapshot beyond retention");
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn list_ids(ctx: &OrchestrateContext) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&ctx.paths.snapshots_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(ids)
    }

    async fn load_manifest(ctx: &OrchestrateContext, id: &str) -> Result<SnapshotManifest> {
        let path = ctx
            .paths
            .snapshots_dir
            .join(id)
            .join(SNAPSHOT_MANIFEST_NAME);
        let bytes = tokio::fs::read(&path).await?;
        serde_json::from_slice(&bytes).map_err(|e| OrchestratorError::Parse { path, source: e })
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "path".to_string());
        path.with_file_name(format!(".{}.{}", name, suffix))
    }
}
