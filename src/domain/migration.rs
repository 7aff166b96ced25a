//! 迁移记录与迁移清单
//!
//! 每个发现的旧版工件对应一条 `MigrationRecord`，持久化在目标布局的
//! `migration-manifest.json` 中，重跑时据此跳过已验证的条目

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};
use crate::infra::fsutil;

/// 迁移清单文件名
pub const MANIFEST_FILE_NAME: &str = "migration-manifest.json";

/// 迁移记录状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// 已发现，尚未迁移
    Pending,
    /// 目标校验和与源一致，迁移完成
    Verified,
    /// 无需迁移（源不存在或目标已有数据）
    Skipped,
    /// 校验和不匹配或复制失败
    Failed,
}

/// 单个旧版工件的迁移记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// 工件名（服务数据卷名或缓存类别）
    pub artifact: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub byte_count: u64,
    /// 源内容的 SHA-256（目录为聚合摘要）
    pub checksum: Option<String>,
    pub status: MigrationStatus,
    /// 失败原因
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn pending(artifact: &str, source: &Path, dest: &Path) -> Self {
        Self {
            artifact: artifact.to_string(),
            source_path: source.to_path_buf(),
            dest_path: dest.to_path_buf(),
            byte_count: 0,
            checksum: None,
            status: MigrationStatus::Pending,
            error: None,
            recorded_at: Utc::now(),
        }
    }
}

/// 迁移清单
///
/// 只追加的记录列表，每次编排运行时重新读取。带版本号以便
/// 未来格式升级。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationManifest {
    pub version: u32,
    pub records: Vec<MigrationRecord>,
    pub saved_at: DateTime<Utc>,
}

impl MigrationManifest {
    /// 创建空清单
    pub fn new() -> Self {
        Self {
            version: 1,
            records: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    /// 从目标布局加载清单，不存在时返回空清单
    ///
    /// 解析失败视为致命错误：半写状态的清单意味着原子写约定被
    /// 破坏，不能静默当作空清单重新迁移
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| OrchestratorError::Parse {
                    path: path.clone(),
                    source: e,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// 原子保存清单（写临时文件后 rename）
    pub async fn save(&mut self, dir: &Path) -> Result<()> {
        self.saved_at = Utc::now();
        let path = dir.join(MANIFEST_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| OrchestratorError::Parse {
            path: path.clone(),
            source: e,
        })?;
        fsutil::atomic_write(&path, &bytes).await?;
        Ok(())
    }

    /// 查找某工件已验证的记录
    pub fn verified(&self, artifact: &str) -> Option<&MigrationRecord> {
        self.records
            .iter()
            .find(|r| r.artifact == artifact && r.status == MigrationStatus::Verified)
    }

    /// 追加一条记录
    pub fn push(&mut self, record: MigrationRecord) {
        self.records.push(record);
    }

    /// 是否存在任一必需工件的失败记录
    pub fn failed_artifacts(&self) -> Vec<&MigrationRecord> {
        self.records
            .iter()
            .filter(|r| r.status == MigrationStatus::Failed)
            .collect()
    }
}

impl Default for MigrationManifest {
    fn default() -> Self {
        Self::new()
    }
}
