//! 快照元数据
//!
//! 快照一经创建即不可变，由 RollbackController 引用；
//! 束内自带逐文件校验和清单，恢复前据此验证

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 快照束内的清单文件名
pub const SNAPSHOT_MANIFEST_NAME: &str = "manifest.json";

/// 快照束内的数据目录名
pub const SNAPSHOT_DATA_DIR: &str = "data";

/// 快照元数据
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// 基于时间戳的 ID，如 `20260829T143501Z`
    pub id: String,
    /// 覆盖的原始路径（环境根的相对路径）
    pub covered_paths: Vec<PathBuf>,
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// 生成新的快照 ID
    pub fn new_id(now: DateTime<Utc>) -> String {
        now.format("%Y%m%dT%H%M%S%3fZ").to_string()
    }
}

/// 快照束清单：元数据 + 相对路径 → SHA-256
///
/// BTreeMap 保证序列化顺序稳定
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot: Snapshot,
    pub checksums: BTreeMap<PathBuf, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_ids_sort_chronologically() {
        let earlier = Snapshot::new_id("2026-08-29T14:35:01Z".parse().unwrap());
        let later = Snapshot::new_id("2026-08-29T14:35:02Z".parse().unwrap());
        assert!(later > earlier);
    }
}
