//! 环境级互斥锁
//!
//! 基于文件系统的建议锁：同一环境的第二次并发编排直接失败，
//! 不同环境互不影响。锁文件写入持有者 pid 便于排障。

use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{OrchestratorError, Result};

/// 环境锁，持有期间独占该环境的编排权
///
/// Drop 时操作系统自动释放 flock
pub struct EnvironmentLock {
    _file: std::fs::File,
}

impl EnvironmentLock {
    /// 尝试获取环境锁
    ///
    /// 先以不截断方式打开（截断必须发生在持锁之后），获取失败
    /// 返回 `EnvironmentLocked`
    pub fn acquire(lock_path: &Path, environment: &str) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.try_lock_exclusive()
            .map_err(|_| OrchestratorError::EnvironmentLocked {
                environment: environment.to_string(),
            })?;

        // 持锁后再写入 pid
        let mut file = file;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}
