//! 文件系统工具
//!
//! 提供：
//! - 原子替换写入（写临时文件 + rename，崩溃不会留下半写文件）
//! - 递归复制
//! - 文件/目录的 SHA-256 校验和

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// 原子写入：写入同目录临时文件，fsync 后 rename 到目标路径
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(path);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// 同目录下的临时文件名，rename 才能保证原子性（跨文件系统的
/// rename 不是原子的）
fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

/// 列出目录下所有文件的相对路径，按字典序排序
///
/// 排序保证目录校验和与遍历顺序无关
pub async fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_path_buf();
                files.push(rel);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// 计算单个文件的 SHA-256，十六进制小写
pub async fn file_checksum(path: &Path) -> Result<String> {
    let contents = fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

/// 计算文件或目录的聚合 SHA-256
///
/// 目录：按排序后的相对路径依次喂入 路径名 + 文件内容，
/// 得到与复制顺序无关的稳定摘要
pub async fn path_checksum(path: &Path) -> Result<String> {
    let meta = fs::metadata(path).await?;
    if meta.is_file() {
        return file_checksum(path).await;
    }
    let mut hasher = Sha256::new();
    for rel in collect_files(path).await? {
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let contents = fs::read(path.join(&rel)).await?;
        hasher.update(&contents);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// 递归复制文件或目录到目标路径
///
/// 目标的父目录必须已存在；目录内容合并写入（不预先清空）
pub async fn copy_path(source: &Path, dest: &Path) -> Result<u64> {
    let meta = fs::metadata(source).await?;
    if meta.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(fs::copy(source, dest).await?);
    }
    let mut total = 0u64;
    fs::create_dir_all(dest).await?;
    for rel in collect_files(source).await? {
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        total += fs::copy(source.join(&rel), &target).await?;
    }
    Ok(total)
}

/// 目录是否存在且非空
pub async fn dir_has_content(path: &Path) -> Result<bool> {
    match fs::read_dir(path).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
