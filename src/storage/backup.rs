use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::error::BackupError;
use crate::index::IndexTracker;

/// 备份时使用的临时目录名（与 target 同级）
pub const BACKUP_TEMP_DIR: &str = ".indexbackup_temp";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Completed { files: usize, bytes: u64 },
    /// 已有备份在进行中，本次未执行
    AlreadyRunning,
}

/// 索引目录的一致性备份：
/// 持有 commit gate 写锁期间没有快照处于应用中，此时落盘并整体拷贝。
pub struct BackupCoordinator {
    tracker: Arc<IndexTracker>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BackupCoordinator {
    pub fn new(tracker: Arc<IndexTracker>) -> Self {
        Self {
            tracker,
            running: AtomicBool::new(false),
        }
    }

    pub fn backup(&self, target: &Path) -> Result<BackupOutcome, BackupError> {
        let root = self
            .tracker
            .backend()
            .root_dir()
            .ok_or_else(|| BackupError::target(target, "index is not persisted on disk"))?;
        let target = validate_target(target, &root)?;

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("Backup already in progress, skipping request for {:?}", target);
            return Ok(BackupOutcome::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let started = Instant::now();
        let Some(parent) = target.parent() else {
            return Err(BackupError::target(&target, "target has no parent directory"));
        };
        fs::create_dir_all(parent)?;
        let temp = parent.join(BACKUP_TEMP_DIR);
        if temp.exists() {
            fs::remove_dir_all(&temp)?;
        }

        let (files, bytes) = {
            let _gate = self.tracker.pause_applications();
            self.tracker.backend().flush()?;
            copy_tree(&root, &temp)?
        };

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&temp, &target)?;

        tracing::info!(
            "Backup completed: {:?} -> {:?} ({} files, {} bytes) in {:?}",
            root,
            target,
            files,
            bytes,
            started.elapsed()
        );
        Ok(BackupOutcome::Completed { files, bytes })
    }
}

/// target 不能是文件，必须有父目录，且不能与索引根互相包含
fn validate_target(target: &Path, root: &Path) -> Result<PathBuf, BackupError> {
    if target.is_file() {
        return Err(BackupError::target(target, "target is a file"));
    }
    let Some(name) = target.file_name() else {
        return Err(BackupError::target(target, "target has no parent directory"));
    };
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => std::env::current_dir()?,
        None => return Err(BackupError::target(target, "target has no parent directory")),
    };

    // 父目录可能尚不存在：规范化最近的已存在祖先
    let resolved = absolute(&parent)?.join(name);
    let root = absolute(root)?;
    if resolved.starts_with(&root) {
        return Err(BackupError::target(target, "target is inside the index root"));
    }
    if root.starts_with(&resolved) {
        return Err(BackupError::target(target, "target contains the index root"));
    }
    Ok(resolved)
}

fn absolute(path: &Path) -> Result<PathBuf, BackupError> {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name() else { break };
        rest.push(name.to_os_string());
        if !existing.pop() {
            break;
        }
    }
    let mut out = if existing.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        existing.canonicalize()?
    };
    for name in rest.into_iter().rev() {
        out.push(name);
    }
    Ok(out)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(usize, u64), BackupError> {
    fs::create_dir_all(dst)?;
    let mut files = 0usize;
    let mut bytes = 0u64;

    let walker = ignore::WalkBuilder::new(src)
        .standard_filters(false)
        .follow_links(false)
        .build();
    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        match entry.file_type() {
            Some(ft) if ft.is_dir() => fs::create_dir_all(&out)?,
            Some(ft) if ft.is_file() => {
                if let Some(p) = out.parent() {
                    fs::create_dir_all(p)?;
                }
                bytes += fs::copy(path, &out)?;
                files += 1;
            }
            _ => tracing::debug!("Backup skips non-regular entry {:?}", path),
        }
    }
    Ok((files, bytes))
}
