//! File-based locking for single-writer safety.
//!
//! Advisory exclusive lock (fs2) on `<store dir>/LOCK`, held for as long as
//! the store is open. Released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lock_file(dir: &Path) -> Result<(File, PathBuf)> {
    let path = dir.join(LOCK_FILE);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok((f, path))
}

/// Acquire the store lock, blocking until it is free.
pub fn acquire_exclusive_lock(dir: &Path) -> Result<LockGuard> {
    let (file, path) = open_lock_file(dir)?;
    file.lock_exclusive()
        .with_context(|| format!("lock_exclusive {}", path.display()))?;
    Ok(LockGuard { file, path })
}

/// Acquire the store lock or fail immediately if another process holds it.
pub fn try_acquire_exclusive_lock(dir: &Path) -> Result<LockGuard> {
    let (file, path) = open_lock_file(dir)?;
    file.try_lock_exclusive()
        .with_context(|| format!("store is locked by another process: {}", path.display()))?;
    Ok(LockGuard { file, path })
}
