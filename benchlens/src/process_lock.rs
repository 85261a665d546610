//! Process-level locks for benchlens-sync.
//!
//! Lock strategy:
//! - One `benchlens-sync-<entity type>.lock` per database and entity type.
//! - Two processes may sync different types of one database at the same time.
//! - Locks are advisory OS file locks (flock), held for process lifetime.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Guard held by benchlens-sync for every entity type it writes.
pub struct SyncProcessGuard {
    _locks: Vec<ProcessLock>,
}

/// Acquire the sync locks for `entity_types` on `db_path`.
///
/// Fails if another process is syncing any of the types. Locks are taken in
/// sorted order so two processes with overlapping type sets cannot deadlock.
pub fn acquire_sync_guard(db_path: &Path, entity_types: &[String]) -> Result<SyncProcessGuard> {
    let mut types: Vec<&str> = entity_types.iter().map(String::as_str).collect();
    types.sort_unstable();
    types.dedup();

    let mut locks = Vec::with_capacity(types.len());
    for entity_type in types {
        let filename = format!("benchlens-sync-{}.lock", sanitize(entity_type));
        let lock = acquire_lock(&filename, db_path).with_context(|| {
            format!("refusing to sync {entity_type}: another benchlens-sync is already syncing it")
        })?;
        locks.push(lock);
    }

    Ok(SyncProcessGuard { _locks: locks })
}

fn sanitize(entity_type: &str) -> String {
    entity_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(filename: &str, db_path: &Path) -> Result<ProcessLock> {
    match try_acquire_lock(filename, db_path)? {
        Some(lock) => Ok(lock),
        None => anyhow::bail!("lock is already held: {}", filename),
    }
}

fn try_acquire_lock(filename: &str, db_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Owner info for debugging
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("benchlens");
    dir
}

fn scoped_lock_filename(base_filename: &str, db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("benchlens process locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;

    fn with_runtime_dir<T>(f: impl FnOnce() -> T) -> T {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", dir.path());
        f()
    }

    #[test]
    fn test_same_type_is_exclusive_other_types_are_not() {
        with_runtime_dir(|| {
            let db = Path::new("/tmp/benchlens-lock-test.db");
            let buyer = acquire_sync_guard(db, &["buyer".to_string()]).unwrap();

            assert!(acquire_sync_guard(db, &["buyer".to_string()]).is_err());
            assert!(acquire_sync_guard(db, &["seller".to_string()]).is_ok());

            // Another database has its own locks
            let other = Path::new("/tmp/benchlens-lock-test-other.db");
            assert!(acquire_sync_guard(other, &["buyer".to_string()]).is_ok());

            drop(buyer);
            assert!(acquire_sync_guard(db, &["buyer".to_string()]).is_ok());
        });
    }

    #[test]
    fn test_sanitize_keeps_lock_name_flat() {
        assert_eq!(sanitize("buyer"), "buyer");
        assert_eq!(sanitize("../etc"), "___etc");
    }
}
