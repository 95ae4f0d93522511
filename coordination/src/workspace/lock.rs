//! Advisory file lock shared by every process working on one repository.
//!
//! Guards the workspace registry and the primary checkout refresh done by
//! the state synchronizer. Holders keep it for one short read-modify-write.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fd_lock::RwLock;

use crate::error::{CoordError, CoordResult};

/// Poll interval while another holder has the lock
const POLL_INTERVAL_MS: u64 = 20;

/// Exclusive lock over a lock file
pub struct FileLock {
    inner: RwLock<File>,
    path: PathBuf,
}

/// A held lock. Dropping it closes the file, which releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileLock {
    /// Open (creating if needed) the lock file at `path`
    pub fn open(path: impl AsRef<Path>) -> CoordResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            inner: RwLock::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive lock, polling without blocking the runtime.
    ///
    /// Only non-blocking attempts are made; gives up with `Timeout` after
    /// `timeout`.
    pub async fn write(mut self, timeout: Duration) -> CoordResult<LockGuard> {
        let started = Instant::now();
        loop {
            match self.inner.try_write() {
                Ok(guard) => {
                    // The lock lives as long as the file handle, which moves
                    // into the returned guard.
                    std::mem::forget(guard);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(CoordError::Timeout {
                            operation: format!("lock {}", self.path.display()),
                            seconds: timeout.as_secs(),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(LockGuard {
            _file: self.inner.into_inner(),
            path: self.path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("test.lock");

        let guard = FileLock::open(&path)
            .unwrap()
            .write(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(guard.path(), path.as_path());

        let started = Instant::now();
        let err = FileLock::open(&path)
            .unwrap()
            .write(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));

        drop(guard);
        assert!(FileLock::open(&path)
            .unwrap()
            .write(Duration::from_secs(1))
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_holders_never_overlap() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let _guard = FileLock::open(&path)
                        .unwrap()
                        .write(Duration::from_secs(30))
                        .await
                        .unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders at once");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    entries.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 40);
    }
}
