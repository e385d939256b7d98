//! Filesystem plumbing shared by the stores, the resolver, and the
//! scheduler.
//!
//! Most of mason's disk state is allowed to be missing: a blob that was
//! never built, a sentinel not yet written, a sandbox already cleaned up by
//! a retry pass. The helpers here therefore treat absence as data
//! ([`absent_ok`]) rather than as an error, and every mutation emits a
//! trace event so a run can be reconstructed from its log.

use std::{
    fmt::Debug as StdDebug,
    fs::Metadata,
    io::ErrorKind,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};

/// Fold a `NotFound` outcome into `None`, keeping every other error.
fn absent_ok<T>(outcome: std::io::Result<T>, action: &str, path: &Path) -> Result<Option<T>> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("{action}: {path:?}")),
    }
}

/// Make sure the directory `path` sits in exists.
async fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) => create_dir_all(parent).await,
        None => Ok(()),
    }
}

/// Bring `dir` (and any missing ancestors) into existence.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + StdDebug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create directory tree: {dir:?}"))?;
    trace!(?dir, "directory ready");
    Ok(())
}

/// Replace the file at `path` with `content`, creating parents on the way.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + StdDebug, content: impl AsRef<[u8]>) -> Result<()> {
    let (path, content) = (path.as_ref(), content.as_ref());
    ensure_parent(path).await?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("replace file: {path:?}"))?;
    trace!(?path, bytes = content.len(), "file replaced");
    Ok(())
}

/// Add `content` to the end of the file at `path`, creating it if needed.
///
/// This is the primitive under build logs, which grow one command at a
/// time across several subprocesses.
#[instrument(skip(content))]
pub async fn append(path: impl AsRef<Path> + StdDebug, content: impl AsRef<[u8]>) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let (path, content) = (path.as_ref(), content.as_ref());
    ensure_parent(path).await?;
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open for append: {path:?}"))?
        .write_all(content)
        .await
        .with_context(|| format!("extend file: {path:?}"))?;
    trace!(?path, bytes = content.len(), "file extended");
    Ok(())
}

/// The UTF-8 content of the file at `path`, or `None` if nothing is there.
#[instrument]
pub async fn read_utf8(path: impl AsRef<Path> + StdDebug) -> Result<Option<String>> {
    let path = path.as_ref();
    let content = absent_ok(tokio::fs::read_to_string(path).await, "read file", path)?;
    if let Some(content) = &content {
        trace!(?path, bytes = content.len(), "file read");
    }
    Ok(content)
}

/// Stat `path`, or `None` if nothing is there.
pub async fn metadata(path: impl AsRef<Path> + StdDebug) -> Result<Option<Metadata>> {
    let path = path.as_ref();
    absent_ok(tokio::fs::metadata(path).await, "stat path", path)
}

/// Take down the directory tree at `path`. A tree that is already gone
/// counts as removed.
pub async fn remove_dir_all(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    let removed = absent_ok(
        tokio::fs::remove_dir_all(path).await,
        "remove directory",
        path,
    )?;
    trace!(?path, already_gone = removed.is_none(), "directory removed");
    Ok(())
}

/// Advisory per-key lockfile over `flock(2)`.
///
/// A builder takes the exclusive lock without blocking; contended workers
/// take a shared lock with a timeout to wait for the holder. The OS releases
/// a lock when its handle closes, so dropping a [`LockGuard`] is the only
/// unlock path.
#[derive(Clone, Debug, Display)]
#[display("{}", path.display())]
pub struct Lockfile {
    path: PathBuf,
}

/// Holds an exclusive advisory lock for as long as it lives.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    // Held only so the descriptor (and with it the lock) survives until drop.
    _file: std::fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        trace!(path = ?self.path, "release lock");
    }
}

impl Lockfile {
    /// Create a handle for the lockfile at `path`. Nothing is locked yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Attempt the exclusive lock without blocking.
    ///
    /// Returns `None` when another process holds the lock in any mode.
    #[instrument(skip_all, fields(%self))]
    pub async fn try_exclusive(&self) -> Result<Option<LockGuard>> {
        let path = self.path.clone();
        spawn_blocking(move || -> Result<Option<LockGuard>> {
            let file = open_lockfile(&path)?;
            match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
                Ok(()) => {
                    trace!(?path, "acquired exclusive lock");
                    Ok(Some(LockGuard { path, _file: file }))
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    trace!(?path, "exclusive lock contended");
                    Ok(None)
                }
                Err(err) => Err(err).context(format!("lock file: {path:?}")),
            }
        })
        .await
        .context("join task")?
    }

    /// Wait until the exclusive holder releases, bounded by `timeout`.
    ///
    /// The shared lock is dropped immediately once acquired; this is purely a
    /// barrier. Returns whether the holder released within the timeout.
    #[instrument(skip_all, fields(%self, ?timeout))]
    pub async fn wait_shared(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let path = self.path.clone();
            let acquired = spawn_blocking(move || -> Result<bool> {
                let file = open_lockfile(&path)?;
                match flock(&file, libc::LOCK_SH | libc::LOCK_NB) {
                    Ok(()) => Ok(true),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
                    Err(err) => Err(err).context(format!("lock file: {path:?}")),
                }
            })
            .await
            .context("join task")??;

            if acquired {
                trace!(path = ?self.path, "lock holder released");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                trace!(path = ?self.path, "timed out waiting for lock holder");
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn open_lockfile(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open lock file: {path:?}"))
}

fn flock(file: &std::fs::File, flags: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), flags) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn exclusive_lock_is_exclusive() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let lockfile = Lockfile::new(dir.path().join("component.lock"));

        let guard = lockfile
            .try_exclusive()
            .await
            .expect("first lock attempt")
            .expect("first attempt acquires");
        let contended = lockfile.try_exclusive().await.expect("second lock attempt");
        assert!(contended.is_none(), "held lock should contend");

        drop(guard);
        let reacquired = lockfile.try_exclusive().await.expect("third lock attempt");
        assert!(reacquired.is_some(), "dropped guard should release");
    }

    #[test_log::test(tokio::test)]
    async fn shared_wait_times_out_under_exclusive_holder() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let lockfile = Lockfile::new(dir.path().join("component.lock"));

        let _guard = lockfile
            .try_exclusive()
            .await
            .expect("lock attempt")
            .expect("acquires");
        let released = lockfile
            .wait_shared(Duration::from_millis(250))
            .await
            .expect("wait for holder");
        assert!(!released, "holder never released, wait must time out");
    }

    #[test_log::test(tokio::test)]
    async fn shared_wait_returns_once_released() {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let lockfile = Lockfile::new(dir.path().join("component.lock"));

        let released = lockfile
            .wait_shared(Duration::from_millis(250))
            .await
            .expect("wait with no holder");
        assert!(released, "uncontended wait returns immediately");
    }
}
