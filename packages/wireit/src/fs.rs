//! Filesystem operations tailored to `wireit`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using. Blocking
//! primitives (the advisory lock) run under `spawn_blocking`.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use tap::TapFallible;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace};

/// Advisory lock file on the file system.
///
/// The contract is cross-process: only one `wireit` process in the world
/// holds a given lock at a time. Lock with [`LockFile::lock`] or
/// [`LockFile::try_lock`]; unlock by dropping the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{}", path.display())]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    #[debug(skip)]
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

/// Outcome of a non-blocking lock attempt.
pub enum TryLock {
    Acquired(LockFile<Locked>),
    Contended(LockFile<Unlocked>),
}

impl LockFile<Unlocked> {
    /// Open (creating if needed) the lock file at the provided path.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        let (file, path) = spawn_blocking(move || {
            FsLockFile::open(path.as_path()).map(|file| (file, path))
        })
        .await
        .context("join task")?
        .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Attempt to lock without blocking.
    #[instrument(skip_all, fields(%self))]
    pub async fn try_lock(self) -> Result<TryLock> {
        spawn_blocking(move || {
            let acquired = {
                // fslock::LockFile panics if the handle is already locked,
                // but the typestate makes locking a locked handle
                // unrepresentable.
                let mut inner = self.inner.blocking_lock();
                inner.try_lock().context("try lock file")?
            };
            if acquired {
                Ok(TryLock::Acquired(LockFile {
                    state: PhantomData,
                    inner: self.inner,
                    path: self.path,
                }))
            } else {
                Ok(TryLock::Contended(self))
            }
        })
        .await
        .context("join task")?
    }

    /// Lock the lockfile, blocking until the current holder releases it.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|file: &LockFile<Locked>| trace!(path = ?file.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|file: &LockFile<Unlocked>| trace!(path = ?file.path, "unlocked file"))
    }
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Buffer the file content from disk, or `None` if it doesn't exist.
#[instrument]
pub async fn read_optional(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8, or `None` if the
/// file doesn't exist.
#[instrument]
pub async fn read_optional_utf8(
    path: impl AsRef<Path> + std::fmt::Debug,
) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk, creating parent directories.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + std::fmt::Debug, content: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await.context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Remove a file or symlink; missing files are not an error.
#[instrument]
pub async fn remove_file_if_exists(path: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            trace!(?path, "removed file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

/// Remove the directory only if it is empty; non-empty and missing
/// directories are left alone.
#[instrument]
pub async fn remove_dir_if_empty(path: impl AsRef<Path> + std::fmt::Debug) -> Result<bool> {
    let path = path.as_ref();
    match tokio::fs::remove_dir(path).await {
        Ok(()) => {
            trace!(?path, "removed empty directory");
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        // DirectoryNotEmpty is not stable as an ErrorKind match on all
        // platforms we build for; treat any other error as "left in place"
        // only when the directory still exists.
        Err(err) => {
            if tokio::fs::metadata(path).await.is_ok() {
                trace!(?path, "directory not removed (not empty)");
                Ok(false)
            } else {
                Err(err).context(format!("remove directory: {path:?}"))
            }
        }
    }
}

/// Remove the directory and all its contents; missing directories are not
/// an error.
#[instrument]
pub async fn remove_dir_all(path: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Stat without following symlinks, or `None` if the path doesn't exist.
#[instrument]
pub async fn symlink_metadata_optional(
    path: impl AsRef<Path> + std::fmt::Debug,
) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat: {path:?}")),
    }
}

/// Copy the file from `src` to `dst`, creating parent directories.
/// Returns the number of bytes copied.
#[instrument]
pub async fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await.context("create parent directory")?;
    }
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("copy {src:?} to {dst:?}"))
        .tap_ok(|bytes| trace!(?src, ?dst, ?bytes, "copy file"))
}

/// Recreate a symlink at `dst` pointing wherever `src` points.
/// The link itself is copied; the target is not followed.
#[instrument]
pub async fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = tokio::fs::read_link(src)
        .await
        .with_context(|| format!("read link: {src:?}"))?;
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await.context("create parent directory")?;
    }
    remove_file_if_exists(dst).await?;
    #[cfg(unix)]
    tokio::fs::symlink(&target, dst)
        .await
        .with_context(|| format!("symlink {dst:?} -> {target:?}"))?;
    #[cfg(windows)]
    tokio::fs::symlink_file(&target, dst)
        .await
        .with_context(|| format!("symlink {dst:?} -> {target:?}"))?;
    trace!(?src, ?dst, ?target, "copied symlink");
    Ok(())
}

/// Milliseconds since the unix epoch for a file mtime. Pre-epoch mtimes are
/// negative.
pub fn mtime_millis(mtime: SystemTime) -> i64 {
    match mtime.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}
