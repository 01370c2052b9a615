//! Local filesystem cache backend.
//!
//! Entries live inside the owning script's data directory at
//! `cache/<fingerprint digest>/` and are verbatim copies of the output
//! entries: files, symlinks (as links), and directories (so empty
//! directories survive). `set` refuses to overwrite an existing entry;
//! losing that race is a decline, not an error.

use std::path::PathBuf;

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument, trace, warn};

use crate::{
    data_dir::ScriptDataDir,
    fingerprint::Fingerprint,
    fs,
    glob::PatternSet,
    manifest::{self, FileManifest, FileType},
};

use super::SetOutcome;

#[derive(Clone, Debug, Default)]
pub struct LocalCache;

/// A local hit: the entry directory to copy back from.
#[derive(Debug)]
pub struct LocalCacheHit {
    entry_dir: PathBuf,
    package_dir: PathBuf,
}

impl LocalCache {
    #[instrument(skip_all, fields(digest = %fingerprint.digest()))]
    pub async fn get(
        &self,
        data_dir: &ScriptDataDir,
        fingerprint: &Fingerprint,
        package_dir: PathBuf,
    ) -> Result<Option<LocalCacheHit>> {
        let entry_dir = data_dir.cache_dir().join(fingerprint.digest());
        match fs::symlink_metadata_optional(&entry_dir).await? {
            Some(metadata) if metadata.is_dir() => {
                debug!(?entry_dir, "local cache hit");
                Ok(Some(LocalCacheHit { entry_dir, package_dir }))
            }
            _ => Ok(None),
        }
    }

    #[instrument(skip_all, fields(digest = %fingerprint.digest()))]
    pub async fn set(
        &self,
        data_dir: &ScriptDataDir,
        fingerprint: &Fingerprint,
        outputs: &FileManifest,
        package_dir: &std::path::Path,
    ) -> Result<SetOutcome> {
        let entry_dir = data_dir.cache_dir().join(fingerprint.digest());
        fs::create_dir_all(data_dir.cache_dir()).await?;

        // Creating the entry directory is the reservation: only one
        // producer can win, and an existing entry is never overwritten.
        match tokio::fs::create_dir(&entry_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                trace!(?entry_dir, "local cache entry already present");
                return Ok(SetOutcome::AlreadyPresent);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create cache entry: {entry_dir:?}"));
            }
        }

        for (relative, entry) in outputs {
            let source = package_dir.join(relative);
            let target = entry_dir.join(relative);
            match entry.kind {
                FileType::File => {
                    fs::copy_file(&source, &target).await?;
                }
                FileType::Symlink => {
                    fs::copy_symlink(&source, &target).await?;
                }
                FileType::Directory => {
                    fs::create_dir_all(&target).await?;
                }
                other => {
                    warn!(path = %relative, kind = ?other, "skipping special file in cache entry");
                }
            }
        }
        debug!(?entry_dir, entries = outputs.len(), "stored local cache entry");
        Ok(SetOutcome::Stored)
    }
}

impl LocalCacheHit {
    /// Copy the entry's contents back into the package directory.
    /// Consumes the handle: a hit can only be applied once.
    #[instrument(skip_all, fields(entry = ?self.entry_dir))]
    pub async fn apply(self) -> Result<()> {
        let everything = PatternSet::parse(&["**"]).expect("valid pattern");
        let entries = manifest::gather(&self.entry_dir, &everything)
            .await
            .map_err(|err| color_eyre::eyre::eyre!("list cache entry: {err}"))?;

        for (relative, entry) in &entries {
            let source = self.entry_dir.join(relative);
            let target = self.package_dir.join(relative);
            match entry.kind {
                FileType::File => {
                    fs::copy_file(&source, &target).await?;
                }
                FileType::Symlink => {
                    fs::copy_symlink(&source, &target).await?;
                }
                FileType::Directory => {
                    fs::create_dir_all(&target).await?;
                }
                other => {
                    warn!(path = %relative, kind = ?other, "skipping special file in cache entry");
                }
            }
        }
        debug!(entries = entries.len(), "restored outputs from local cache");
        Ok(())
    }
}
