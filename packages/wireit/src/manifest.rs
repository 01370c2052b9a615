//! File manifests: the stat snapshot of a set of paths.
//!
//! A manifest maps package-relative `/`-separated paths to `{t, m?, s?}`
//! entries. Manifests appear in fingerprints, in the persisted
//! previous-run state, and in freshness comparisons, so their serialized
//! form must stay stable.

use std::{collections::BTreeMap, path::Path};

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    fs,
    glob::{self, GlobError, PatternSet},
};

/// File type tag. Serialized single-character tags are part of the
/// on-disk and fingerprint formats.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum FileType {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "l")]
    Symlink,
    #[serde(rename = "b")]
    BlockDevice,
    #[serde(rename = "c")]
    CharDevice,
    #[serde(rename = "p")]
    Fifo,
    #[serde(rename = "s")]
    Socket,
    #[serde(rename = "?")]
    Unknown,
}

/// One manifest entry. `m` (mtime millis) and `s` (size) are omitted for
/// directories: their stat values churn without their contents changing.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileManifestEntry {
    #[serde(rename = "t")]
    pub kind: FileType,

    #[serde(rename = "m", skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,

    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl FileManifestEntry {
    pub fn is_directory(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileType::Symlink
    }

    /// Build an entry from stat metadata (taken without following links).
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let kind = kind_of(metadata);
        if kind == FileType::Directory {
            return Self { kind, mtime_ms: None, size: None };
        }
        Self {
            kind,
            mtime_ms: metadata.modified().ok().map(fs::mtime_millis),
            size: Some(metadata.len()),
        }
    }
}

fn kind_of(metadata: &std::fs::Metadata) -> FileType {
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        return FileType::Symlink;
    }
    if file_type.is_dir() {
        return FileType::Directory;
    }
    if file_type.is_file() {
        return FileType::File;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() {
            return FileType::BlockDevice;
        }
        if file_type.is_char_device() {
            return FileType::CharDevice;
        }
        if file_type.is_fifo() {
            return FileType::Fifo;
        }
        if file_type.is_socket() {
            return FileType::Socket;
        }
    }
    FileType::Unknown
}

/// Sorted map of package-relative path to entry.
pub type FileManifest = BTreeMap<String, FileManifestEntry>;

/// Error raised while gathering a manifest.
#[derive(Debug, Display, Error)]
pub enum ManifestError {
    /// Pattern expansion failed.
    #[display("{_0}")]
    Glob(GlobError),

    /// A listed path disappeared between listing and stat.
    #[display("file deleted between listing and stat: {path}")]
    FileDeleted { path: String },

    /// Stat failed for a listed path.
    #[display("failed to stat {path}: {message}")]
    Stat { path: String, message: String },
}

impl From<GlobError> for ManifestError {
    fn from(err: GlobError) -> Self {
        ManifestError::Glob(err)
    }
}

/// Expand `patterns` under `package_dir` and stat every match.
///
/// Listing and stat are separate passes so that a path deleted in between
/// is reported distinctly: fingerprinting surfaces that case as
/// `input-file-deleted-unexpectedly`.
#[instrument(skip(patterns))]
pub async fn gather(package_dir: &Path, patterns: &PatternSet) -> Result<FileManifest, ManifestError> {
    let listed = glob::walk(package_dir, patterns).await?;

    let mut manifest = FileManifest::new();
    for relative in listed {
        let absolute = package_dir.join(&relative);
        let metadata = fs::symlink_metadata_optional(&absolute)
            .await
            .map_err(|err| ManifestError::Stat {
                path: relative.clone(),
                message: format!("{err:#}"),
            })?
            .ok_or_else(|| ManifestError::FileDeleted { path: relative.clone() })?;
        manifest.insert(relative, FileManifestEntry::from_metadata(&metadata));
    }
    Ok(manifest)
}

/// The subset of `manifest` naming directories with no other manifest entry
/// beneath them. These are the directories an archive must reproduce
/// explicitly.
pub fn empty_directories(manifest: &FileManifest) -> Vec<String> {
    manifest
        .iter()
        .filter(|(path, entry)| {
            entry.is_directory()
                && !manifest.keys().any(|other| {
                    other.len() > path.len() + 1 && other.starts_with(path.as_str())
                        && other.as_bytes()[path.len()] == b'/'
                })
        })
        .map(|(path, _)| path.clone())
        .collect()
}
