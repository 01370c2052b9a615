//! Gzipped tarballs of script outputs.
//!
//! Archives hold regular files and symlinks. Empty directories are listed
//! in a JSON manifest stored inside the archive at a reserved path and
//! recreated on extraction, so they survive the round trip; non-empty
//! directories are implied by their contents. Extraction refuses entries
//! that would land outside the destination.

use std::{
    io::Read,
    path::{Component, Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, warn};

use crate::manifest::{self, FileManifest, FileType};

/// Reserved in-archive path for the empty-directory manifest. Extraction
/// consumes this entry; it never lands in the package directory.
pub const EMPTY_DIR_MANIFEST_PATH: &str = ".wireit-empty-directories.json";

/// Archive the manifest's entries from `package_dir` into a gzipped
/// tarball at `destination`. Returns the archive size in bytes.
#[instrument(skip(outputs))]
pub async fn create(
    package_dir: &Path,
    outputs: &FileManifest,
    destination: &Path,
) -> Result<u64> {
    let package_dir = package_dir.to_path_buf();
    let outputs = outputs.clone();
    let destination = destination.to_path_buf();
    spawn_blocking(move || create_sync(&package_dir, &outputs, &destination))
        .await
        .context("join archive task")?
}

fn create_sync(package_dir: &Path, outputs: &FileManifest, destination: &Path) -> Result<u64> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).context("create archive directory")?;
    }
    let file = std::fs::File::create(destination)
        .with_context(|| format!("create archive: {destination:?}"))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let empty_dirs = manifest::empty_directories(outputs);
    let serialized = serde_json::to_vec(&empty_dirs).context("serialize empty dirs")?;
    let mut header = tar::Header::new_gnu();
    header.set_size(serialized.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, EMPTY_DIR_MANIFEST_PATH, serialized.as_slice())
        .context("append empty-directory manifest")?;

    for (relative, entry) in outputs {
        let source = package_dir.join(relative);
        match entry.kind {
            FileType::File => {
                builder
                    .append_path_with_name(&source, relative)
                    .with_context(|| format!("archive {relative}"))?;
            }
            FileType::Symlink => {
                let target = std::fs::read_link(&source)
                    .with_context(|| format!("read link {relative}"))?;
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder
                    .append_link(&mut header, relative, &target)
                    .with_context(|| format!("archive link {relative}"))?;
            }
            FileType::Directory => {
                // Non-empty directories are implied; empty ones are in the
                // manifest entry written above.
            }
            other => {
                warn!(path = %relative, kind = ?other, "skipping special file in archive");
            }
        }
    }

    let encoder = builder.into_inner().context("finish tar stream")?;
    let file = encoder.finish().context("finish gzip stream")?;
    let size = file
        .metadata()
        .with_context(|| format!("stat archive: {destination:?}"))?
        .len();
    debug!(?destination, size, "created archive");
    Ok(size)
}

/// Extract a gzipped tarball produced by [`create`] into `package_dir`,
/// including synthesizing the listed empty directories.
#[instrument]
pub async fn extract(archive: &Path, package_dir: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let package_dir = package_dir.to_path_buf();
    spawn_blocking(move || extract_sync(&archive, &package_dir))
        .await
        .context("join extract task")?
}

fn extract_sync(archive_path: &Path, package_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("open archive: {archive_path:?}"))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_mtime(true);

    let mut empty_dirs: Vec<String> = Vec::new();
    for entry in archive.entries().context("read archive entries")? {
        let mut entry = entry.context("read archive entry")?;
        let path = entry.path().context("read entry path")?.into_owned();
        if path == Path::new(EMPTY_DIR_MANIFEST_PATH) {
            let mut raw = String::new();
            entry
                .read_to_string(&mut raw)
                .context("read empty-directory manifest")?;
            empty_dirs = serde_json::from_str(&raw).context("parse empty-directory manifest")?;
            continue;
        }
        let unpacked = entry
            .unpack_in(package_dir)
            .with_context(|| format!("unpack {path:?}"))?;
        if !unpacked {
            bail!("archive entry escapes destination: {path:?}");
        }
    }

    for dir in empty_dirs {
        let Some(relative) = safe_relative(&dir) else {
            bail!("empty-directory entry escapes destination: {dir:?}");
        };
        std::fs::create_dir_all(package_dir.join(relative))
            .with_context(|| format!("recreate empty directory {dir:?}"))?;
    }
    Ok(())
}

/// Accept only plain relative paths: no parent components, no absolute
/// anchors.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(clean)
}
