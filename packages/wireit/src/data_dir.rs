//! The per-script `.wireit` data directory.
//!
//! Layout, relative to the script's package:
//!
//! ```text
//! .wireit/
//!   <hex(script_name)>/
//!     state              # last successful fingerprint digest, hex
//!     manifest           # JSON {inputs, outputs} file-manifest maps
//!     lock               # advisory cross-process lock
//!     cache/<hex(fp)>/   # local cache entries
//!     temp/              # tarball assembly and extraction scratch
//! ```
//!
//! The script name is hex-encoded so arbitrary script names (`:`, `/`,
//! spaces) produce valid directory names.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{config::ScriptReference, fs, manifest::FileManifest};

/// The manifests persisted after a successful run: the inputs observed by
/// the fingerprint (consulted by `clean: if-file-deleted`) and the outputs
/// produced (consulted by the freshness check).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousRun {
    pub inputs: FileManifest,
    pub outputs: FileManifest,
}

/// Handle to one script's data directory.
#[derive(Clone, Debug)]
pub struct ScriptDataDir {
    root: PathBuf,
}

impl ScriptDataDir {
    pub fn new(reference: &ScriptReference) -> Self {
        let encoded = hex::encode(reference.name.as_bytes());
        Self {
            root: reference.package_dir.join(".wireit").join(encoded),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.root.join("manifest")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("lock")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// The fingerprint digest of the last successful run, if any.
    #[instrument(skip(self), fields(root = ?self.root))]
    pub async fn read_state(&self) -> Result<Option<String>> {
        let state = fs::read_optional_utf8(self.state_file())
            .await
            .context("read state file")?;
        Ok(state.map(|digest| digest.trim().to_string()))
    }

    /// Record a successful run's fingerprint digest.
    pub async fn write_state(&self, digest: &str) -> Result<()> {
        fs::write(self.state_file(), digest).await.context("write state file")
    }

    /// Forget the previous run. Called before spawning a command so an
    /// interrupted run can never be mistaken for fresh.
    pub async fn clear_state(&self) -> Result<()> {
        fs::remove_file_if_exists(self.state_file())
            .await
            .context("clear state file")
    }

    /// The manifests persisted by the last successful run. A corrupt
    /// manifest file reads as absent: the script just reruns.
    #[instrument(skip(self), fields(root = ?self.root))]
    pub async fn read_manifest(&self) -> Result<Option<PreviousRun>> {
        let Some(raw) = fs::read_optional(self.manifest_file())
            .await
            .context("read manifest file")?
        else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(previous) => Ok(Some(previous)),
            Err(err) => {
                warn!(?err, "ignoring unreadable manifest file");
                Ok(None)
            }
        }
    }

    pub async fn write_manifest(&self, previous: &PreviousRun) -> Result<()> {
        let serialized = serde_json::to_vec(previous).context("serialize manifest")?;
        fs::write(self.manifest_file(), serialized)
            .await
            .context("write manifest file")
    }

    /// Create and return the scratch directory.
    pub async fn ensure_temp_dir(&self) -> Result<PathBuf> {
        let temp = self.temp_dir();
        fs::create_dir_all(&temp).await?;
        Ok(temp)
    }
}
