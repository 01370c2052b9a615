//! Script fingerprints.
//!
//! A fingerprint is the canonical digest of everything that can affect a
//! script's output: platform, command, declared environment, the stat
//! manifest of its input files, and the fingerprints of its dependencies.
//! Two fully-tracked scripts with equal fingerprints are interchangeable;
//! that equality is what the freshness check and both cache backends key on.
//!
//! Determinism rules: maps are sorted before serialization, dependency
//! order is normalized, and absent optional fields serialize as `null`,
//! distinct from present-but-empty.

use std::{collections::BTreeMap, env, path::Path, sync::Arc};

use derive_more::{Display, Error};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tracing::{debug, instrument};

use crate::{
    config::{Clean, EnvValue, ScriptConfig},
    fs,
    glob::{GlobError, PatternSet},
    manifest::{self, FileManifest, FileManifestEntry, ManifestError},
};

/// Major version of this runtime. Folded into every fingerprint so that
/// upgrading the engine invalidates prior runs and cache entries.
const RUNTIME_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");

/// Marker recorded in place of a digest for `cascade: false` dependencies:
/// the dependency still orders execution, but its changes must not
/// invalidate the dependent.
const NON_CASCADING: &str = "non-cascading";

/// Why a script is not fully tracked. Not-fully-tracked scripts always run
/// and are never cached, but their fingerprints still compute so that
/// dependents can fold them in.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum NotFullyTrackedReason {
    /// The script does not declare its input files.
    NoInputGlobs,
    /// The script does not declare its output files.
    NoOutputGlobs,
    /// A transitive dependency is not fully tracked.
    Dependency { script: String },
}

/// One dependency's contribution to a fingerprint.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub struct DependencyFingerprint {
    #[serde(rename = "ref")]
    pub script: String,
    pub fingerprint: String,
    pub cascade: bool,
}

/// The service-relevant configuration folded into a fingerprint.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub struct ServiceFingerprint {
    pub ready_when: Option<String>,
    pub persistent: bool,
    pub cascade: bool,
}

/// The ordered record that is serialized and digested. Field order is part
/// of the format; do not reorder.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
struct FingerprintData {
    platform: String,
    architecture: String,
    runtime_version: String,
    command: Option<String>,
    extra_args: Vec<String>,
    clean: Clean,
    output_globs: Option<Vec<String>>,
    service: Option<ServiceFingerprint>,
    environment: BTreeMap<String, Option<String>>,
    files: Option<FileManifest>,
    dependencies: Vec<DependencyFingerprint>,
    not_fully_tracked: Option<NotFullyTrackedReason>,
}

/// Error raised while computing a fingerprint.
#[derive(Debug, Display, Error)]
pub enum FingerprintError {
    /// An input file disappeared between listing and stat.
    #[display("input file deleted unexpectedly: {path}")]
    InputFileDeleted { path: String },

    /// An input or output pattern escapes the package directory.
    #[display("pattern escapes the package directory: {pattern}")]
    PathEscape { pattern: String },

    /// I/O failed while gathering the input manifest.
    #[display("failed to gather file manifest: {message}")]
    Manifest { message: String },
}

impl From<ManifestError> for FingerprintError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::FileDeleted { path } => FingerprintError::InputFileDeleted { path },
            ManifestError::Glob(GlobError::PathEscape { pattern }) => {
                FingerprintError::PathEscape { pattern }
            }
            other => FingerprintError::Manifest { message: other.to_string() },
        }
    }
}

/// A computed fingerprint: the canonical record plus its SHA-256 digest.
///
/// Equality is digest equality. Fingerprints are shared (`Arc`) between an
/// execution and all of its dependents.
#[derive(Clone, Debug)]
pub struct Fingerprint {
    data: FingerprintData,
    digest: String,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Fingerprint {}

/// A dependency outcome handed to [`Fingerprint::compute`]: the
/// dependency's key string, its fingerprint, and the edge's cascade flag.
#[derive(Clone)]
pub struct DependencyResult {
    pub script: String,
    pub fingerprint: Arc<Fingerprint>,
    pub cascade: bool,
}

impl Fingerprint {
    /// Hex SHA-256 of the canonical serialization.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Whether every factor affecting this script's output is tracked.
    /// Only fully-tracked scripts are eligible for freshness and caching.
    pub fn is_fully_tracked(&self) -> bool {
        self.data.not_fully_tracked.is_none()
    }

    /// The input-file manifest observed at compute time.
    pub fn files(&self) -> Option<&FileManifest> {
        self.data.files.as_ref()
    }

    /// Compute the fingerprint for `config` given its dependencies'
    /// results, in dependency-declaration order.
    #[instrument(skip_all, fields(script = %config.reference))]
    pub async fn compute(
        config: &ScriptConfig,
        dep_results: &[DependencyResult],
    ) -> Result<Fingerprint, FingerprintError> {
        let mut not_fully_tracked = if config.files.is_none() {
            Some(NotFullyTrackedReason::NoInputGlobs)
        } else if config.output.is_none() {
            Some(NotFullyTrackedReason::NoOutputGlobs)
        } else {
            None
        };

        let mut dependencies = dep_results
            .iter()
            .map(|dep| DependencyFingerprint {
                script: dep.script.clone(),
                fingerprint: if dep.cascade {
                    dep.fingerprint.digest().to_string()
                } else {
                    NON_CASCADING.to_string()
                },
                cascade: dep.cascade,
            })
            .collect::<Vec<_>>();
        dependencies.sort_by(|a, b| a.script.cmp(&b.script));

        // Untracked dependencies poison the dependent regardless of the
        // cascade flag: the dependency may rewrite files this script reads.
        if not_fully_tracked.is_none() {
            if let Some(untracked) = dep_results.iter().find(|dep| !dep.fingerprint.is_fully_tracked())
            {
                not_fully_tracked = Some(NotFullyTrackedReason::Dependency {
                    script: untracked.script.clone(),
                });
            }
        }

        let output_globs = match &config.output {
            Some(patterns) => {
                let set = PatternSet::parse(patterns).map_err(|err| match err {
                    GlobError::PathEscape { pattern } => FingerprintError::PathEscape { pattern },
                    other => FingerprintError::Manifest { message: other.to_string() },
                })?;
                let mut normalized = set.normalized();
                normalized.sort();
                Some(normalized)
            }
            None => None,
        };

        let files = match &config.files {
            Some(patterns) => {
                let set = PatternSet::parse(patterns).map_err(|err| match err {
                    GlobError::PathEscape { pattern } => FingerprintError::PathEscape { pattern },
                    other => FingerprintError::Manifest { message: other.to_string() },
                })?;
                let mut gathered =
                    manifest::gather(&config.reference.package_dir, &set).await?;
                gather_package_locks(config, &mut gathered).await?;
                Some(gathered)
            }
            None => None,
        };

        let mut environment = BTreeMap::new();
        for (name, value) in &config.env {
            let observed = match value {
                EnvValue::Literal(literal) => Some(literal.clone()),
                EnvValue::External { .. } => env::var(name).ok(),
            };
            environment.insert(name.clone(), observed);
        }
        for name in &config.platform_envs {
            environment
                .entry(name.clone())
                .or_insert_with(|| env::var(name).ok());
        }

        let data = FingerprintData {
            platform: env::consts::OS.to_string(),
            architecture: env::consts::ARCH.to_string(),
            runtime_version: RUNTIME_MAJOR.to_string(),
            command: config.command.clone(),
            extra_args: config.extra_args.clone(),
            clean: config.clean,
            output_globs,
            service: config.service.as_ref().map(|service| ServiceFingerprint {
                ready_when: service.ready_when.clone(),
                persistent: service.persistent,
                cascade: service.cascade,
            }),
            environment,
            files,
            dependencies,
            not_fully_tracked,
        };

        let serialized =
            serde_json::to_vec(&data).map_err(|err| FingerprintError::Manifest {
                message: format!("serialize fingerprint: {err}"),
            })?;
        let digest = hex::encode(Sha256::digest(&serialized));
        debug!(%digest, fully_tracked = data.not_fully_tracked.is_none(), "computed fingerprint");

        Ok(Fingerprint { data, digest })
    }

    /// Describe the first field group where `self` differs from `other`.
    /// Diagnostic only; equality is always digest equality.
    pub fn difference(&self, other: &Fingerprint) -> Option<Difference> {
        let ours = &self.data;
        let theirs = &other.data;

        if (ours.platform != theirs.platform)
            || (ours.architecture != theirs.architecture)
            || (ours.runtime_version != theirs.runtime_version)
        {
            return Some(Difference::Platform);
        }
        if ours.command != theirs.command
            || ours.extra_args != theirs.extra_args
            || ours.clean != theirs.clean
        {
            return Some(Difference::Command);
        }
        if ours.output_globs != theirs.output_globs {
            return Some(Difference::OutputGlobs);
        }
        if ours.service != theirs.service {
            return Some(Difference::Service);
        }
        if ours.environment != theirs.environment {
            let name = first_map_difference(&ours.environment, &theirs.environment);
            return Some(Difference::Environment { name });
        }
        match (&ours.files, &theirs.files) {
            (Some(a), Some(b)) if a != b => {
                return Some(Difference::Files {
                    added: missing_keys(b, a),
                    removed: missing_keys(a, b),
                    changed: changed_keys(a, b),
                });
            }
            (Some(_), None) | (None, Some(_)) => {
                return Some(Difference::Files {
                    added: Vec::new(),
                    removed: Vec::new(),
                    changed: Vec::new(),
                });
            }
            _ => {}
        }
        if ours.dependencies != theirs.dependencies {
            return Some(Difference::Dependencies);
        }
        if ours.not_fully_tracked != theirs.not_fully_tracked {
            return Some(Difference::Tracking);
        }
        None
    }
}

/// Stat every configured lockfile name in the package directory and each
/// ancestor, folding found files into the manifest. Keys use `../` segments
/// so the entry is stable relative to the package.
async fn gather_package_locks(
    config: &ScriptConfig,
    manifest: &mut FileManifest,
) -> Result<(), FingerprintError> {
    let mut prefix = String::new();
    for dir in config.reference.package_dir.ancestors() {
        for name in &config.package_locks {
            let path = dir.join(name);
            let metadata = fs::symlink_metadata_optional(&path).await.map_err(|err| {
                FingerprintError::Manifest { message: format!("{err:#}") }
            })?;
            if let Some(metadata) = metadata {
                let key = format!("{prefix}{name}");
                manifest.insert(key, FileManifestEntry::from_metadata(&metadata));
            }
        }
        if is_filesystem_root(dir) {
            break;
        }
        prefix.push_str("../");
    }
    Ok(())
}

fn is_filesystem_root(dir: &Path) -> bool {
    dir.parent().is_none()
}

fn first_map_difference(
    a: &BTreeMap<String, Option<String>>,
    b: &BTreeMap<String, Option<String>>,
) -> String {
    for (key, value) in a {
        if b.get(key) != Some(value) {
            return key.clone();
        }
    }
    for key in b.keys() {
        if !a.contains_key(key) {
            return key.clone();
        }
    }
    String::new()
}

fn missing_keys(superset: &FileManifest, subset: &FileManifest) -> Vec<String> {
    superset
        .keys()
        .filter(|key| !subset.contains_key(*key))
        .cloned()
        .collect()
}

fn changed_keys(a: &FileManifest, b: &FileManifest) -> Vec<String> {
    a.iter()
        .filter(|(key, entry)| b.get(*key).is_some_and(|other| other != *entry))
        .map(|(key, _)| key.clone())
        .collect()
}

/// The first field group that differs between two fingerprints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Difference {
    Platform,
    Command,
    OutputGlobs,
    Service,
    Environment { name: String },
    Files {
        added: Vec<String>,
        removed: Vec<String>,
        changed: Vec<String>,
    },
    Dependencies,
    Tracking,
}
