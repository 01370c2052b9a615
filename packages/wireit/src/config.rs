//! Validated script configuration.
//!
//! Values of these types are produced by an external analyzer (the `wireit`
//! binary ships a JSON graph loader playing that role). By the time a
//! [`ScriptConfig`] reaches the executor, cross-package references have been
//! resolved into shared [`Dependency`] nodes and cycles have been rejected.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifies one script: the package directory it lives in plus its name.
///
/// Equality is by value; two references to the same `(package_dir, name)`
/// pair identify the same script regardless of how they were reached.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("{}:{}", package_dir.display(), name)]
pub struct ScriptReference {
    /// Absolute path of the package directory containing the script.
    pub package_dir: PathBuf,

    /// The script's name within its package.
    pub name: String,
}

impl ScriptReference {
    pub fn new(package_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            package_dir: package_dir.into(),
            name: name.into(),
        }
    }

    /// The canonical map-key form: `package_dir`, a NUL byte, then `name`.
    ///
    /// NUL cannot appear in either component, so the encoding is unambiguous.
    pub fn key(&self) -> ScriptKey {
        ScriptKey(format!("{}\0{}", self.package_dir.display(), self.name))
    }
}

/// The stringified form of a [`ScriptReference`], used as a map key and as
/// the input to the remote cache key digest.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ScriptKey(String);

impl ScriptKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// When to delete stale output files before running a script.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub enum Clean {
    /// Delete everything matching the output globs before each run.
    #[default]
    #[serde(rename = "true")]
    Always,

    /// Never delete outputs.
    #[serde(rename = "false")]
    Never,

    /// Delete outputs only when an input file from the previous run's
    /// manifest no longer exists.
    #[serde(rename = "if-file-deleted")]
    IfFileDeleted,
}

/// A declared environment variable value.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// A fixed value, passed to the child process and folded into the
    /// fingerprint as-is.
    Literal(String),

    /// The value is whatever the parent environment holds at fingerprint
    /// time (possibly unset). Not passed to the child beyond normal
    /// inheritance.
    External {
        external: bool,
    },
}

/// Service semantics for a long-running script.
#[derive(Clone, Eq, PartialEq, Debug, Builder, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// When set, the service is considered ready only once a stdout line
    /// matches this regex. Otherwise the service is ready as soon as its
    /// process starts.
    pub ready_when: Option<String>,

    /// Whether this service's fingerprint participates in its consumers'
    /// fingerprints.
    #[builder(default = true)]
    #[serde(default = "default_true")]
    pub cascade: bool,

    /// Persistent services live for the whole invocation (or watch
    /// session); non-persistent ones stop when their last consumer's run
    /// completes.
    #[builder(default)]
    #[serde(default)]
    pub persistent: bool,
}

fn default_true() -> bool {
    true
}

/// An edge to another script this one depends on.
#[derive(Clone, Debug)]
pub struct Dependency {
    /// The dependency's configuration. Shared: a diamond in the graph is one
    /// node reached twice.
    pub config: Arc<ScriptConfig>,

    /// When `false`, the dependency still runs first but its fingerprint
    /// does not invalidate this script.
    pub cascade: bool,
}

/// Fully-analyzed configuration for one script.
#[derive(Clone, Debug, Builder)]
pub struct ScriptConfig {
    /// The script this configuration belongs to.
    pub reference: ScriptReference,

    /// The shell command to run, if any. Scripts without a command exist
    /// purely to group dependencies.
    pub command: Option<String>,

    /// Extra arguments appended (shell-quoted) to the command.
    #[builder(default)]
    pub extra_args: Vec<String>,

    /// Scripts that must reach a terminal state before this one runs.
    #[builder(default)]
    pub dependencies: Vec<Dependency>,

    /// Input file glob patterns, package-relative. `None` means the script
    /// did not declare its inputs, which makes it not fully tracked.
    pub files: Option<Vec<String>>,

    /// Output file glob patterns, package-relative. `None` means undeclared
    /// outputs, which makes the script not fully tracked.
    pub output: Option<Vec<String>>,

    /// Stale-output deletion policy.
    #[builder(default)]
    pub clean: Clean,

    /// Service semantics; `None` for ordinary scripts.
    pub service: Option<ServiceConfig>,

    /// Sibling lockfile names consulted in this package's directory and
    /// every ancestor directory when fingerprinting.
    #[builder(default = vec![String::from("package-lock.json")])]
    pub package_locks: Vec<String>,

    /// Declared environment variables whose values participate in the
    /// fingerprint.
    #[builder(default)]
    pub env: BTreeMap<String, EnvValue>,

    /// Additional variable names whose parent-environment values (or
    /// absence) participate in the fingerprint.
    #[builder(default)]
    pub platform_envs: BTreeSet<String>,
}

impl ScriptConfig {
    /// Whether this script runs as a service.
    pub fn is_service(&self) -> bool {
        self.service.is_some()
    }
}
