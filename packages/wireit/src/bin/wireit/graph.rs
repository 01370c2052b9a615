//! Loading an analyzed script graph from disk.
//!
//! The configuration analyzer is a separate concern; this module consumes
//! its output: a JSON file listing every script with its command, globs,
//! dependencies (by `<package>:<name>` id), and service semantics. Loading
//! resolves the flat list into shared [`ScriptConfig`] nodes and rejects
//! unknown references and cycles, so the engine only ever sees a valid
//! graph.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::Deserialize;

use wireit::config::{Clean, Dependency, EnvValue, ScriptConfig, ScriptReference, ServiceConfig};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GraphFile {
    scripts: Vec<ScriptEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ScriptEntry {
    /// Package directory, relative to the graph file.
    package: PathBuf,
    name: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    extra_args: Vec<String>,
    #[serde(default)]
    dependencies: Vec<DependencyEntry>,
    #[serde(default)]
    files: Option<Vec<String>>,
    #[serde(default)]
    output: Option<Vec<String>>,
    #[serde(default)]
    clean: Clean,
    #[serde(default)]
    service: Option<ServiceEntry>,
    #[serde(default)]
    package_locks: Option<Vec<String>>,
    #[serde(default)]
    env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    platform_envs: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependencyEntry {
    /// `"<package>:<name>"`, cascading by default.
    Id(String),
    Full {
        script: String,
        #[serde(default = "default_cascade")]
        cascade: bool,
    },
}

fn default_cascade() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ServiceEntry {
    #[serde(default)]
    ready_when: Option<String>,
    #[serde(default = "default_cascade")]
    cascade: bool,
    #[serde(default)]
    persistent: bool,
}

/// A fully resolved graph.
#[derive(Debug)]
pub struct Graph {
    scripts: HashMap<String, Arc<ScriptConfig>>,
}

impl Graph {
    pub fn resolve(&self, id: &str) -> Result<Arc<ScriptConfig>> {
        match self.scripts.get(id) {
            Some(config) => Ok(config.clone()),
            None => {
                let mut known = self.scripts.keys().cloned().collect::<Vec<_>>();
                known.sort();
                bail!("unknown script {id:?}; graph defines: {}", known.join(", "))
            }
        }
    }
}

/// Load and resolve a graph file.
pub async fn load(path: &Path) -> Result<Graph> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read graph file: {path:?}"))?;
    let file: GraphFile = serde_json::from_slice(&raw)
        .with_context(|| format!("parse graph file: {path:?}"))?;

    let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let base = std::path::absolute(&base)
        .with_context(|| format!("absolutize graph directory: {base:?}"))?;

    let mut entries = HashMap::new();
    for entry in file.scripts {
        let id = script_id(&entry.package, &entry.name);
        if entries.insert(id.clone(), entry).is_some() {
            bail!("duplicate script in graph: {id:?}");
        }
    }

    let mut resolved = HashMap::new();
    let ids = entries.keys().cloned().collect::<Vec<_>>();
    for id in ids {
        build(&id, &base, &entries, &mut resolved, &mut Vec::new())?;
    }
    Ok(Graph { scripts: resolved })
}

fn script_id(package: &Path, name: &str) -> String {
    format!("{}:{name}", package.display())
}

fn build(
    id: &str,
    base: &Path,
    entries: &HashMap<String, ScriptEntry>,
    resolved: &mut HashMap<String, Arc<ScriptConfig>>,
    visiting: &mut Vec<String>,
) -> Result<Arc<ScriptConfig>> {
    if let Some(existing) = resolved.get(id) {
        return Ok(existing.clone());
    }
    if visiting.iter().any(|seen| seen == id) {
        bail!("dependency cycle: {} -> {id}", visiting.join(" -> "));
    }
    let Some(entry) = entries.get(id) else {
        bail!("unknown script referenced: {id:?}");
    };

    visiting.push(id.to_string());
    let mut dependencies = Vec::new();
    for dependency in &entry.dependencies {
        let (dep_id, cascade) = match dependency {
            DependencyEntry::Id(dep_id) => (dep_id.as_str(), true),
            DependencyEntry::Full { script, cascade } => (script.as_str(), *cascade),
        };
        let config = build(dep_id, base, entries, resolved, visiting)
            .with_context(|| format!("resolve dependency {dep_id:?} of {id:?}"))?;
        dependencies.push(Dependency { config, cascade });
    }
    visiting.pop();

    let reference = ScriptReference::new(base.join(&entry.package), entry.name.clone());
    let package_locks = entry
        .package_locks
        .clone()
        .unwrap_or_else(|| vec!["package-lock.json".to_string()]);
    let config = Arc::new(
        ScriptConfig::builder()
            .reference(reference)
            .maybe_command(entry.command.clone())
            .extra_args(entry.extra_args.clone())
            .dependencies(dependencies)
            .maybe_files(entry.files.clone())
            .maybe_output(entry.output.clone())
            .clean(entry.clean)
            .maybe_service(entry.service.as_ref().map(|service| {
                ServiceConfig::builder()
                    .maybe_ready_when(service.ready_when.clone())
                    .cascade(service.cascade)
                    .persistent(service.persistent)
                    .build()
            }))
            .package_locks(package_locks)
            .env(entry.env.clone())
            .platform_envs(entry.platform_envs.clone())
            .build(),
    );

    resolved.insert(id.to_string(), config.clone());
    Ok(config)
}
