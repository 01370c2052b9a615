//! Glob pattern expansion.
//!
//! Pattern semantics:
//! - A leading `!` removes matches from the accumulated set; before any
//!   positive match it is a no-op.
//! - A leading `/` anchors at the package root (all patterns are
//!   package-relative, so this is an explicit spelling of the default).
//! - `**` matches across directory boundaries; `*` stays within a segment.
//! - Symlinks match as themselves and are never followed; traversal
//!   recurses only through real directories.
//!
//! Patterns that could resolve outside the package root are rejected.

use std::{
    collections::BTreeSet,
    path::{Component, Path, PathBuf},
};

use ::glob::{MatchOptions, Pattern};
use derive_more::{Display, Error};
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};
use walkdir::WalkDir;

/// Error raised while parsing or expanding a pattern list.
#[derive(Debug, Display, Error)]
pub enum GlobError {
    /// The pattern is not valid glob syntax.
    #[display("invalid pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },

    /// The pattern could resolve outside the package root.
    #[display("pattern escapes the package directory: {pattern:?}")]
    PathEscape { pattern: String },

    /// Directory traversal failed.
    #[display("failed to walk {path:?}: {message}")]
    Walk { path: PathBuf, message: String },

    /// A background task was cancelled.
    #[display("glob task cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
struct CompiledPattern {
    raw: String,
    negated: bool,
    pattern: Pattern,
}

/// An ordered, validated pattern list.
#[derive(Clone, Debug, Default)]
pub struct PatternSet {
    patterns: Vec<CompiledPattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl PatternSet {
    /// Parse and validate a pattern list, preserving order.
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self, GlobError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw = raw.as_ref();
            if raw.is_empty() || raw == "!" {
                continue;
            }

            let (negated, body) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            // `/foo` and `./foo` both anchor at the package root.
            let body = body.strip_prefix('/').unwrap_or(body);
            let body = body.strip_prefix("./").unwrap_or(body);

            if escapes_root(body) {
                return Err(GlobError::PathEscape { pattern: raw.to_string() });
            }

            let pattern = Pattern::new(body).map_err(|err| GlobError::Pattern {
                pattern: raw.to_string(),
                message: err.to_string(),
            })?;
            compiled.push(CompiledPattern {
                raw: raw.to_string(),
                negated,
                pattern,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// Whether the set contains any positive pattern. A set of only
    /// exclusions can never match anything.
    pub fn has_positive(&self) -> bool {
        self.patterns.iter().any(|pattern| !pattern.negated)
    }

    /// Apply include/exclude patterns in order to one package-relative
    /// `/`-separated path.
    pub fn matches(&self, relative: &str) -> bool {
        let mut included = false;
        for compiled in &self.patterns {
            if compiled.negated {
                if included && compiled.pattern.matches_with(relative, MATCH_OPTIONS) {
                    included = false;
                }
            } else if compiled.pattern.matches_with(relative, MATCH_OPTIONS) {
                included = true;
            }
        }
        included
    }

    /// The raw patterns, as provided.
    pub fn raw(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|pattern| pattern.raw.as_str())
    }

    /// Patterns in normalized form: anchors stripped, `!` preserved.
    /// This is the form that participates in fingerprints.
    pub fn normalized(&self) -> Vec<String> {
        self.patterns
            .iter()
            .map(|pattern| {
                if pattern.negated {
                    format!("!{}", pattern.pattern.as_str())
                } else {
                    pattern.pattern.as_str().to_string()
                }
            })
            .collect()
    }
}

fn escapes_root(pattern: &str) -> bool {
    Path::new(pattern)
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::RootDir))
}

/// Expand a pattern set to the sorted package-relative paths (files,
/// directories, symlinks, and special files) that currently match under
/// `package_dir`.
///
/// A missing package directory yields an empty result rather than an error:
/// output globs are routinely expanded before anything has been built.
#[instrument(skip(set))]
pub async fn walk(package_dir: &Path, set: &PatternSet) -> Result<BTreeSet<String>, GlobError> {
    if !set.has_positive() {
        return Ok(BTreeSet::new());
    }

    let root = package_dir.to_path_buf();
    let set = set.clone();
    spawn_blocking(move || walk_sync(&root, &set))
        .await
        .map_err(|_| GlobError::Cancelled)?
}

fn walk_sync(root: &Path, set: &PatternSet) -> Result<BTreeSet<String>, GlobError> {
    let mut matched = BTreeSet::new();
    if std::fs::symlink_metadata(root).is_err() {
        return Ok(matched);
    }

    // TODO: prune traversal using the literal prefixes of the positive
    // patterns instead of walking the whole package.
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| GlobError::Walk {
            path: err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            message: err.to_string(),
        })?;

        let relative = match entry.path().strip_prefix(root) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let Some(relative) = slash_join(relative) else {
            continue;
        };

        if set.matches(&relative) {
            trace!(path = %relative, "pattern match");
            matched.insert(relative);
        }
    }
    Ok(matched)
}

/// Join path components with `/` regardless of platform. Returns `None` for
/// paths that cannot be represented as UTF-8.
fn slash_join(path: &Path) -> Option<String> {
    let mut joined = String::new();
    for component in path.components() {
        let part = component.as_os_str().to_str()?;
        if !joined.is_empty() {
            joined.push('/');
        }
        joined.push_str(part);
    }
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(patterns: &[&str]) -> PatternSet {
        PatternSet::parse(patterns).unwrap()
    }

    async fn expand(root: &Path, patterns: &[&str]) -> Vec<String> {
        walk(root, &set(patterns)).await.unwrap().into_iter().collect()
    }

    #[tokio::test]
    async fn star_stays_within_a_segment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/a.ts"), b"").unwrap();
        std::fs::write(dir.path().join("src/nested/b.ts"), b"").unwrap();

        assert_eq!(expand(dir.path(), &["src/*.ts"]).await, vec!["src/a.ts"]);
        assert_eq!(
            expand(dir.path(), &["src/**/*.ts"]).await,
            vec!["src/a.ts", "src/nested/b.ts"]
        );
    }

    #[tokio::test]
    async fn exclusions_remove_prior_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.ts"), b"").unwrap();
        std::fs::write(dir.path().join("src/a.test.ts"), b"").unwrap();

        assert_eq!(
            expand(dir.path(), &["src/**", "!src/*.test.ts"]).await,
            vec!["src/a.ts"]
        );
    }

    #[tokio::test]
    async fn exclusion_before_any_positive_match_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), b"").unwrap();

        assert_eq!(expand(dir.path(), &["!a.ts", "*.ts"]).await, vec!["a.ts"]);
    }

    #[tokio::test]
    async fn leading_slash_anchors_at_package_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), b"").unwrap();

        assert_eq!(expand(dir.path(), &["/a.ts"]).await, vec!["a.ts"]);
    }

    #[test]
    fn parent_components_are_rejected() {
        let err = PatternSet::parse(&["../sibling/**"]).unwrap_err();
        assert!(matches!(err, GlobError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_match_but_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("real")).unwrap();
        std::fs::write(dir.path().join("real/file.txt"), b"").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let matched = expand(dir.path(), &["**"]).await;
        assert!(matched.contains(&"link".to_string()));
        assert!(matched.contains(&"real/file.txt".to_string()));
        // Nothing was listed through the link.
        assert!(!matched.contains(&"link/file.txt".to_string()));
    }

    #[tokio::test]
    async fn missing_package_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(expand(&missing, &["**"]).await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn exclusion_only_set_matches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), b"").unwrap();
        assert_eq!(expand(dir.path(), &["!a.ts"]).await, Vec::<String>::new());
    }
}
