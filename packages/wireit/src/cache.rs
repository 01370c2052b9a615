//! Cache abstractions for wireit.
//!
//! Two backends store script outputs keyed by fingerprint:
//! - **Local**: verbatim entry directories under each script's `.wireit`
//!   data directory.
//! - **Github**: the GitHub Actions artifact-cache service, for CI runs.
//!
//! Lookups return a [`CacheHit`] handle whose `apply` consumes it, so a hit
//! cannot be applied twice. Stores return a [`SetOutcome`]: every condition
//! a competing producer or the service can legitimately cause (lost race,
//! size cap, rate limit) is a decline, not an error.

pub mod archive;
mod github;
mod local;

use std::path::Path;

use color_eyre::Result;

pub use github::{GithubActionsCache, GithubCacheHit, cache_key};
pub use local::{LocalCache, LocalCacheHit};

use crate::{
    config::ScriptReference,
    data_dir::ScriptDataDir,
    fingerprint::Fingerprint,
    manifest::FileManifest,
    options::CacheMode,
};

/// The configured cache backend.
#[derive(Clone, Debug)]
pub enum Cache {
    Disabled,
    Local(LocalCache),
    Github(GithubActionsCache),
}

/// Result of a lookup.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(CacheHit),
    Miss,
    /// The remote service rate limited us and this was the first trip;
    /// callers surface one `cache-info` event. Later operations report
    /// plain misses.
    RateLimited,
}

/// Result of a store.
#[derive(Debug)]
pub enum SetOutcome {
    /// Durably committed.
    Stored,
    /// An entry for this fingerprint already exists locally.
    AlreadyPresent,
    /// Another producer won the remote reservation race.
    RaceLost,
    /// The archive exceeds the remote size cap.
    TooLarge { bytes: u64 },
    /// The remote service rate limited us and this was the first trip.
    RateLimited,
    /// Caching is disabled (sticky rate limit or `Cache::Disabled`).
    Disabled,
}

impl Cache {
    /// Build the backend selected by `mode`. The github backend requires
    /// the runner-provided environment and fails loudly without it.
    pub fn from_mode(mode: CacheMode) -> Result<Self> {
        match mode {
            CacheMode::None => Ok(Cache::Disabled),
            CacheMode::Local => Ok(Cache::Local(LocalCache)),
            CacheMode::Github => Ok(Cache::Github(GithubActionsCache::from_env()?)),
        }
    }

    pub async fn get(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
        data_dir: &ScriptDataDir,
    ) -> Result<CacheLookup> {
        match self {
            Cache::Disabled => Ok(CacheLookup::Miss),
            Cache::Local(local) => {
                let hit = local
                    .get(data_dir, fingerprint, script.package_dir.clone())
                    .await?;
                Ok(match hit {
                    Some(hit) => CacheLookup::Hit(CacheHit::Local(hit)),
                    None => CacheLookup::Miss,
                })
            }
            Cache::Github(github) => github.get(script, fingerprint, data_dir).await,
        }
    }

    pub async fn set(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
        outputs: &FileManifest,
        data_dir: &ScriptDataDir,
    ) -> Result<SetOutcome> {
        match self {
            Cache::Disabled => Ok(SetOutcome::Disabled),
            Cache::Local(local) => {
                local
                    .set(data_dir, fingerprint, outputs, package_dir(script))
                    .await
            }
            Cache::Github(github) => github.set(script, fingerprint, outputs, data_dir).await,
        }
    }
}

fn package_dir(script: &ScriptReference) -> &Path {
    script.package_dir.as_path()
}

/// A successful lookup, ready to restore outputs. Applying consumes the
/// handle.
#[derive(Debug)]
pub enum CacheHit {
    Local(LocalCacheHit),
    Github(GithubCacheHit),
}

impl CacheHit {
    pub async fn apply(self) -> Result<()> {
        match self {
            CacheHit::Local(hit) => hit.apply().await,
            CacheHit::Github(hit) => hit.apply().await,
        }
    }
}
