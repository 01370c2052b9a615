//! Run-level options and their environment-variable parsing.
//!
//! `WIREIT_PARALLEL` bounds concurrent commands (`infinity` allowed),
//! `WIREIT_CACHE` selects the cache backend (`none` by default on CI), and
//! `WIREIT_FAILURES` selects what happens after the first failure.

use std::str::FromStr;

use color_eyre::{Result, eyre::bail};
use strum::EnumString;

use crate::{ci, pool::Parallelism};

/// What happens to the rest of the run when a script fails.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FailureMode {
    /// In-flight commands finish; no new command starts.
    #[default]
    NoNew,
    /// Scripts not depending on the failure keep running.
    Continue,
    /// Running commands are killed too.
    Kill,
}

/// Which cache backend to use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CacheMode {
    None,
    Local,
    Github,
}

impl CacheMode {
    /// `local` for interactive use; `none` on CI.
    pub fn default_for_environment() -> Self {
        if ci::is_ci() { CacheMode::None } else { CacheMode::Local }
    }
}

/// Options for one invocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Options {
    pub parallelism: Parallelism,
    pub cache_mode: CacheMode,
    pub failure_mode: FailureMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            parallelism: Parallelism::default(),
            cache_mode: CacheMode::default_for_environment(),
            failure_mode: FailureMode::default(),
        }
    }
}

impl Options {
    /// Read `WIREIT_PARALLEL`, `WIREIT_CACHE`, and `WIREIT_FAILURES`.
    /// Unset variables take their defaults; set-but-invalid values are
    /// errors rather than silent fallbacks.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            parallelism: parse_parallelism(std::env::var("WIREIT_PARALLEL").ok().as_deref())?,
            cache_mode: parse_cache_mode(std::env::var("WIREIT_CACHE").ok().as_deref())?,
            failure_mode: parse_failure_mode(std::env::var("WIREIT_FAILURES").ok().as_deref())?,
        })
    }
}

pub fn parse_parallelism(value: Option<&str>) -> Result<Parallelism> {
    match value.map(str::trim) {
        None | Some("") => Ok(Parallelism::default()),
        Some(raw) if raw.eq_ignore_ascii_case("infinity") => Ok(Parallelism::Unbounded),
        Some(raw) => match raw.parse::<usize>() {
            Ok(bound) if bound > 0 => Ok(Parallelism::Bounded(bound)),
            _ => bail!("WIREIT_PARALLEL must be a positive integer or \"infinity\", got {raw:?}"),
        },
    }
}

pub fn parse_cache_mode(value: Option<&str>) -> Result<CacheMode> {
    match value.map(str::trim) {
        None | Some("") => Ok(CacheMode::default_for_environment()),
        Some(raw) => match CacheMode::from_str(raw) {
            Ok(mode) => Ok(mode),
            Err(_) => bail!("WIREIT_CACHE must be one of none|local|github, got {raw:?}"),
        },
    }
}

pub fn parse_failure_mode(value: Option<&str>) -> Result<FailureMode> {
    match value.map(str::trim) {
        None | Some("") => Ok(FailureMode::default()),
        Some(raw) => match FailureMode::from_str(raw) {
            Ok(mode) => Ok(mode),
            Err(_) => bail!("WIREIT_FAILURES must be one of no-new|continue|kill, got {raw:?}"),
        },
    }
}
