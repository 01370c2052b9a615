//! Execution of ordinary (non-service) scripts.
//!
//! The lifecycle runs strictly in this order: dependencies, fingerprint,
//! freshness check, cache lookup, cross-process lock, clean, worker slot,
//! spawn, output streaming, state/manifest persistence, cache store,
//! terminal event. Scripts without a command stop after the fingerprint.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument, warn};

use crate::{
    config::{Clean, ScriptConfig},
    data_dir::{PreviousRun, ScriptDataDir},
    event::{CacheCondition, Event, EventKind, FailureReason, InfoReason, SuccessReason},
    execution::{self, ExecContext, ExecutionOutcome},
    executor::ExecutorInner,
    fingerprint::Fingerprint,
    fs::{self, TryLock},
    glob::PatternSet,
    manifest::{self, FileManifest, FileType},
    process::{ExitResult, ScriptChild, signal_name},
};

/// Standard-execution states, for tracing. The async control flow below is
/// the machine; this enum names where it is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Initial,
    ExecutingDeps,
    Fingerprinting,
    CheckingFreshness,
    Locked,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

pub(crate) struct StandardExecution;

impl StandardExecution {
    #[instrument(skip_all, fields(script = %ctx.config.reference))]
    pub(crate) async fn run(ctx: ExecContext) -> Result<ExecutionOutcome> {
        let Some(inner) = ctx.executor.upgrade() else {
            return Ok(ExecutionOutcome::Failure);
        };
        let config = ctx.config;
        let script = config.reference.clone();
        let key = script.key().as_str().to_string();
        let mut state = State::Initial;

        transition(&mut state, State::ExecutingDeps);
        let deps = match execution::execute_dependencies(&inner, &config).await {
            Ok(deps) => deps,
            Err(()) => {
                execution::emit_start_cancelled(&inner, &config);
                transition(&mut state, State::Cancelled);
                return Ok(ExecutionOutcome::Failure);
            }
        };
        if inner.abort.is_aborted() {
            transition(&mut state, State::Cancelled);
            return Ok(ExecutionOutcome::Failure);
        }

        transition(&mut state, State::Fingerprinting);
        let dep_results = deps.iter().map(|dep| dep.result.clone()).collect::<Vec<_>>();
        let fingerprint = match Fingerprint::compute(&config, &dep_results).await {
            Ok(fingerprint) => Arc::new(fingerprint),
            Err(error) => {
                let reason = execution::fingerprint_failure(&error);
                inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                inner.record_failure(&script, &reason);
                transition(&mut state, State::Failed);
                return Ok(ExecutionOutcome::Failure);
            }
        };
        inner.record_fingerprint(&key, fingerprint.clone());

        // A script that failed last watch iteration and is byte-identical
        // now would just fail again; report without rerunning.
        if inner.previous_failures.get(&key).map(String::as_str) == Some(fingerprint.digest()) {
            let reason = FailureReason::FailedPreviousWatchIteration;
            inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
            inner.record_failure(&script, &reason);
            inner.record_failed_digest(&key, fingerprint.digest());
            transition(&mut state, State::Failed);
            return Ok(ExecutionOutcome::Failure);
        }

        let Some(_command) = config.command.as_deref() else {
            inner.log(Event::new(&script, EventKind::Success(SuccessReason::NoCommand)));
            transition(&mut state, State::Succeeded);
            return Ok(ExecutionOutcome::Success(fingerprint));
        };

        let data_dir = ScriptDataDir::new(&script);
        transition(&mut state, State::CheckingFreshness);

        if fingerprint.is_fully_tracked() {
            if let Some(outcome) =
                Self::fresh_or_cached(&inner, &config, &fingerprint, &data_dir).await?
            {
                transition(&mut state, State::Succeeded);
                inner.log(Event::new(&script, EventKind::Success(outcome)));
                return Ok(ExecutionOutcome::Success(fingerprint));
            }
        }

        // Cross-process exclusion for this script's data dir and outputs.
        let lock = fs::LockFile::open(data_dir.lock_file()).await?;
        let _lock = match lock.try_lock().await? {
            TryLock::Acquired(locked) => locked,
            TryLock::Contended(unlocked) => {
                inner.log(Event::new(&script, EventKind::Info(InfoReason::Locked)));
                let locked = unlocked.lock().await?;
                // Whoever held the lock may have produced exactly what we
                // were about to build.
                if fingerprint.is_fully_tracked() {
                    if let Some(outcome) =
                        Self::fresh_or_cached(&inner, &config, &fingerprint, &data_dir).await?
                    {
                        transition(&mut state, State::Succeeded);
                        inner.log(Event::new(&script, EventKind::Success(outcome)));
                        return Ok(ExecutionOutcome::Success(fingerprint));
                    }
                }
                locked
            }
        };
        transition(&mut state, State::Locked);

        clean_outputs(&config, &data_dir).await?;
        data_dir.clear_state().await?;

        let slot = match inner.pool.acquire(&inner.abort).await {
            Ok(slot) => slot,
            Err(_aborted) => {
                transition(&mut state, State::Cancelled);
                return Ok(ExecutionOutcome::Failure);
            }
        };

        transition(&mut state, State::Running);
        inner.log(Event::new(&script, EventKind::Info(InfoReason::Running)));
        let mut child = match ScriptChild::spawn(&config) {
            Ok(child) => child,
            Err(error) => {
                let reason = FailureReason::SpawnError { message: format!("{error:#}") };
                inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                inner.record_failure(&script, &reason);
                inner.record_failed_digest(&key, fingerprint.digest());
                transition(&mut state, State::Failed);
                return Ok(ExecutionOutcome::Failure);
            }
        };

        let output = child.output();
        let mut output_open = true;
        let status = loop {
            tokio::select! {
                chunk = output.recv_async(), if output_open => match chunk {
                    Ok(chunk) => inner.log(Event::new(
                        &script,
                        EventKind::Output { stream: chunk.stream, data: chunk.data },
                    )),
                    Err(_) => output_open = false,
                },
                status = child.wait_status() => {
                    // Drain whatever the pumps buffered before the exit is
                    // observable.
                    while let Ok(chunk) = output.recv_async().await {
                        inner.log(Event::new(
                            &script,
                            EventKind::Output { stream: chunk.stream, data: chunk.data },
                        ));
                    }
                    break status?;
                }
                _ = inner.abort.kill_signalled() => {
                    child.kill().await?;
                    while let Ok(chunk) = output.recv_async().await {
                        inner.log(Event::new(
                            &script,
                            EventKind::Output { stream: chunk.stream, data: chunk.data },
                        ));
                    }
                    inner.log(Event::new(&script, EventKind::Failure(FailureReason::Killed)));
                    transition(&mut state, State::Failed);
                    return Ok(ExecutionOutcome::Failure);
                }
            }
        };
        drop(slot);

        match status {
            ExitResult::Exited { code: 0 } => {}
            ExitResult::Exited { code } => {
                let reason = FailureReason::ExitNonZero { status: code };
                inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                inner.record_failure(&script, &reason);
                inner.record_failed_digest(&key, fingerprint.digest());
                transition(&mut state, State::Failed);
                return Ok(ExecutionOutcome::Failure);
            }
            ExitResult::Signalled { signal } => {
                let reason = FailureReason::Signalled { signal: signal_name(signal) };
                inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                inner.record_failure(&script, &reason);
                inner.record_failed_digest(&key, fingerprint.digest());
                transition(&mut state, State::Failed);
                return Ok(ExecutionOutcome::Failure);
            }
        }

        let outputs = match gather_outputs(&config).await {
            Ok(outputs) => outputs,
            Err(message) => {
                let reason = FailureReason::FileManifestError { message };
                inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                inner.record_failure(&script, &reason);
                transition(&mut state, State::Failed);
                return Ok(ExecutionOutcome::Failure);
            }
        };
        if let Some(missing) = missing_literal_output(&config, &outputs).await? {
            let reason = FailureReason::OutputMissing { path: missing };
            inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
            inner.record_failure(&script, &reason);
            transition(&mut state, State::Failed);
            return Ok(ExecutionOutcome::Failure);
        }

        persist_success(&data_dir, &fingerprint, &outputs).await?;

        if fingerprint.is_fully_tracked() {
            let stored = inner
                .cache
                .set(&script, &fingerprint, &outputs, &data_dir)
                .await
                .context("store cache entry")?;
            log_set_outcome(&inner, &config, stored);
        }

        transition(&mut state, State::Succeeded);
        inner.log(Event::new(&script, EventKind::Success(SuccessReason::ExitZero)));
        Ok(ExecutionOutcome::Success(fingerprint))
    }

    /// The freshness check and cache lookup, in that order. Returns the
    /// success reason to emit when either short-circuits the run.
    async fn fresh_or_cached(
        inner: &Arc<ExecutorInner>,
        config: &ScriptConfig,
        fingerprint: &Arc<Fingerprint>,
        data_dir: &ScriptDataDir,
    ) -> Result<Option<SuccessReason>> {
        match check_freshness(config, fingerprint, data_dir).await? {
            Freshness::Fresh => return Ok(Some(SuccessReason::Fresh)),
            Freshness::OutputsModified => {
                inner.log(Event::new(
                    &config.reference,
                    EventKind::Info(InfoReason::OutputModified),
                ));
            }
            Freshness::Stale => {}
        }

        match inner
            .cache
            .get(&config.reference, fingerprint, data_dir)
            .await
            .context("cache lookup")?
        {
            crate::cache::CacheLookup::Hit(hit) => {
                hit.apply().await.context("restore cache entry")?;
                let outputs = gather_outputs(config)
                    .await
                    .map_err(|message| color_eyre::eyre::eyre!("{message}"))?;
                persist_success(data_dir, fingerprint, &outputs).await?;
                Ok(Some(SuccessReason::Cached))
            }
            crate::cache::CacheLookup::RateLimited => {
                inner.log(Event::new(
                    &config.reference,
                    EventKind::Info(InfoReason::Cache(CacheCondition::RateLimited)),
                ));
                Ok(None)
            }
            crate::cache::CacheLookup::Miss => Ok(None),
        }
    }
}

fn transition(state: &mut State, next: State) {
    debug!(from = ?state, to = ?next, "execution state");
    *state = next;
}

enum Freshness {
    Fresh,
    Stale,
    /// The fingerprint matches but something else touched the outputs.
    OutputsModified,
}

/// Fresh means: the previous run's recorded fingerprint matches, and every
/// recorded output is still on disk with an identical manifest entry.
async fn check_freshness(
    config: &ScriptConfig,
    fingerprint: &Fingerprint,
    data_dir: &ScriptDataDir,
) -> Result<Freshness> {
    let Some(previous_digest) = data_dir.read_state().await? else {
        return Ok(Freshness::Stale);
    };
    if previous_digest != fingerprint.digest() {
        debug!("stale: fingerprint changed");
        return Ok(Freshness::Stale);
    }
    let Some(previous) = data_dir.read_manifest().await? else {
        return Ok(Freshness::Stale);
    };
    let current = match gather_outputs(config).await {
        Ok(current) => current,
        Err(message) => {
            warn!(%message, "could not re-stat outputs; treating as stale");
            return Ok(Freshness::Stale);
        }
    };
    if current != previous.outputs {
        debug!("outputs modified or deleted since last run");
        return Ok(Freshness::OutputsModified);
    }
    Ok(Freshness::Fresh)
}

async fn gather_outputs(config: &ScriptConfig) -> Result<FileManifest, String> {
    let Some(patterns) = &config.output else {
        return Ok(FileManifest::new());
    };
    let set = PatternSet::parse(patterns).map_err(|err| err.to_string())?;
    manifest::gather(&config.reference.package_dir, &set)
        .await
        .map_err(|err| err.to_string())
}

/// Delete stale outputs per the script's `clean` setting. Patterns were
/// validated against escape during fingerprinting, so everything expanded
/// here is inside the package.
async fn clean_outputs(config: &ScriptConfig, data_dir: &ScriptDataDir) -> Result<()> {
    match config.clean {
        Clean::Never => return Ok(()),
        Clean::IfFileDeleted => {
            let Some(previous) = data_dir.read_manifest().await? else {
                // First run: no prior manifest means no deletion triggers.
                return Ok(());
            };
            let mut any_deleted = false;
            for path in previous.inputs.keys() {
                let absolute = config.reference.package_dir.join(path);
                if fs::symlink_metadata_optional(&absolute).await?.is_none() {
                    debug!(%path, "input deleted since last run; cleaning outputs");
                    any_deleted = true;
                    break;
                }
            }
            if !any_deleted {
                return Ok(());
            }
        }
        Clean::Always => {}
    }

    let outputs = match gather_outputs(config).await {
        Ok(outputs) => outputs,
        Err(message) => {
            warn!(%message, "could not expand outputs for cleaning; skipping clean");
            return Ok(());
        }
    };

    // Files and symlinks first (symlinks are removed, never followed), then
    // directories deepest-first, and only when emptied.
    let mut directories = Vec::new();
    for (relative, entry) in &outputs {
        let absolute = config.reference.package_dir.join(relative);
        match entry.kind {
            FileType::Directory => directories.push(absolute),
            _ => fs::remove_file_if_exists(&absolute).await?,
        }
    }
    directories.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
    for directory in directories {
        fs::remove_dir_if_empty(&directory).await?;
    }
    Ok(())
}

/// A positive output pattern with no glob metacharacters names a file the
/// command promises to produce; verify each one exists.
async fn missing_literal_output(
    config: &ScriptConfig,
    outputs: &FileManifest,
) -> Result<Option<String>> {
    let Some(patterns) = &config.output else {
        return Ok(None);
    };
    for pattern in patterns {
        if pattern.starts_with('!') || pattern.contains(['*', '?', '[']) {
            continue;
        }
        let normalized = pattern
            .trim_start_matches('/')
            .trim_start_matches("./")
            .to_string();
        if normalized.is_empty() {
            continue;
        }
        if outputs.contains_key(&normalized) {
            continue;
        }
        let absolute = config.reference.package_dir.join(&normalized);
        if fs::symlink_metadata_optional(&absolute).await?.is_none() {
            return Ok(Some(normalized));
        }
    }
    Ok(None)
}

async fn persist_success(
    data_dir: &ScriptDataDir,
    fingerprint: &Fingerprint,
    outputs: &FileManifest,
) -> Result<()> {
    let previous = PreviousRun {
        inputs: fingerprint.files().cloned().unwrap_or_default(),
        outputs: outputs.clone(),
    };
    data_dir.write_manifest(&previous).await?;
    // State last: its presence is the "has run successfully" marker.
    data_dir.write_state(fingerprint.digest()).await
}

fn log_set_outcome(inner: &ExecutorInner, config: &ScriptConfig, outcome: crate::cache::SetOutcome) {
    use crate::cache::SetOutcome;
    let condition = match outcome {
        SetOutcome::Stored | SetOutcome::AlreadyPresent | SetOutcome::Disabled => return,
        SetOutcome::RaceLost => CacheCondition::RaceLost,
        SetOutcome::TooLarge { bytes } => CacheCondition::TooLarge { bytes },
        SetOutcome::RateLimited => CacheCondition::RateLimited,
    };
    inner.log(Event::new(
        &config.reference,
        EventKind::Info(InfoReason::Cache(condition)),
    ));
}
