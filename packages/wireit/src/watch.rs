//! Watch mode: repeated runs driven by file events.
//!
//! The OS watching mechanism stays outside; this controller consumes an
//! injected stream of [`WatchEvent`]s, debounces briefly, and builds a
//! fresh executor per iteration. Live persistent services and failure
//! digests are handed from one iteration to the next. SIGINT (the
//! `interrupt` future) aborts the current iteration, stops services, and
//! yields exit code 130.

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use color_eyre::Result;
use futures::{Stream, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::Cache,
    config::ScriptConfig,
    event::{Event, EventKind, EventLogger, InfoReason},
    execution::service::AdoptableService,
    executor::{Executor, ExecutorOptions},
    options::Options,
    pool::WorkerPool,
};

/// Exit code reported after an interrupted watch session.
pub const SIGINT_EXIT_CODE: i32 = 130;

/// One file-change notification from the embedding watcher. Which file
/// changed is informational; any event triggers a re-run.
#[derive(Clone, Debug, Default)]
pub struct WatchEvent {
    pub path: Option<PathBuf>,
}

/// How long to keep absorbing follow-up events after the first one before
/// starting the next iteration.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Everything the embedding watcher should observe for a script graph:
/// per-package input globs, plus concrete files whose changes must trigger
/// a re-run (package.json and lockfiles in ancestor directories).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchSources {
    /// Package directory → input glob patterns declared there.
    pub package_globs: Vec<(PathBuf, Vec<String>)>,
    /// Concrete files to watch.
    pub files: BTreeSet<PathBuf>,
}

/// Collect the watchable surface of the whole graph.
pub fn watch_sources(root: &Arc<ScriptConfig>) -> WatchSources {
    let mut sources = WatchSources::default();
    let mut seen = std::collections::HashSet::new();
    let mut queue = vec![root.clone()];
    while let Some(config) = queue.pop() {
        if !seen.insert(config.reference.key().as_str().to_string()) {
            continue;
        }
        let package = &config.reference.package_dir;
        if let Some(files) = &config.files {
            sources
                .package_globs
                .push((package.clone(), files.clone()));
        }
        sources.files.insert(package.join("package.json"));
        for ancestor in package.ancestors() {
            for lock in &config.package_locks {
                sources.files.insert(ancestor.join(lock));
            }
        }
        for dependency in &config.dependencies {
            queue.push(dependency.config.clone());
        }
    }
    sources
}

/// Drive repeated runs of `root` until the event stream ends or the
/// interrupt fires. Returns the process exit code.
#[instrument(skip_all, fields(root = %root.reference))]
pub async fn watch(
    root: Arc<ScriptConfig>,
    options: Options,
    logger: Arc<dyn EventLogger>,
    cache: Cache,
    mut events: impl Stream<Item = WatchEvent> + Unpin,
    interrupt: impl Future<Output = ()>,
) -> Result<i32> {
    let pool = WorkerPool::new(options.parallelism);
    let mut adoptees: HashMap<String, AdoptableService> = HashMap::new();
    let mut previous_failures: HashMap<String, String> = HashMap::new();
    let mut last_run_failed = false;
    tokio::pin!(interrupt);

    loop {
        logger.log(Event::new(&root.reference, EventKind::Info(InfoReason::WatchRunStart)));
        let executor = Executor::new(
            ExecutorOptions::builder()
                .logger(logger.clone())
                .cache(cache.clone())
                .pool(pool.clone())
                .failure_mode(options.failure_mode)
                .watch_mode(true)
                .adoptees(std::mem::take(&mut adoptees))
                .previous_failures(std::mem::take(&mut previous_failures))
                .build(),
        );
        let abort = executor.abort_signal();

        let run = executor.execute(&root);
        tokio::pin!(run);
        let mut interrupted = false;
        let result = tokio::select! {
            result = &mut run => result,
            _ = &mut interrupt => {
                info!("interrupt received; draining current iteration");
                interrupted = true;
                abort.abort(true);
                (&mut run).await
            }
        };
        logger.log(Event::new(&root.reference, EventKind::Info(InfoReason::WatchRunEnd)));

        last_run_failed = !result.is_success();
        adoptees = result.persistent_services;
        previous_failures = result.failed_digests;

        if interrupted {
            shutdown_adoptees(&logger, adoptees).await;
            return Ok(SIGINT_EXIT_CODE);
        }

        debug!(failures = previous_failures.len(), "iteration finished; waiting for changes");
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    debug!(path = ?event.path, "file change detected");
                    // Absorb the burst: editors and builds touch many
                    // files in quick succession.
                    while let Ok(Some(_)) = timeout(DEBOUNCE, events.next()).await {}
                }
                None => {
                    debug!("watch event stream ended");
                    shutdown_adoptees(&logger, adoptees).await;
                    return Ok(if last_run_failed { 1 } else { 0 });
                }
            },
            _ = &mut interrupt => {
                shutdown_adoptees(&logger, adoptees).await;
                return Ok(SIGINT_EXIT_CODE);
            }
        }
    }
}

/// Terminate the persistent services held across iterations; called when
/// the watch session ends.
async fn shutdown_adoptees(
    logger: &Arc<dyn EventLogger>,
    adoptees: HashMap<String, AdoptableService>,
) {
    for (key, mut service) in adoptees {
        debug!(%key, "stopping persistent service at end of watch session");
        if let Err(error) = service.child.kill().await {
            warn!(?error, %key, "failed to stop persistent service");
        }
        logger.log(Event::new(
            &service.config.reference,
            EventKind::Info(InfoReason::ServiceStopped),
        ));
    }
}
