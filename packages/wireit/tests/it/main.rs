use std::{path::Path, sync::Arc, time::Duration};

use tempfile::TempDir;

use wireit::{
    cache::Cache,
    config::{Dependency, ScriptConfig, ScriptReference},
    event::{EventKind, EventLogger, RecordingLogger},
    executor::{Executor, ExecutorOptions, RunResult},
    options::FailureMode,
    pool::{Parallelism, WorkerPool},
};

pub mod execution;
pub mod remote_cache;
pub mod service;
pub mod watch_mode;

#[track_caller]
pub fn temporary_package() -> TempDir {
    TempDir::new().expect("create temporary package directory")
}

/// A script in `package` whose inputs and outputs are fully declared, so it
/// is eligible for freshness and caching. Lockfile consultation is disabled
/// so fingerprints only depend on the temp package contents.
pub fn tracked_script(package: &Path, name: &str, command: &str) -> ScriptConfig {
    ScriptConfig::builder()
        .reference(ScriptReference::new(package, name))
        .command(command.to_string())
        .files(vec!["src/**".to_string()])
        .output(vec!["out/**".to_string()])
        .package_locks(vec![])
        .build()
}

pub fn dep(config: &Arc<ScriptConfig>) -> Dependency {
    Dependency { config: config.clone(), cascade: true }
}

pub struct TestRun {
    pub logger: RecordingLogger,
    pub result: RunResult,
}

/// Run `root` to completion on a fresh executor with a recording logger.
pub async fn run_with(
    root: &Arc<ScriptConfig>,
    cache: Cache,
    failure_mode: FailureMode,
) -> TestRun {
    let logger = RecordingLogger::new();
    let executor = Executor::new(
        ExecutorOptions::builder()
            .logger(Arc::new(logger.clone()) as Arc<dyn EventLogger>)
            .cache(cache)
            .pool(WorkerPool::new(Parallelism::default()))
            .failure_mode(failure_mode)
            .build(),
    );
    let result = executor.execute(root).await;
    TestRun { logger, result }
}

pub async fn run(root: &Arc<ScriptConfig>) -> TestRun {
    run_with(root, Cache::Local(Default::default()), FailureMode::default()).await
}

/// The terminal success/failure events logged for `script`, in order.
pub fn terminal_events(logger: &RecordingLogger, script: &ScriptReference) -> Vec<EventKind> {
    logger
        .events_for(script)
        .into_iter()
        .filter(|kind| matches!(kind, EventKind::Success(_) | EventKind::Failure(_)))
        .collect()
}

/// Poll until `condition` holds, failing the test after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
