use std::{fs, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use tokio::{sync::oneshot, time::timeout};

use wireit::{
    cache::Cache,
    event::{EventKind, EventLogger, FailureReason, InfoReason, RecordingLogger},
    options::Options,
    watch::{self, WatchEvent},
};

use crate::{temporary_package, tracked_script, wait_until};

struct WatchHarness {
    logger: RecordingLogger,
    events: flume::Sender<WatchEvent>,
    interrupt: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<color_eyre::Result<i32>>,
}

fn start_watch(root: Arc<wireit::config::ScriptConfig>) -> WatchHarness {
    let logger = RecordingLogger::new();
    let (events, receiver) = flume::unbounded::<WatchEvent>();
    let (interrupt_tx, interrupt_rx) = oneshot::channel::<()>();

    let task = {
        let logger = logger.clone();
        tokio::spawn(async move {
            watch::watch(
                root,
                Options { cache_mode: wireit::options::CacheMode::None, ..Options::default() },
                Arc::new(logger) as Arc<dyn EventLogger>,
                Cache::Disabled,
                receiver.into_stream(),
                async move {
                    // A dropped sender is "no interrupt", not an interrupt.
                    if interrupt_rx.await.is_err() {
                        std::future::pending::<()>().await;
                    }
                },
            )
            .await
        })
    };

    WatchHarness { logger, events, interrupt: Some(interrupt_tx), task }
}

async fn finish(harness: WatchHarness) -> i32 {
    drop(harness.events);
    drop(harness.interrupt);
    timeout(Duration::from_secs(20), harness.task)
        .await
        .expect("watch should settle")
        .expect("watch task should not panic")
        .expect("watch should not error")
}

fn line_count(path: &std::path::Path) -> usize {
    fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

/// A file event triggers a rebuild; the session ends cleanly when the
/// event stream does.
#[test_log::test(tokio::test)]
async fn file_events_drive_iterations() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();
    fs::write(package.path().join("src/a.txt"), "v0").unwrap();
    let root = Arc::new(tracked_script(
        package.path(),
        "build",
        "echo run >> runs.txt && mkdir -p out && touch out/done",
    ));
    let runs = package.path().join("runs.txt");

    let harness = start_watch(root);
    wait_until(|| line_count(&runs) == 1, "first iteration").await;

    fs::write(package.path().join("src/a.txt"), "v1-changed").unwrap();
    harness.events.send(WatchEvent::default()).unwrap();
    wait_until(|| line_count(&runs) == 2, "second iteration").await;

    let code = finish(harness).await;
    assert_eq!(code, 0);
}

/// A script that failed and is unchanged is reported, not re-run.
#[test_log::test(tokio::test)]
async fn unchanged_failure_is_skipped_next_iteration() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();
    let root = Arc::new(tracked_script(package.path(), "build", "exit 1"));

    let harness = start_watch(root.clone());
    wait_until(
        || {
            harness
                .logger
                .count(|event| matches!(event.kind, EventKind::Failure(FailureReason::ExitNonZero { .. })))
                == 1
        },
        "first failing iteration",
    )
    .await;

    harness.events.send(WatchEvent::default()).unwrap();
    wait_until(
        || {
            harness.logger.count(|event| {
                matches!(
                    event.kind,
                    EventKind::Failure(FailureReason::FailedPreviousWatchIteration)
                )
            }) == 1
        },
        "skipped second iteration",
    )
    .await;

    // The command itself ran only once.
    assert_eq!(
        harness
            .logger
            .count(|event| matches!(event.kind, EventKind::Info(InfoReason::Running))),
        1
    );

    let code = finish(harness).await;
    assert_eq!(code, 1);
}

/// SIGINT drains the session and reports exit code 130.
#[test_log::test(tokio::test)]
async fn interrupt_ends_session_with_sigint_code() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();
    let root = Arc::new(tracked_script(
        package.path(),
        "build",
        "mkdir -p out && touch out/done",
    ));

    let mut harness = start_watch(root);
    wait_until(
        || {
            harness
                .logger
                .count(|event| matches!(event.kind, EventKind::Info(InfoReason::WatchRunEnd)))
                == 1
        },
        "first iteration",
    )
    .await;

    harness.interrupt.take().unwrap().send(()).unwrap();
    let code = timeout(Duration::from_secs(20), harness.task)
        .await
        .expect("watch should settle")
        .expect("watch task should not panic")
        .expect("watch should not error");
    assert_eq!(code, watch::SIGINT_EXIT_CODE);
}
