use std::{fs, sync::Arc};

use pretty_assertions::assert_eq;

use wireit::{
    cache::Cache,
    config::{Clean, ScriptConfig, ScriptReference},
    data_dir::ScriptDataDir,
    event::{EventKind, FailureReason, InfoReason, SuccessReason},
    options::FailureMode,
};

use crate::{dep, run, run_with, temporary_package, terminal_events, tracked_script};

fn line_count(path: &std::path::Path) -> usize {
    fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

/// Scenario: run → fresh → run on change → cached on revert.
/// The command is invoked exactly twice across four runs.
#[test_log::test(tokio::test)]
async fn fresh_then_cached_round_trip() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();
    let input = package.path().join("src/a.txt");
    fs::write(&input, "v0").unwrap();
    let original_mtime = fs::metadata(&input).unwrap().modified().unwrap();

    let script = Arc::new(tracked_script(
        package.path(),
        "build",
        "mkdir -p out && cp src/a.txt out/b.txt && echo run >> runs.txt",
    ));
    let runs = package.path().join("runs.txt");
    let output = package.path().join("out/b.txt");

    // Run 1: cold; the command runs.
    let first = run(&script).await;
    assert!(first.result.is_success());
    assert_eq!(
        terminal_events(&first.logger, &script.reference),
        vec![EventKind::Success(SuccessReason::ExitZero)]
    );
    assert_eq!(fs::read_to_string(&output).unwrap(), "v0");
    assert_eq!(line_count(&runs), 1);

    // Run 2: nothing changed; fresh, no invocation.
    let second = run(&script).await;
    assert_eq!(
        terminal_events(&second.logger, &script.reference),
        vec![EventKind::Success(SuccessReason::Fresh)]
    );
    assert_eq!(line_count(&runs), 1);

    // Run 3: input changed; the command runs again.
    fs::write(&input, "v1").unwrap();
    let third = run(&script).await;
    assert_eq!(
        terminal_events(&third.logger, &script.reference),
        vec![EventKind::Success(SuccessReason::ExitZero)]
    );
    assert_eq!(fs::read_to_string(&output).unwrap(), "v1");
    assert_eq!(line_count(&runs), 2);

    // Run 4: revert the input (content and mtime); restored from cache,
    // still no third invocation.
    fs::write(&input, "v0").unwrap();
    fs::OpenOptions::new()
        .write(true)
        .open(&input)
        .unwrap()
        .set_modified(original_mtime)
        .unwrap();
    let fourth = run(&script).await;
    assert_eq!(
        terminal_events(&fourth.logger, &script.reference),
        vec![EventKind::Success(SuccessReason::Cached)]
    );
    assert_eq!(fs::read_to_string(&output).unwrap(), "v0");
    assert_eq!(line_count(&runs), 2);

    // Run 5: the restored state is fresh.
    let fifth = run(&script).await;
    assert_eq!(
        terminal_events(&fifth.logger, &script.reference),
        vec![EventKind::Success(SuccessReason::Fresh)]
    );
    assert_eq!(line_count(&runs), 2);
}

/// Diamond: root → {b, c} → d. The shared dependency runs once.
#[test_log::test(tokio::test)]
async fn diamond_runs_shared_dependency_once() {
    let workspace = temporary_package();
    let mut scripts = Vec::new();
    for name in ["root", "b", "c", "d"] {
        let package = workspace.path().join(name);
        fs::create_dir_all(package.join("src")).unwrap();
        fs::write(package.join("src/in.txt"), name).unwrap();
        scripts.push((name, package));
    }
    let command = "mkdir -p out && touch out/done && echo x >> ../shared-log.txt";

    let d = Arc::new(tracked_script(&scripts[3].1, "build", command));
    let mut b = tracked_script(&scripts[1].1, "build", command);
    b.dependencies = vec![dep(&d)];
    let b = Arc::new(b);
    let mut c = tracked_script(&scripts[2].1, "build", command);
    c.dependencies = vec![dep(&d)];
    let c = Arc::new(c);
    let mut root = tracked_script(&scripts[0].1, "build", command);
    root.dependencies = vec![dep(&b), dep(&c)];
    let root = Arc::new(root);

    let outcome = run(&root).await;
    assert!(outcome.result.is_success(), "errors: {:?}", outcome.result.errors);
    for script in [&root, &b, &c, &d] {
        assert_eq!(
            terminal_events(&outcome.logger, &script.reference),
            vec![EventKind::Success(SuccessReason::ExitZero)],
            "unexpected events for {}",
            script.reference
        );
    }
    // Four scripts, four invocations: the diamond's shared leg ran once.
    assert_eq!(line_count(&workspace.path().join("shared-log.txt")), 4);
}

/// A failure in the middle of a chain cancels dependents and reports
/// exactly one error.
#[test_log::test(tokio::test)]
async fn middle_failure_cancels_dependents() {
    let workspace = temporary_package();
    for name in ["root", "b", "c"] {
        fs::create_dir_all(workspace.path().join(name).join("src")).unwrap();
    }

    let c = Arc::new(tracked_script(
        &workspace.path().join("c"),
        "build",
        "mkdir -p out && touch out/c",
    ));
    let mut b = tracked_script(&workspace.path().join("b"), "build", "exit 42");
    b.dependencies = vec![dep(&c)];
    let b = Arc::new(b);
    let mut root = tracked_script(
        &workspace.path().join("root"),
        "build",
        "mkdir -p out && touch out/root",
    );
    root.dependencies = vec![dep(&b)];
    let root = Arc::new(root);

    let outcome = run(&root).await;

    assert_eq!(outcome.result.errors.len(), 1);
    assert!(outcome.result.errors[0].message.contains("42"));
    assert_eq!(
        terminal_events(&outcome.logger, &c.reference),
        vec![EventKind::Success(SuccessReason::ExitZero)]
    );
    assert_eq!(
        terminal_events(&outcome.logger, &b.reference),
        vec![EventKind::Failure(FailureReason::ExitNonZero { status: 42 })]
    );
    assert_eq!(
        terminal_events(&outcome.logger, &root.reference),
        vec![EventKind::Failure(FailureReason::StartCancelled)]
    );
    // Root was never spawned.
    let root_runs = outcome
        .logger
        .events_for(&root.reference)
        .into_iter()
        .filter(|kind| matches!(kind, EventKind::Info(InfoReason::Running)))
        .count();
    assert_eq!(root_runs, 0);
    assert!(!workspace.path().join("root/out/root").exists());
}

/// Under `continue`, scripts independent of the failure still complete.
#[test_log::test(tokio::test)]
async fn continue_mode_lets_independent_scripts_finish() {
    let workspace = temporary_package();
    for name in ["root", "bad", "good"] {
        fs::create_dir_all(workspace.path().join(name).join("src")).unwrap();
    }

    let bad = Arc::new(tracked_script(&workspace.path().join("bad"), "build", "exit 1"));
    let good = Arc::new(tracked_script(
        &workspace.path().join("good"),
        "build",
        "mkdir -p out && touch out/ok",
    ));
    let mut root = tracked_script(&workspace.path().join("root"), "build", "true");
    root.dependencies = vec![dep(&bad), dep(&good)];
    let root = Arc::new(root);

    let outcome = run_with(
        &root,
        Cache::Local(Default::default()),
        FailureMode::Continue,
    )
    .await;

    assert_eq!(outcome.result.errors.len(), 1);
    assert_eq!(
        terminal_events(&outcome.logger, &good.reference),
        vec![EventKind::Success(SuccessReason::ExitZero)]
    );
    assert!(workspace.path().join("good/out/ok").exists());
    assert_eq!(
        terminal_events(&outcome.logger, &root.reference),
        vec![EventKind::Failure(FailureReason::StartCancelled)]
    );
}

/// Scripts without a command succeed once their dependencies do.
#[test_log::test(tokio::test)]
async fn no_command_scripts_compose_dependencies() {
    let workspace = temporary_package();
    fs::create_dir_all(workspace.path().join("leaf/src")).unwrap();

    let leaf = Arc::new(tracked_script(
        &workspace.path().join("leaf"),
        "build",
        "mkdir -p out && touch out/leaf",
    ));
    let group = Arc::new(
        ScriptConfig::builder()
            .reference(ScriptReference::new(workspace.path().join("root"), "build"))
            .dependencies(vec![dep(&leaf)])
            .package_locks(vec![])
            .build(),
    );

    let outcome = run(&group).await;
    assert!(outcome.result.is_success());
    assert_eq!(
        terminal_events(&outcome.logger, &group.reference),
        vec![EventKind::Success(SuccessReason::NoCommand)]
    );
}

/// `clean: if-file-deleted` wipes outputs only when an input disappeared.
#[test_log::test(tokio::test)]
async fn if_file_deleted_clean_mode() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();
    fs::write(package.path().join("src/a.txt"), "a").unwrap();
    fs::write(package.path().join("src/b.txt"), "b").unwrap();

    let mut config = tracked_script(package.path(), "build", "mkdir -p out && cp src/* out/");
    config.clean = Clean::IfFileDeleted;
    let script = Arc::new(config);

    let first = run(&script).await;
    assert!(first.result.is_success());
    assert!(package.path().join("out/b.txt").exists());

    // Deleting an input triggers the clean, so the stale output vanishes.
    fs::remove_file(package.path().join("src/b.txt")).unwrap();
    let second = run(&script).await;
    assert!(second.result.is_success(), "errors: {:?}", second.result.errors);
    assert!(package.path().join("out/a.txt").exists());
    assert!(!package.path().join("out/b.txt").exists());
}

/// `clean: false` leaves stale outputs alone.
#[test_log::test(tokio::test)]
async fn clean_never_keeps_stale_outputs() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();
    fs::write(package.path().join("src/a.txt"), "a").unwrap();
    fs::write(package.path().join("src/b.txt"), "b").unwrap();

    let mut config = tracked_script(package.path(), "build", "mkdir -p out && cp src/* out/");
    config.clean = Clean::Never;
    let script = Arc::new(config);

    run(&script).await;
    fs::remove_file(package.path().join("src/b.txt")).unwrap();
    let second = run(&script).await;

    assert!(second.result.is_success());
    assert!(package.path().join("out/b.txt").exists(), "stale output should remain");
}

/// Undeclared inputs make a script not fully tracked: it always runs and
/// never caches.
#[test_log::test(tokio::test)]
async fn untracked_scripts_always_run() {
    let package = temporary_package();
    let script = Arc::new(
        ScriptConfig::builder()
            .reference(ScriptReference::new(package.path(), "build"))
            .command("echo run >> runs.txt".to_string())
            .package_locks(vec![])
            .build(),
    );

    run(&script).await;
    run(&script).await;

    assert_eq!(line_count(&package.path().join("runs.txt")), 2);
    let data_dir = ScriptDataDir::new(&script.reference);
    assert!(!data_dir.cache_dir().exists(), "untracked scripts must not cache");
}

/// A literal declared output that the command failed to produce fails the
/// script.
#[test_log::test(tokio::test)]
async fn missing_literal_output_is_a_failure() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();

    let mut config = tracked_script(package.path(), "build", "mkdir -p out");
    config.output = Some(vec!["out/**".to_string(), "out/must-exist.txt".to_string()]);
    let script = Arc::new(config);

    let outcome = run(&script).await;
    assert_eq!(outcome.result.errors.len(), 1);
    assert_eq!(
        terminal_events(&outcome.logger, &script.reference),
        vec![EventKind::Failure(FailureReason::OutputMissing {
            path: "out/must-exist.txt".to_string()
        })]
    );
}

/// Event order for one script is running → output* → terminal.
#[test_log::test(tokio::test)]
async fn event_order_per_script() {
    let package = temporary_package();
    fs::create_dir_all(package.path().join("src")).unwrap();
    let script = Arc::new(tracked_script(
        package.path(),
        "build",
        "echo hello && mkdir -p out && touch out/done",
    ));

    let outcome = run(&script).await;
    let events = outcome.logger.events_for(&script.reference);

    let running = events
        .iter()
        .position(|kind| matches!(kind, EventKind::Info(InfoReason::Running)))
        .expect("running event");
    let output = events
        .iter()
        .position(|kind| matches!(kind, EventKind::Output { .. }))
        .expect("output event");
    let terminal = events
        .iter()
        .position(|kind| matches!(kind, EventKind::Success(_)))
        .expect("terminal event");
    assert!(running < output && output < terminal, "order was {events:?}");
}
