use std::{collections::HashMap, fs, sync::Arc};

use pretty_assertions::assert_eq;

use wireit::{
    cache::Cache,
    config::{ScriptConfig, ScriptReference, ServiceConfig},
    event::{EventKind, EventLogger, FailureReason, InfoReason, RecordingLogger},
    execution::service::AdoptableService,
    executor::{Executor, ExecutorOptions},
    pool::{Parallelism, WorkerPool},
};

use crate::{dep, temporary_package, terminal_events};

fn service_script(
    package: &std::path::Path,
    name: &str,
    command: &str,
    persistent: bool,
) -> ScriptConfig {
    fs::create_dir_all(package).expect("create package directory");
    ScriptConfig::builder()
        .reference(ScriptReference::new(package, name))
        .command(command.to_string())
        .service(
            ServiceConfig::builder()
                .ready_when("^ready$".to_string())
                .persistent(persistent)
                .build(),
        )
        .package_locks(vec![])
        .build()
}

fn watch_executor(
    logger: &RecordingLogger,
    adoptees: HashMap<String, AdoptableService>,
) -> Executor {
    Executor::new(
        ExecutorOptions::builder()
            .logger(Arc::new(logger.clone()) as Arc<dyn EventLogger>)
            .cache(Cache::Disabled)
            .pool(WorkerPool::new(Parallelism::default()))
            .watch_mode(true)
            .adoptees(adoptees)
            .build(),
    )
}

fn service_infos(logger: &RecordingLogger, script: &ScriptReference) -> Vec<InfoReason> {
    logger
        .events_for(script)
        .into_iter()
        .filter_map(|kind| match kind {
            EventKind::Info(info) => Some(info),
            _ => None,
        })
        .collect()
}

/// A consumer waits for readiness; the service stops once the run is done,
/// with exactly one service-stopped event.
#[test_log::test(tokio::test)]
async fn service_starts_becomes_ready_and_stops_with_run() {
    let workspace = temporary_package();
    let server = Arc::new(service_script(
        &workspace.path().join("server"),
        "serve",
        "echo ready; exec sleep 600",
        false,
    ));
    fs::create_dir_all(workspace.path().join("consumer")).expect("create package directory");
    let mut consumer = ScriptConfig::builder()
        .reference(ScriptReference::new(workspace.path().join("consumer"), "test"))
        .command("touch done.txt".to_string())
        .package_locks(vec![])
        .build();
    consumer.dependencies = vec![dep(&server)];
    let consumer = Arc::new(consumer);

    let outcome = crate::run(&consumer).await;

    assert!(outcome.result.is_success(), "errors: {:?}", outcome.result.errors);
    assert_eq!(
        terminal_events(&outcome.logger, &consumer.reference),
        vec![EventKind::Success(wireit::event::SuccessReason::ExitZero)]
    );
    assert!(workspace.path().join("consumer/done.txt").exists());

    let infos = service_infos(&outcome.logger, &server.reference);
    let started = infos
        .iter()
        .position(|info| *info == InfoReason::ServiceProcessStarted)
        .expect("service started");
    let ready = infos
        .iter()
        .position(|info| *info == InfoReason::ServiceReady)
        .expect("service ready");
    let stopped = infos
        .iter()
        .position(|info| *info == InfoReason::ServiceStopped)
        .expect("service stopped");
    assert!(started < ready && ready < stopped, "order was {infos:?}");
    assert_eq!(
        infos.iter().filter(|info| **info == InfoReason::ServiceStopped).count(),
        1,
        "service-stopped must be emitted exactly once"
    );
    // Non-watch runs keep nothing alive.
    assert!(outcome.result.persistent_services.is_empty());
}

/// A persistent service carries across watch iterations and is adopted
/// without a restart when its fingerprint is unchanged.
#[test_log::test(tokio::test)]
async fn persistent_service_is_adopted_across_iterations() {
    let workspace = temporary_package();
    let server = Arc::new(service_script(
        &workspace.path().join("server"),
        "serve",
        "echo ready; exec sleep 600",
        true,
    ));
    fs::create_dir_all(workspace.path().join("consumer")).expect("create package directory");
    let mut consumer = ScriptConfig::builder()
        .reference(ScriptReference::new(workspace.path().join("consumer"), "test"))
        .command("echo consumed >> runs.txt".to_string())
        .package_locks(vec![])
        .build();
    consumer.dependencies = vec![dep(&server)];
    let consumer = Arc::new(consumer);

    let first_logger = RecordingLogger::new();
    let first = watch_executor(&first_logger, HashMap::new())
        .execute(&consumer)
        .await;
    assert!(first.is_success(), "errors: {:?}", first.errors);
    assert_eq!(first.persistent_services.len(), 1);
    assert_eq!(
        service_infos(&first_logger, &server.reference)
            .iter()
            .filter(|info| **info == InfoReason::ServiceProcessStarted)
            .count(),
        1
    );

    // Iteration two inherits the live process: the consumer runs again but
    // the service is neither restarted nor re-announced.
    let second_logger = RecordingLogger::new();
    let second = watch_executor(&second_logger, first.persistent_services)
        .execute(&consumer)
        .await;
    assert!(second.is_success(), "errors: {:?}", second.errors);
    assert_eq!(
        service_infos(&second_logger, &server.reference)
            .iter()
            .filter(|info| **info == InfoReason::ServiceProcessStarted)
            .count(),
        0,
        "adoption must not restart the service"
    );
    assert_eq!(second.persistent_services.len(), 1);

    for (_key, service) in second.persistent_services {
        service.stop().await.unwrap();
    }
}

/// When the service's own inputs change, the adoptee is stopped and a
/// fresh process is started.
#[test_log::test(tokio::test)]
async fn changed_service_restarts_instead_of_adopting() {
    let workspace = temporary_package();
    let package = workspace.path().join("server");
    fs::create_dir_all(package.join("src")).unwrap();
    fs::write(package.join("src/config.json"), "v1").unwrap();

    let mut server = service_script(&package, "serve", "echo ready; exec sleep 600", true);
    server.files = Some(vec!["src/**".to_string()]);
    server.output = Some(vec![]);
    let server = Arc::new(server);

    let first_logger = RecordingLogger::new();
    let first = watch_executor(&first_logger, HashMap::new()).execute(&server).await;
    assert!(first.is_success());

    fs::write(package.join("src/config.json"), "v2-changed").unwrap();

    let second_logger = RecordingLogger::new();
    let second = watch_executor(&second_logger, first.persistent_services)
        .execute(&server)
        .await;
    assert!(second.is_success(), "errors: {:?}", second.errors);

    let infos = service_infos(&second_logger, &server.reference);
    let stopped = infos
        .iter()
        .position(|info| *info == InfoReason::ServiceStopped)
        .expect("outdated adoptee stopped");
    let restarted = infos
        .iter()
        .position(|info| *info == InfoReason::ServiceProcessStarted)
        .expect("fresh process started");
    assert!(stopped < restarted, "order was {infos:?}");

    for (_key, service) in second.persistent_services {
        service.stop().await.unwrap();
    }
}

/// Outside watch mode, a dependency service dying takes its dependents
/// down with it.
#[test_log::test(tokio::test)]
async fn dependency_service_exit_cascades() {
    let workspace = temporary_package();
    let backend = Arc::new(service_script(
        &workspace.path().join("backend"),
        "serve",
        "echo ready; sleep 1",
        false,
    ));
    let mut proxy = service_script(
        &workspace.path().join("proxy"),
        "serve",
        "echo ready; exec sleep 600",
        false,
    );
    proxy.dependencies = vec![dep(&backend)];
    let proxy = Arc::new(proxy);
    fs::create_dir_all(workspace.path().join("consumer")).expect("create package directory");
    let mut consumer = ScriptConfig::builder()
        .reference(ScriptReference::new(workspace.path().join("consumer"), "test"))
        .command("sleep 3".to_string())
        .package_locks(vec![])
        .build();
    consumer.dependencies = vec![dep(&proxy)];
    let consumer = Arc::new(consumer);

    let outcome = crate::run(&consumer).await;

    // The backend's unexpected exit is the one primary failure.
    assert_eq!(outcome.result.errors.len(), 1, "errors: {:?}", outcome.result.errors);
    assert_eq!(outcome.result.errors[0].script, backend.reference);
    assert!(
        outcome
            .logger
            .events_for(&backend.reference)
            .contains(&EventKind::Failure(FailureReason::ServiceExitedUnexpectedly))
    );
    assert!(
        outcome
            .logger
            .events_for(&proxy.reference)
            .contains(&EventKind::Failure(FailureReason::DependencyServiceExitedUnexpectedly)),
        "proxy events: {:?}",
        outcome.logger.events_for(&proxy.reference)
    );
    for script in [&backend, &proxy] {
        assert_eq!(
            service_infos(&outcome.logger, &script.reference)
                .iter()
                .filter(|info| **info == InfoReason::ServiceStopped)
                .count(),
            1,
            "exactly one service-stopped for {}",
            script.reference
        );
    }
}
