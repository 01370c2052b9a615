//! The per-run executor.
//!
//! Owns the mapping from script to its (single, shared) execution, the
//! failure-mode policy, and the live-service registry. A fresh executor is
//! built for every run; in watch mode, persistent services and failure
//! digests are handed forward from one executor to the next.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use futures::{FutureExt, future::BoxFuture};
use tokio::sync::Notify;
use tracing::{debug, error, instrument, warn};

use crate::{
    cache::Cache,
    config::{Dependency, ScriptConfig, ScriptReference},
    event::{Event, EventKind, EventLogger, FailureReason, InfoReason},
    execution::{
        ExecContext, ExecutionOutcome,
        service::{AdoptableService, ServiceExecution, ServiceHandle},
        standard::StandardExecution,
    },
    fingerprint::Fingerprint,
    options::FailureMode,
    pool::WorkerPool,
};

/// Run-level abort broadcast.
///
/// Set once, never cleared. `kill` additionally asks running children to be
/// terminated (the `kill` failure mode); without it, in-flight commands
/// finish but no new ones start.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    kill: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn abort(&self, kill: bool) {
        if kill {
            self.inner.kill.store(true, Ordering::SeqCst);
        }
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn is_kill_requested(&self) -> bool {
        self.inner.kill.load(Ordering::SeqCst)
    }

    /// Resolves once the run is aborted (for any reason).
    pub async fn aborted(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once running children should be killed. Never resolves
    /// under `no-new`/`continue` aborts.
    pub async fn kill_signalled(&self) {
        loop {
            if self.is_kill_requested() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_kill_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// One collected failure, for the end-of-run summary.
#[derive(Clone, Debug)]
pub struct ScriptError {
    pub script: ScriptReference,
    pub message: String,
}

/// What a run produced: the failure summary plus the state handed to the
/// next watch iteration.
#[derive(Debug, Default)]
pub struct RunResult {
    /// Primary failures, in the order they occurred. Dependents cancelled
    /// by these failures are not listed.
    pub errors: Vec<ScriptError>,
    /// Live persistent services, keyed by script key, available for
    /// adoption by the next iteration.
    pub persistent_services: HashMap<String, AdoptableService>,
    /// Fingerprints computed this run, keyed by script key.
    pub fingerprints: HashMap<String, Arc<Fingerprint>>,
    /// Fingerprint digests of scripts that failed, keyed by script key.
    /// The next iteration skips these when unchanged.
    pub failed_digests: HashMap<String, String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

type SharedExecution = futures::future::Shared<BoxFuture<'static, ExecutionOutcome>>;

/// Construction parameters for one run's executor.
#[derive(Builder)]
pub struct ExecutorOptions {
    pub logger: Arc<dyn EventLogger>,
    pub cache: Cache,
    pub pool: WorkerPool,
    #[builder(default)]
    pub failure_mode: FailureMode,
    #[builder(default)]
    pub watch_mode: bool,
    /// Live services inherited from the previous watch iteration.
    #[builder(default)]
    pub adoptees: HashMap<String, AdoptableService>,
    /// Failure digests from the previous watch iteration.
    #[builder(default)]
    pub previous_failures: HashMap<String, String>,
}

pub struct Executor {
    inner: Arc<ExecutorInner>,
}

pub(crate) struct ExecutorInner {
    logger: Arc<dyn EventLogger>,
    pub(crate) cache: Cache,
    pub(crate) pool: WorkerPool,
    pub(crate) abort: AbortSignal,
    pub(crate) failure_mode: FailureMode,
    pub(crate) watch_mode: bool,
    pub(crate) previous_failures: HashMap<String, String>,
    executions: Mutex<HashMap<String, SharedExecution>>,
    errors: Mutex<Vec<ScriptError>>,
    services: Mutex<HashMap<String, ServiceHandle>>,
    adoptees: Mutex<HashMap<String, AdoptableService>>,
    fingerprints: Mutex<HashMap<String, Arc<Fingerprint>>>,
    failed_digests: Mutex<HashMap<String, String>>,
}

impl Executor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                logger: options.logger,
                cache: options.cache,
                pool: options.pool,
                abort: AbortSignal::default(),
                failure_mode: options.failure_mode,
                watch_mode: options.watch_mode,
                previous_failures: options.previous_failures,
                executions: Mutex::new(HashMap::new()),
                errors: Mutex::new(Vec::new()),
                services: Mutex::new(HashMap::new()),
                adoptees: Mutex::new(options.adoptees),
                fingerprints: Mutex::new(HashMap::new()),
                failed_digests: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The run-level abort signal, for external interruption (SIGINT).
    pub fn abort_signal(&self) -> AbortSignal {
        self.inner.abort.clone()
    }

    /// Execute the root script and everything it transitively requires.
    /// Resolves once every materialized execution is terminal and services
    /// have been stopped or detached per their persistence.
    #[instrument(skip_all, fields(root = %root.reference))]
    pub async fn execute(&self, root: &Arc<ScriptConfig>) -> RunResult {
        if let Some(offender) = find_cycle(root) {
            let reason = FailureReason::DependencyInvalid {
                message: format!("dependency cycle through {offender}"),
            };
            self.inner
                .log(Event::new(&offender, EventKind::Failure(reason.clone())));
            self.inner.record_failure(&offender, &reason);
        } else {
            let execution = self.inner.execution(root);
            execution.await;

            // Everything stems from the root, so the map is quiescent once
            // the root resolves; awaiting the rest is belt and braces for
            // `continue` mode stragglers.
            let pending = {
                let executions = self.inner.executions.lock().expect("executions poisoned");
                executions.values().cloned().collect::<Vec<_>>()
            };
            futures::future::join_all(pending).await;
        }

        self.shutdown_services().await;

        let inner = &self.inner;
        RunResult {
            errors: inner.errors.lock().expect("errors poisoned").clone(),
            persistent_services: std::mem::take(
                &mut *inner.adoptees.lock().expect("adoptees poisoned"),
            ),
            fingerprints: inner.fingerprints.lock().expect("fingerprints poisoned").clone(),
            failed_digests: inner
                .failed_digests
                .lock()
                .expect("failed digests poisoned")
                .clone(),
        }
    }

    /// Stop or detach every live service, and dispose of adoptees nothing
    /// claimed this run.
    async fn shutdown_services(&self) {
        // Adoptees left over from the previous iteration were claimed by
        // nothing this run: their scripts are gone from the graph. Stop
        // them before detached services repopulate the map.
        let orphans = std::mem::take(
            &mut *self.inner.adoptees.lock().expect("adoptees poisoned"),
        );
        for (key, mut orphan) in orphans {
            debug!(%key, "stopping unclaimed adoptee");
            if let Err(err) = orphan.child.kill().await {
                warn!(?err, %key, "failed to stop unclaimed adoptee");
            }
            self.inner.log(Event::new(
                &orphan.config.reference,
                EventKind::Info(InfoReason::ServiceStopped),
            ));
        }

        let services = std::mem::take(
            &mut *self.inner.services.lock().expect("services poisoned"),
        );
        for (key, handle) in services {
            if self.inner.watch_mode && handle.persistent() {
                if let Some(adoptable) = handle.detach().await {
                    debug!(%key, "carrying persistent service to next iteration");
                    self.inner
                        .adoptees
                        .lock()
                        .expect("adoptees poisoned")
                        .insert(key, adoptable);
                }
            } else {
                handle.stop().await;
            }
        }
    }
}

impl ExecutorInner {
    /// The lazily-created shared execution for a script. All dependents of
    /// a script await the same future, which is how one fingerprint is
    /// computed once and shared.
    pub(crate) fn execution(self: &Arc<Self>, config: &Arc<ScriptConfig>) -> SharedExecution {
        let key = config.reference.key().as_str().to_string();
        let mut executions = self.executions.lock().expect("executions poisoned");
        if let Some(existing) = executions.get(&key) {
            return existing.clone();
        }

        let context = ExecContext {
            executor: Arc::downgrade(self),
            config: config.clone(),
        };
        let script = config.reference.clone();
        let weak = Arc::downgrade(self);
        let task = if config.is_service() {
            tokio::spawn(ServiceExecution::run(context))
        } else {
            tokio::spawn(StandardExecution::run(context))
        };

        let future = async move {
            match task.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(report)) => {
                    // Infrastructure error (I/O, cache transport). These
                    // abort the run; they are not script failures the user
                    // caused, but they are collected the same way.
                    error!(script = %script, error = ?report, "execution error");
                    if let Some(inner) = weak.upgrade() {
                        inner.record_error(&script, format!("{report:#}"));
                    }
                    ExecutionOutcome::Failure
                }
                Err(join_error) => {
                    error!(script = %script, ?join_error, "execution task panicked");
                    if let Some(inner) = weak.upgrade() {
                        inner.record_error(&script, "internal error: execution task panicked".into());
                    }
                    ExecutionOutcome::Failure
                }
            }
        }
        .boxed()
        .shared();

        executions.insert(key, future.clone());
        future
    }

    pub(crate) fn log(&self, event: Event) {
        self.logger.log(event);
    }

    /// Record a primary failure and apply the failure-mode policy.
    pub(crate) fn record_failure(&self, script: &ScriptReference, reason: &FailureReason) {
        self.record_error(script, reason.to_string());
    }

    fn record_error(&self, script: &ScriptReference, message: String) {
        self.errors
            .lock()
            .expect("errors poisoned")
            .push(ScriptError { script: script.clone(), message });
        match self.failure_mode {
            FailureMode::Continue => {}
            FailureMode::NoNew => self.abort.abort(false),
            FailureMode::Kill => self.abort.abort(true),
        }
    }

    pub(crate) fn record_fingerprint(&self, key: &str, fingerprint: Arc<Fingerprint>) {
        self.fingerprints
            .lock()
            .expect("fingerprints poisoned")
            .insert(key.to_string(), fingerprint);
    }

    pub(crate) fn record_failed_digest(&self, key: &str, digest: &str) {
        self.failed_digests
            .lock()
            .expect("failed digests poisoned")
            .insert(key.to_string(), digest.to_string());
    }

    /// Claim the previous iteration's live service for this script, if one
    /// was handed over.
    pub(crate) fn take_adoptee(&self, key: &str) -> Option<AdoptableService> {
        self.adoptees.lock().expect("adoptees poisoned").remove(key)
    }

    pub(crate) fn register_service(&self, key: String, handle: ServiceHandle) {
        self.services.lock().expect("services poisoned").insert(key, handle);
    }

    pub(crate) fn service_handle(&self, key: &str) -> Option<ServiceHandle> {
        self.services.lock().expect("services poisoned").get(key).cloned()
    }
}

/// Depth-first search for a cycle; the analyzer rejects cycles upstream, so
/// finding one here is a hand-off bug surfaced as `dependency-invalid`.
fn find_cycle(root: &Arc<ScriptConfig>) -> Option<ScriptReference> {
    fn visit(
        config: &Arc<ScriptConfig>,
        visiting: &mut Vec<String>,
        visited: &mut std::collections::HashSet<String>,
    ) -> Option<ScriptReference> {
        let key = config.reference.key().as_str().to_string();
        if visiting.contains(&key) {
            return Some(config.reference.clone());
        }
        if visited.contains(&key) {
            return None;
        }
        visiting.push(key.clone());
        for Dependency { config: dep, .. } in &config.dependencies {
            if let Some(offender) = visit(dep, visiting, visited) {
                return Some(offender);
            }
        }
        visiting.pop();
        visited.insert(key);
        None
    }

    visit(root, &mut Vec::new(), &mut std::collections::HashSet::new())
}
