//! Service execution.
//!
//! A service is a script whose process is expected to keep running. Its
//! execution resolves for consumers at *readiness*, not exit; afterwards a
//! monitor task owns the child and drives the rest of the lifecycle:
//! unexpected exits, cascading shutdown when a depended-on service dies,
//! graceful stop at the end of the run, and detachment into the next watch
//! iteration (adoption).
//!
//! Adoption moves the whole child handle between executions; the old side
//! ends in `detached` with no listeners, so no shared references survive.

use std::sync::{Arc, Weak};

use color_eyre::{Result, eyre::Context};
use lazy_regex::regex::Regex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, instrument, warn};

use crate::{
    config::ScriptConfig,
    event::{Event, EventKind, FailureReason, InfoReason, OutputStream},
    execution::{self, ExecContext, ExecutionOutcome},
    executor::{AbortSignal, ExecutorInner},
    fingerprint::Fingerprint,
    process::{OutputChunk, ScriptChild},
};

/// The service lifecycle states, for tracing and transition assertions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ServiceState {
    Initial,
    ExecutingDeps,
    Fingerprinting,
    StoppingAdoptee,
    Unstarted,
    DepsStarting,
    Starting,
    Readying,
    Started,
    StartedBroken,
    Stopping,
    Stopped,
    Failing,
    Failed,
    Detached,
    Cancelled,
}

fn transition(state: &mut ServiceState, next: ServiceState) {
    debug!(from = ?state, to = ?next, "service state");
    *state = next;
}

/// A live service carried from one run to the next, available for
/// adoption. Moving this value moves process ownership.
#[derive(Debug)]
pub struct AdoptableService {
    pub(crate) child: ScriptChild,
    pub(crate) fingerprint: Arc<Fingerprint>,
    pub(crate) config: Arc<ScriptConfig>,
}

impl AdoptableService {
    /// The script this live process belongs to.
    pub fn reference(&self) -> &crate::config::ScriptReference {
        &self.config.reference
    }

    /// Stop the carried process. For embedders that end a watch session
    /// while still holding detached services.
    pub async fn stop(mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

enum ServiceCommand {
    Stop { reply: oneshot::Sender<()> },
    Detach { reply: oneshot::Sender<Option<AdoptableService>> },
}

/// Cloneable control handle for a started service. Registered with the
/// executor so the run can stop or detach the service at the end, and so
/// dependent services can watch for its failure.
#[derive(Clone)]
pub struct ServiceHandle {
    persistent: bool,
    commands: flume::Sender<ServiceCommand>,
    failed: watch::Receiver<bool>,
}

impl ServiceHandle {
    pub(crate) fn persistent(&self) -> bool {
        self.persistent
    }

    /// Stop the service and wait for it to terminate. A service whose
    /// monitor already finished is already stopped.
    pub(crate) async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send_async(ServiceCommand::Stop { reply }).await.is_err() {
            return;
        }
        done.await.ok();
    }

    /// Take ownership of the live child for hand-off to the next run.
    /// `None` when the service already terminated.
    pub(crate) async fn detach(&self) -> Option<AdoptableService> {
        let (reply, handed) = oneshot::channel();
        if self
            .commands
            .send_async(ServiceCommand::Detach { reply })
            .await
            .is_err()
        {
            return None;
        }
        handed.await.ok().flatten()
    }

    /// Observes `true` once the service has exited unexpectedly.
    pub(crate) fn failure_watch(&self) -> watch::Receiver<bool> {
        self.failed.clone()
    }
}

/// Matches the `ready_when` line regex against accumulated stdout.
struct ReadyMatcher {
    regex: Regex,
    partial: String,
}

impl ReadyMatcher {
    fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern).context("compile ready_when regex")?,
            partial: String::new(),
        })
    }

    /// Feed a stdout chunk; true once any complete line matches.
    fn observe(&mut self, data: &[u8]) -> bool {
        self.partial.push_str(&String::from_utf8_lossy(data));
        let mut matched = false;
        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            if self.regex.is_match(line.trim_end_matches(['\n', '\r'])) {
                matched = true;
            }
        }
        matched
    }
}

/// What the start-phase select loop decided; acted on outside the select so
/// the child handle is free to move.
enum StartEvent {
    Output(OutputChunk),
    OutputClosed,
    Exited,
    Kill,
}

/// What the monitor select loop decided.
enum MonitorEvent {
    Output(OutputChunk),
    OutputClosed,
    Exited,
    Command(Option<ServiceCommand>),
    Kill,
    DependencyFailed,
}

pub(crate) struct ServiceExecution;

impl ServiceExecution {
    #[instrument(skip_all, fields(script = %ctx.config.reference))]
    pub(crate) async fn run(ctx: ExecContext) -> Result<ExecutionOutcome> {
        let Some(inner) = ctx.executor.upgrade() else {
            return Ok(ExecutionOutcome::Failure);
        };
        let config = ctx.config;
        let script = config.reference.clone();
        let key = script.key().as_str().to_string();
        let service = config.service.clone().expect("service execution requires service config");
        let mut state = ServiceState::Initial;

        transition(&mut state, ServiceState::ExecutingDeps);
        let deps = match execution::execute_dependencies(&inner, &config).await {
            Ok(deps) => deps,
            Err(()) => {
                execution::emit_start_cancelled(&inner, &config);
                transition(&mut state, ServiceState::Cancelled);
                return Ok(ExecutionOutcome::Failure);
            }
        };
        if inner.abort.is_aborted() {
            transition(&mut state, ServiceState::Cancelled);
            return Ok(ExecutionOutcome::Failure);
        }

        transition(&mut state, ServiceState::Fingerprinting);
        let dep_results = deps.iter().map(|dep| dep.result.clone()).collect::<Vec<_>>();
        let fingerprint = match Fingerprint::compute(&config, &dep_results).await {
            Ok(fingerprint) => Arc::new(fingerprint),
            Err(error) => {
                let reason = execution::fingerprint_failure(&error);
                inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                inner.record_failure(&script, &reason);
                transition(&mut state, ServiceState::Failed);
                return Ok(ExecutionOutcome::Failure);
            }
        };
        inner.record_fingerprint(&key, fingerprint.clone());

        // Adoption: reuse the previous iteration's live process when its
        // fingerprint still matches; otherwise stop it and start fresh.
        let mut adopted_child = None;
        if let Some(mut adoptee) = inner.take_adoptee(&key) {
            if adoptee.fingerprint.digest() == fingerprint.digest() {
                debug!("adopting live service from previous iteration");
                adopted_child = Some(adoptee.child);
            } else {
                transition(&mut state, ServiceState::StoppingAdoptee);
                let difference = fingerprint.difference(&adoptee.fingerprint);
                debug!(?difference, "service changed since last iteration; stopping adoptee");
                if let Err(error) = adoptee.child.kill().await {
                    warn!(?error, "failed to stop outdated service");
                }
                inner.log(Event::new(&script, EventKind::Info(InfoReason::ServiceStopped)));
            }
        }
        transition(&mut state, ServiceState::Unstarted);

        // Dependencies that are themselves services are already started
        // and ready (their executions resolve at readiness). Collect their
        // failure watches for cascading shutdown.
        transition(&mut state, ServiceState::DepsStarting);
        let dep_failures = deps
            .iter()
            .filter(|dep| dep.config.is_service())
            .filter_map(|dep| inner.service_handle(dep.config.reference.key().as_str()))
            .map(|handle| handle.failure_watch())
            .collect::<Vec<_>>();

        let child = match adopted_child {
            Some(child) => {
                transition(&mut state, ServiceState::Started);
                child
            }
            None => {
                transition(&mut state, ServiceState::Starting);
                let mut child = match ScriptChild::spawn(&config) {
                    Ok(child) => child,
                    Err(error) => {
                        let reason =
                            FailureReason::SpawnError { message: format!("{error:#}") };
                        inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                        inner.record_failure(&script, &reason);
                        transition(&mut state, ServiceState::Failed);
                        return Ok(ExecutionOutcome::Failure);
                    }
                };
                inner.log(Event::new(
                    &script,
                    EventKind::Info(InfoReason::ServiceProcessStarted),
                ));

                if let Some(pattern) = &service.ready_when {
                    transition(&mut state, ServiceState::Readying);
                    match Self::await_readiness(&inner, &config, &mut child, pattern).await? {
                        Readiness::Ready => {}
                        Readiness::ExitedEarly => {
                            transition(&mut state, ServiceState::StartedBroken);
                            let reason = FailureReason::ServiceExitedUnexpectedly;
                            inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                            inner.record_failure(&script, &reason);
                            inner.log(Event::new(
                                &script,
                                EventKind::Info(InfoReason::ServiceStopped),
                            ));
                            transition(&mut state, ServiceState::Failed);
                            return Ok(ExecutionOutcome::Failure);
                        }
                        Readiness::Killed => {
                            inner.log(Event::new(
                                &script,
                                EventKind::Info(InfoReason::ServiceStopped),
                            ));
                            transition(&mut state, ServiceState::Cancelled);
                            return Ok(ExecutionOutcome::Failure);
                        }
                    }
                }
                transition(&mut state, ServiceState::Started);
                inner.log(Event::new(&script, EventKind::Info(InfoReason::ServiceReady)));
                child
            }
        };

        let (commands_tx, commands_rx) = flume::unbounded();
        let (failed_tx, failed_rx) = watch::channel(false);
        let handle = ServiceHandle {
            persistent: service.persistent,
            commands: commands_tx,
            failed: failed_rx,
        };
        inner.register_service(key, handle);

        tokio::spawn(monitor(
            ctx.executor.clone(),
            config.clone(),
            fingerprint.clone(),
            child,
            commands_rx,
            failed_tx,
            dep_failures,
            inner.abort.clone(),
            inner.watch_mode,
        ));

        Ok(ExecutionOutcome::Success(fingerprint))
    }

    /// Drive the child until the readiness regex matches a stdout line.
    async fn await_readiness(
        inner: &Arc<ExecutorInner>,
        config: &ScriptConfig,
        child: &mut ScriptChild,
        pattern: &str,
    ) -> Result<Readiness> {
        let script = &config.reference;
        let mut matcher = ReadyMatcher::new(pattern)?;
        let output = child.output();
        let mut output_open = true;

        loop {
            let event = tokio::select! {
                chunk = output.recv_async(), if output_open => match chunk {
                    Ok(chunk) => StartEvent::Output(chunk),
                    Err(_) => StartEvent::OutputClosed,
                },
                _ = child.wait_status() => StartEvent::Exited,
                _ = inner.abort.kill_signalled() => StartEvent::Kill,
            };
            match event {
                StartEvent::Output(chunk) => {
                    let ready = chunk.stream == OutputStream::Stdout
                        && matcher.observe(&chunk.data);
                    inner.log(Event::new(
                        script,
                        EventKind::Output { stream: chunk.stream, data: chunk.data },
                    ));
                    if ready {
                        return Ok(Readiness::Ready);
                    }
                }
                StartEvent::OutputClosed => output_open = false,
                StartEvent::Exited => {
                    drain_output(inner, script, &output).await;
                    return Ok(Readiness::ExitedEarly);
                }
                StartEvent::Kill => {
                    child.kill().await?;
                    drain_output(inner, script, &output).await;
                    return Ok(Readiness::Killed);
                }
            }
        }
    }
}

enum Readiness {
    Ready,
    ExitedEarly,
    Killed,
}

/// The started-service monitor: owns the child until a terminal state or
/// detachment. Emits `service-stopped` exactly once on every terminal path.
#[allow(clippy::too_many_arguments)]
async fn monitor(
    executor: Weak<ExecutorInner>,
    config: Arc<ScriptConfig>,
    fingerprint: Arc<Fingerprint>,
    mut child: ScriptChild,
    commands: flume::Receiver<ServiceCommand>,
    failed: watch::Sender<bool>,
    mut dep_failures: Vec<watch::Receiver<bool>>,
    abort: AbortSignal,
    watch_mode: bool,
) {
    let script = config.reference.clone();
    let output = child.output();
    let mut output_open = true;
    let mut state = ServiceState::Started;

    // Inside watch mode a depended-on service may exit only to be
    // re-adopted by the next iteration, so the cascade is tolerated there.
    let cascade = !watch_mode && !dep_failures.is_empty();

    loop {
        let event = tokio::select! {
            chunk = output.recv_async(), if output_open => match chunk {
                Ok(chunk) => MonitorEvent::Output(chunk),
                Err(_) => MonitorEvent::OutputClosed,
            },
            _ = child.wait_status() => MonitorEvent::Exited,
            command = commands.recv_async() => MonitorEvent::Command(command.ok()),
            _ = abort.kill_signalled() => MonitorEvent::Kill,
            _ = any_dep_failed(&mut dep_failures), if cascade => MonitorEvent::DependencyFailed,
        };

        let Some(inner) = executor.upgrade() else {
            // The run is gone; nothing can stop us gracefully anymore.
            let _ = child.kill().await;
            return;
        };

        match event {
            MonitorEvent::Output(chunk) => {
                inner.log(Event::new(
                    &script,
                    EventKind::Output { stream: chunk.stream, data: chunk.data },
                ));
            }
            MonitorEvent::OutputClosed => output_open = false,
            MonitorEvent::Exited => {
                transition(&mut state, ServiceState::Failed);
                drain_output(&inner, &script, &output).await;
                let reason = FailureReason::ServiceExitedUnexpectedly;
                inner.log(Event::new(&script, EventKind::Failure(reason.clone())));
                inner.record_failure(&script, &reason);
                failed.send_replace(true);
                inner.log(Event::new(&script, EventKind::Info(InfoReason::ServiceStopped)));
                return;
            }
            MonitorEvent::Command(Some(ServiceCommand::Stop { reply })) => {
                transition(&mut state, ServiceState::Stopping);
                if let Err(error) = child.kill().await {
                    warn!(?error, "failed to stop service");
                }
                drain_output(&inner, &script, &output).await;
                transition(&mut state, ServiceState::Stopped);
                inner.log(Event::new(&script, EventKind::Info(InfoReason::ServiceStopped)));
                let _ = reply.send(());
                return;
            }
            MonitorEvent::Command(Some(ServiceCommand::Detach { reply })) => {
                transition(&mut state, ServiceState::Detached);
                let _ = reply.send(Some(AdoptableService {
                    child,
                    fingerprint,
                    config,
                }));
                return;
            }
            MonitorEvent::Command(None) => {
                // Every handle dropped without a stop: the executor is
                // being torn down. Stop the child rather than leak it.
                transition(&mut state, ServiceState::Stopping);
                let _ = child.kill().await;
                transition(&mut state, ServiceState::Stopped);
                inner.log(Event::new(&script, EventKind::Info(InfoReason::ServiceStopped)));
                return;
            }
            MonitorEvent::Kill => {
                transition(&mut state, ServiceState::Stopping);
                if let Err(error) = child.kill().await {
                    warn!(?error, "failed to kill service");
                }
                drain_output(&inner, &script, &output).await;
                transition(&mut state, ServiceState::Stopped);
                inner.log(Event::new(&script, EventKind::Info(InfoReason::ServiceStopped)));
                return;
            }
            MonitorEvent::DependencyFailed => {
                transition(&mut state, ServiceState::Failing);
                if let Err(error) = child.kill().await {
                    warn!(?error, "failed to kill service after dependency failure");
                }
                drain_output(&inner, &script, &output).await;
                inner.log(Event::new(
                    &script,
                    EventKind::Failure(FailureReason::DependencyServiceExitedUnexpectedly),
                ));
                failed.send_replace(true);
                transition(&mut state, ServiceState::Failed);
                inner.log(Event::new(&script, EventKind::Info(InfoReason::ServiceStopped)));
                return;
            }
        }
    }
}

/// Forward everything the pumps buffered; terminates because the child has
/// exited and the pump senders drop at EOF.
async fn drain_output(
    inner: &ExecutorInner,
    script: &crate::config::ScriptReference,
    output: &flume::Receiver<OutputChunk>,
) {
    while let Ok(chunk) = output.recv_async().await {
        inner.log(Event::new(
            script,
            EventKind::Output { stream: chunk.stream, data: chunk.data },
        ));
    }
}

/// Resolves when any dependency service reports failure.
async fn any_dep_failed(deps: &mut Vec<watch::Receiver<bool>>) {
    if deps.is_empty() {
        std::future::pending::<()>().await;
    }
    let watchers = deps
        .iter_mut()
        .map(|receiver| {
            Box::pin(async move {
                loop {
                    if *receiver.borrow() {
                        return;
                    }
                    if receiver.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            })
        })
        .collect::<Vec<_>>();
    futures::future::select_all(watchers).await;
}
