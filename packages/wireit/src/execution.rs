//! Per-script executions.
//!
//! One execution exists per reachable script per run. Command-bearing
//! scripts use [`standard::StandardExecution`]; services use
//! [`service::ServiceExecution`]. Both share the dependency-execution
//! protocol here: dependencies run in parallel, and a dependent resumes
//! only once every dependency has produced its fingerprint.

pub mod service;
pub mod standard;

use std::sync::{Arc, Weak};

use crate::{
    config::ScriptConfig,
    event::{Event, EventKind, FailureReason},
    executor::ExecutorInner,
    fingerprint::{Fingerprint, FingerprintError},
};

/// How an execution ended, as observed by its dependents. Cheap to clone:
/// this is the value memoized in the executor's shared futures.
#[derive(Clone, Debug)]
pub enum ExecutionOutcome {
    /// The script reached a terminal success state; dependents fold this
    /// fingerprint into their own.
    Success(Arc<Fingerprint>),
    /// Failed or cancelled. The responsible execution has already emitted
    /// events and recorded errors; dependents only cancel themselves.
    Failure,
}

/// Everything an execution needs from its run. Holds the executor weakly:
/// an execution outliving its run (a dropped watch iteration) observes that
/// as cancellation.
pub(crate) struct ExecContext {
    pub(crate) executor: Weak<ExecutorInner>,
    pub(crate) config: Arc<ScriptConfig>,
}

/// A dependency's settled contribution, in declaration order.
pub(crate) struct SettledDependency {
    pub(crate) config: Arc<ScriptConfig>,
    pub(crate) result: crate::fingerprint::DependencyResult,
}

/// Execute all dependencies in parallel and await their fingerprints.
/// `Err(())` means at least one dependency failed; the caller emits
/// `start-cancelled` and stops.
pub(crate) async fn execute_dependencies(
    inner: &Arc<ExecutorInner>,
    config: &Arc<ScriptConfig>,
) -> Result<Vec<SettledDependency>, ()> {
    let executions = config
        .dependencies
        .iter()
        .map(|dependency| {
            let execution = inner.execution(&dependency.config);
            (dependency.config.clone(), dependency.cascade, execution)
        })
        .collect::<Vec<_>>();

    let mut settled = Vec::with_capacity(executions.len());
    let mut failed = false;
    let outcomes =
        futures::future::join_all(executions.iter().map(|(_, _, execution)| execution.clone()))
            .await;
    for ((dep_config, cascade, _), outcome) in executions.into_iter().zip(outcomes) {
        match outcome {
            ExecutionOutcome::Success(fingerprint) => {
                settled.push(SettledDependency {
                    result: crate::fingerprint::DependencyResult {
                        script: dep_config.reference.key().as_str().to_string(),
                        fingerprint,
                        cascade,
                    },
                    config: dep_config,
                });
            }
            ExecutionOutcome::Failure => failed = true,
        }
    }
    if failed { Err(()) } else { Ok(settled) }
}

/// Emit the `start-cancelled` failure for a script whose dependency
/// failed. Deliberately not recorded as a run error: the run summary names
/// the one primary failure, not every dependent it cancelled.
pub(crate) fn emit_start_cancelled(inner: &ExecutorInner, config: &ScriptConfig) {
    inner.log(Event::new(
        &config.reference,
        EventKind::Failure(FailureReason::StartCancelled),
    ));
}

/// Map a fingerprint error to its failure event reason.
pub(crate) fn fingerprint_failure(error: &FingerprintError) -> FailureReason {
    match error {
        FingerprintError::InputFileDeleted { path } => {
            FailureReason::InputFileDeletedUnexpectedly { path: path.clone() }
        }
        FingerprintError::PathEscape { pattern } => {
            FailureReason::PathEscape { pattern: pattern.clone() }
        }
        FingerprintError::Manifest { message } => {
            FailureReason::FileManifestError { message: message.clone() }
        }
    }
}
