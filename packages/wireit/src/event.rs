//! Engine events and the logger sink.
//!
//! Events are values, not exceptions: every observable outcome of a script
//! (success, failure, process output, lifecycle info) is described by an
//! [`Event`] handed to the injected [`EventLogger`]. The engine is testable
//! by substituting [`RecordingLogger`] for the presentation logger.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::config::ScriptReference;

/// One observable engine event, scoped to a single script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub script: ScriptReference,
    pub kind: EventKind,
}

impl Event {
    pub fn new(script: &ScriptReference, kind: EventKind) -> Self {
        Self {
            script: script.clone(),
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Success(SuccessReason),
    Failure(FailureReason),
    Output { stream: OutputStream, data: Vec<u8> },
    Info(InfoReason),
}

/// Why a script reached its terminal success state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuccessReason {
    /// The command ran and exited zero.
    ExitZero,
    /// The script has no command; its dependencies completed.
    NoCommand,
    /// The previous run's fingerprint and outputs are intact; nothing ran.
    Fresh,
    /// Outputs were restored from the cache; nothing ran.
    Cached,
}

/// Why a script reached its terminal failure state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The command exited with a non-zero status.
    ExitNonZero { status: i32 },
    /// The command was terminated by a signal.
    Signalled { signal: String },
    /// The command could not be spawned at all.
    SpawnError { message: String },
    /// A dependency failed, so this script never started.
    StartCancelled,
    /// The command was killed by the executor's failure policy.
    Killed,
    /// I/O failed while gathering the input file manifest.
    FileManifestError { message: String },
    /// An input file disappeared between listing and stat.
    InputFileDeletedUnexpectedly { path: String },
    /// A declared output was not present after a successful exit.
    OutputMissing { path: String },
    /// A pattern resolved outside the package root.
    PathEscape { pattern: String },
    /// A dependency cycle reached the executor. The analyzer should have
    /// rejected this before execution.
    DependencyInvalid { message: String },
    /// The service's own process exited unexpectedly.
    ServiceExitedUnexpectedly,
    /// A service this one depends on exited unexpectedly, so this service
    /// was brought down with it.
    DependencyServiceExitedUnexpectedly,
    /// The script failed on the previous watch iteration and its
    /// fingerprint has not changed, so it was not retried.
    FailedPreviousWatchIteration,
}

/// Non-terminal lifecycle information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InfoReason {
    /// The command is about to run.
    Running,
    /// Another process holds this script's lock; waiting.
    Locked,
    /// A service process was spawned.
    ServiceProcessStarted,
    /// A service reached readiness.
    ServiceReady,
    /// A service stopped. Emitted exactly once per service lifetime.
    ServiceStopped,
    /// Outputs were modified since the last run by something other than
    /// this script, so the previous run no longer counts as fresh.
    OutputModified,
    /// A watch iteration is starting.
    WatchRunStart,
    /// A watch iteration finished.
    WatchRunEnd,
    /// Cache-layer condition worth surfacing.
    Cache(CacheCondition),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheCondition {
    /// The remote service returned 429; caching is disabled for the rest of
    /// the process.
    RateLimited,
    /// The archive exceeded the remote size cap and was not uploaded.
    TooLarge { bytes: u64 },
    /// Another producer reserved this entry first; upload skipped.
    RaceLost,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Success(reason) => write!(f, "success ({reason})"),
            EventKind::Failure(reason) => write!(f, "failure ({reason})"),
            EventKind::Output { stream, data } => {
                write!(f, "{} ({} bytes)", stream, data.len())
            }
            EventKind::Info(reason) => write!(f, "{reason}"),
        }
    }
}

impl fmt::Display for SuccessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessReason::ExitZero => write!(f, "exit zero"),
            SuccessReason::NoCommand => write!(f, "no command"),
            SuccessReason::Fresh => write!(f, "fresh"),
            SuccessReason::Cached => write!(f, "restored from cache"),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitNonZero { status } => write!(f, "exited with status {status}"),
            FailureReason::Signalled { signal } => write!(f, "terminated by {signal}"),
            FailureReason::SpawnError { message } => write!(f, "failed to spawn: {message}"),
            FailureReason::StartCancelled => write!(f, "not started because a dependency failed"),
            FailureReason::Killed => write!(f, "killed"),
            FailureReason::FileManifestError { message } => {
                write!(f, "failed to read input files: {message}")
            }
            FailureReason::InputFileDeletedUnexpectedly { path } => {
                write!(f, "input file deleted unexpectedly: {path}")
            }
            FailureReason::OutputMissing { path } => {
                write!(f, "declared output missing after run: {path}")
            }
            FailureReason::PathEscape { pattern } => {
                write!(f, "pattern escapes the package directory: {pattern}")
            }
            FailureReason::DependencyInvalid { message } => {
                write!(f, "invalid dependency graph: {message}")
            }
            FailureReason::ServiceExitedUnexpectedly => {
                write!(f, "service exited unexpectedly")
            }
            FailureReason::DependencyServiceExitedUnexpectedly => {
                write!(f, "a depended-on service exited unexpectedly")
            }
            FailureReason::FailedPreviousWatchIteration => {
                write!(f, "failed on the previous watch iteration (unchanged)")
            }
        }
    }
}

impl fmt::Display for InfoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoReason::Running => write!(f, "running"),
            InfoReason::Locked => write!(f, "waiting for another process's lock"),
            InfoReason::ServiceProcessStarted => write!(f, "service started"),
            InfoReason::ServiceReady => write!(f, "service ready"),
            InfoReason::ServiceStopped => write!(f, "service stopped"),
            InfoReason::OutputModified => write!(f, "outputs modified since last run"),
            InfoReason::WatchRunStart => write!(f, "watch iteration starting"),
            InfoReason::WatchRunEnd => write!(f, "watch iteration finished"),
            InfoReason::Cache(condition) => write!(f, "cache: {condition}"),
        }
    }
}

impl fmt::Display for CacheCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheCondition::RateLimited => {
                write!(f, "rate limited, caching disabled for this process")
            }
            CacheCondition::TooLarge { bytes } => {
                write!(f, "output too large to upload ({bytes} bytes)")
            }
            CacheCondition::RaceLost => write!(f, "another process uploaded this entry first"),
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Sink for engine events. One call per event; calls for a single script
/// arrive in order.
pub trait EventLogger: Send + Sync {
    fn log(&self, event: Event);
}

/// Logger that writes raw process output to the real stdio streams and a
/// one-line summary for every other event to stderr.
#[derive(Debug, Default)]
pub struct StderrLogger;

impl EventLogger for StderrLogger {
    fn log(&self, event: Event) {
        use std::io::Write;

        match &event.kind {
            EventKind::Output { stream, data } => {
                let result = match stream {
                    OutputStream::Stdout => std::io::stdout().write_all(data),
                    OutputStream::Stderr => std::io::stderr().write_all(data),
                };
                if let Err(err) = result {
                    tracing::warn!(?err, "failed to forward script output");
                }
            }
            kind => eprintln!("[{}] {kind}", event.script),
        }
    }
}

/// Logger that records every event for later inspection. Used by tests.
#[derive(Clone, Debug, Default)]
pub struct RecordingLogger {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events logged so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event log poisoned").clone()
    }

    /// Events logged for one script, in order.
    pub fn events_for(&self, script: &ScriptReference) -> Vec<EventKind> {
        self.events()
            .into_iter()
            .filter(|event| &event.script == script)
            .map(|event| event.kind)
            .collect()
    }

    /// Count of events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }
}

impl EventLogger for RecordingLogger {
    fn log(&self, event: Event) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}
