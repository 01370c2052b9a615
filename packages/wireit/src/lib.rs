//! Library for `wireit`.
//!
//! This library is the execution engine behind the `wireit` binary: the
//! dependency-graph scheduler, fingerprinting, freshness and cache decision
//! logic, the service lifecycle, and the cache backends. Configuration
//! analysis and presentation live outside; the engine consumes validated
//! [`config::ScriptConfig`] values and emits [`event::Event`] values to an
//! injected sink.

pub mod cache;
pub mod ci;
pub mod config;
pub mod data_dir;
pub mod event;
pub mod execution;
pub mod executor;
pub mod fingerprint;
pub mod fs;
pub mod glob;
pub mod manifest;
pub mod options;
pub mod pool;
pub mod process;
pub mod watch;
