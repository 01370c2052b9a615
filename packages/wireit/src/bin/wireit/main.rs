//! The binary entrypoint for `wireit`, the incremental script runner.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

use wireit::{
    cache::Cache,
    event::{EventLogger, StderrLogger},
    executor::{Executor, ExecutorOptions},
    options::Options,
    pool::WorkerPool,
    watch,
};

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code. Relatedly, in this file
// specifically nothing should be `pub`.
mod graph;
mod log;
mod poll;

/// Poll interval for the built-in file watcher.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, Parser)]
#[command(name = "wireit", about = "Incremental, cached script running", version)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a script and everything it depends on
    Run {
        /// The script to run, as "<package>:<name>"
        script: String,

        /// Path to the analyzed script graph
        #[arg(long, default_value = "wireit.graph.json")]
        graph: PathBuf,

        /// Re-run affected scripts when files change
        #[arg(long)]
        watch: bool,
    },
}

#[instrument]
#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();
    log::make_logger(std::io::stderr, top.color)?.init();

    let code = match top.command {
        Command::Run { script, graph, watch } => run(&script, &graph, watch).await?,
    };
    Ok(ExitCode::from(code as u8))
}

async fn run(script: &str, graph_path: &PathBuf, watch_mode: bool) -> Result<i32> {
    let options = Options::from_env()?;
    let cache = Cache::from_mode(options.cache_mode)?;
    let logger: Arc<dyn EventLogger> = Arc::new(StderrLogger);

    let graph = graph::load(graph_path).await?;
    let root = graph.resolve(script)?;

    if watch_mode {
        let sources = watch::watch_sources(&root);
        let events = poll::poll_events(sources, POLL_INTERVAL);
        let interrupt = async {
            tokio::signal::ctrl_c().await.ok();
        };
        return watch::watch(root, options, logger, cache, events, interrupt).await;
    }

    let executor = Executor::new(
        ExecutorOptions::builder()
            .logger(logger)
            .cache(cache)
            .pool(WorkerPool::new(options.parallelism))
            .failure_mode(options.failure_mode)
            .build(),
    );

    // SIGINT on a single run: kill in-flight commands, then report failure.
    let abort = executor.abort_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort(true);
        }
    });

    let result = executor.execute(&root).await;
    Ok(if result.is_success() { 0 } else { 1 })
}
