//! Script child processes.
//!
//! One [`ScriptChild`] owns one spawned command: its process handle, its
//! process group, and the channel its stdout/stderr chunks arrive on. The
//! handle is movable as a whole, which is what service adoption relies on.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    path::Path,
    process::Stdio,
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    time::timeout,
};
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::{EnvValue, ScriptConfig},
    event::OutputStream,
};

/// How long a child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Read size for the stdout/stderr pumps.
const OUTPUT_BUF_SIZE: usize = 8 * 1024;

/// How a child process finished.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitResult {
    Exited { code: i32 },
    Signalled { signal: i32 },
}

impl ExitResult {
    pub fn success(&self) -> bool {
        matches!(self, ExitResult::Exited { code: 0 })
    }
}

/// Human name for a signal number.
pub fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGABRT => "SIGABRT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

/// A chunk of child output, in arrival order per stream.
#[derive(Clone, Debug)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// An owned, spawned script command.
pub struct ScriptChild {
    child: Child,
    pid: Option<u32>,
    output: flume::Receiver<OutputChunk>,
}

impl std::fmt::Debug for ScriptChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptChild").field("pid", &self.pid).finish()
    }
}

impl ScriptChild {
    /// Spawn the script's command in its package directory.
    ///
    /// The child environment is the parent environment overlaid with the
    /// script's literal `env` declarations, with `PATH` prefixed by every
    /// ancestor `node_modules/.bin` so locally installed binaries resolve
    /// without shell intervention. The child gets its own process group so
    /// that `kill` reaches grandchildren.
    #[instrument(skip_all, fields(script = %config.reference))]
    pub fn spawn(config: &ScriptConfig) -> Result<Self> {
        let command_line = full_command_line(config);
        let package_dir = &config.reference.package_dir;
        debug!(%command_line, "spawning script command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&command_line)
            .current_dir(package_dir)
            .env("PATH", augmented_path(package_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in literal_env(&config.env) {
            command.env(name, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().context("spawn command")?;
        let pid = child.id();

        let (sender, output) = flume::unbounded();
        if let Some(stdout) = child.stdout.take() {
            spawn_pump(stdout, OutputStream::Stdout, sender.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_pump(stderr, OutputStream::Stderr, sender);
        }

        Ok(Self { child, pid, output })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The stream of output chunks. Cloneable; closes once the child exits
    /// and both pipes reach EOF, so draining it to completion observes all
    /// buffered output.
    pub fn output(&self) -> flume::Receiver<OutputChunk> {
        self.output.clone()
    }

    /// Wait for the child to exit. Cancel-safe; may be called again after
    /// completion (the status is cached by the runtime).
    pub async fn wait_status(&mut self) -> Result<ExitResult> {
        let status = self.child.wait().await.context("wait for child")?;
        Ok(exit_result(status))
    }

    /// Terminate the child: SIGTERM to its process group, then SIGKILL
    /// after a grace period. Resolves once the child has exited.
    #[instrument(skip(self), fields(pid = ?self.pid))]
    pub async fn kill(&mut self) -> Result<ExitResult> {
        self.signal_group(libc::SIGTERM);
        match timeout(KILL_GRACE, self.child.wait()).await {
            Ok(status) => Ok(exit_result(status.context("wait for child")?)),
            Err(_elapsed) => {
                warn!("child survived SIGTERM, escalating to SIGKILL");
                self.signal_group(libc::SIGKILL);
                let status = self.child.wait().await.context("wait for child")?;
                Ok(exit_result(status))
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: i32) {
        if let Some(pid) = self.pid {
            // The child is its own process group leader; negative pid
            // addresses the whole group.
            let result = unsafe { libc::kill(-(pid as i32), signal) };
            trace!(pid, signal, result, "signalled process group");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: i32) {
        if let Err(err) = self.child.start_kill() {
            warn!(?err, "failed to kill child");
        }
    }
}

fn exit_result(status: std::process::ExitStatus) -> ExitResult {
    if let Some(code) = status.code() {
        return ExitResult::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitResult::Signalled { signal };
        }
    }
    ExitResult::Exited { code: -1 }
}

fn spawn_pump(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    stream: OutputStream,
    sender: flume::Sender<OutputChunk>,
) {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; OUTPUT_BUF_SIZE];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(len) => {
                    let chunk = OutputChunk { stream, data: buffer[..len].to_vec() };
                    if sender.send_async(chunk).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(?err, %stream, "error reading child output");
                    break;
                }
            }
        }
    });
}

/// The command with extra arguments appended, shell-quoted.
fn full_command_line(config: &ScriptConfig) -> String {
    let command = config.command.as_deref().unwrap_or_default();
    if config.extra_args.is_empty() {
        return command.to_string();
    }
    let mut line = command.to_string();
    for arg in &config.extra_args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

/// Single-quote a string for POSIX sh.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b'=' | b':'))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn literal_env(env: &BTreeMap<String, EnvValue>) -> impl Iterator<Item = (&String, &String)> {
    env.iter().filter_map(|(name, value)| match value {
        EnvValue::Literal(literal) => Some((name, literal)),
        EnvValue::External { .. } => None,
    })
}

/// `PATH` with each ancestor `node_modules/.bin` prepended, innermost
/// first.
fn augmented_path(package_dir: &Path) -> OsString {
    let mut paths = package_dir
        .ancestors()
        .map(|dir| dir.join("node_modules").join(".bin"))
        .collect::<Vec<_>>();
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).unwrap_or_else(|_| std::env::var_os("PATH").unwrap_or_default())
}
