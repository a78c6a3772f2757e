// dbstream/src/pipeline/mod.rs
//! Spawning and supervising the vendor dump/restore executable.
//!
//! A [`ToolCommand`] is the not-yet-started tool. [`ToolCommand::spawn`] either
//! fails (the tool never ran) or returns a [`SpawnedTool`] whose streams are
//! handed to the [`compose::StreamComposer`].

pub(crate) mod compose;
pub(crate) mod transform;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Operation;
use crate::errors::{PipelineError, Result};

/// How many trailing stderr lines are kept for the failure report.
const DIAGNOSTIC_TAIL: usize = 20;
/// How long to wait for the stderr logger to drain after the tool exits.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Termination of the external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        ExitReport {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => write!(f, "was killed with signal {}", signal),
            (None, None) => f.write_str("terminated without an exit code"),
        }
    }
}

/// Lifecycle of a started tool. Not-yet-started is a [`ToolCommand`];
/// a launch failure never produces a [`SpawnedTool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    Spawned,
    Running,
    Terminated(ExitReport),
}

/// The process side of a pipeline as seen by the composer.
#[async_trait]
pub trait ProcessHandle: Send {
    fn program(&self) -> &str;

    /// Resolves once the process has terminated. Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<ExitReport>;

    /// Forcible termination.
    async fn kill(&mut self) -> io::Result<()>;

    /// Diagnostic output collected so far, for the operator only.
    fn diagnostics(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Cancellation inputs shared by every stage of one operation.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub deadline: Option<Duration>,
}

/// Program, argument vector and the environment scoped to this one child.
#[derive(Clone)]
pub struct ToolCommand {
    program: PathBuf,
    name: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        ToolCommand {
            program,
            name,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Overrides the name used in logs and errors.
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Starts the tool with stdio wired for `operation`: backup reads the
    /// tool's stdout, restore writes its stdin. Stderr always goes to the log.
    pub fn spawn(&self, operation: Operation) -> Result<SpawnedTool> {
        let (stdin, stdout) = match operation {
            Operation::Backup => (Stdio::null(), Stdio::piped()),
            Operation::Restore => (Stdio::piped(), Stdio::null()),
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                warn!("💥 Failed to start {}: {}", self.name, source);
                PipelineError::Spawn {
                    program: self.name.clone(),
                    source,
                }
            })?;

        info!(pid = child.id(), "🚀 Started {}", self.name);

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_TAIL)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(log_stderr(self.name.clone(), stderr, Arc::clone(&tail))));

        Ok(SpawnedTool {
            program: self.name.clone(),
            child,
            state: ToolState::Spawned,
            tail,
            stderr_task,
        })
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn log_stderr(program: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                warn!("⚠️ {}: {}", program, line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == DIAGNOSTIC_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading {} stderr: {}", program, e);
                break;
            }
        }
    }
}

/// A running vendor tool.
pub struct SpawnedTool {
    program: String,
    child: Child,
    state: ToolState,
    tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl SpawnedTool {
    pub fn state(&self) -> ToolState {
        self.state
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        let stdout = self.child.stdout.take();
        if stdout.is_some() {
            self.state = ToolState::Running;
        }
        stdout
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        let stdin = self.child.stdin.take();
        if stdin.is_some() {
            self.state = ToolState::Running;
        }
        stdin
    }
}

#[async_trait]
impl ProcessHandle for SpawnedTool {
    fn program(&self) -> &str {
        &self.program
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        let status = self.child.wait().await?;
        let report = ExitReport::from_status(status);
        self.state = ToolState::Terminated(report);

        // The handle stays in place until drained so a dropped wait resumes the drain.
        if let Some(task) = self.stderr_task.as_mut() {
            if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
                debug!("{} stderr still open after exit", self.program);
            }
            self.stderr_task = None;
        }
        Ok(report)
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await?;
        warn!("🛑 Killed {}", self.program);
        if let Ok(Some(status)) = self.child.try_wait() {
            self.state = ToolState::Terminated(ExitReport::from_status(status));
        }
        Ok(())
    }

    fn diagnostics(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for SpawnedTool {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
