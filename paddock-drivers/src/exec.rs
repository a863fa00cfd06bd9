//! Running external programs
//!
//! Drivers never touch `tokio::process` directly. They go through a
//! [`CommandExecutor`], which the tests replace with a scripted one.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use paddock_core::{PaddockError, PaddockResult};

/// Interpreter for command lines given as a single string
pub const SHELL: &str = "/bin/sh";

/// Working directory, environment and credentials for a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl ExecOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit: ExitInfo,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal as i32),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// One line of output from a spawned process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// A running child process, seen through channels
pub struct SpawnedProcess {
    pub pid: u32,
    /// Lines written to the child's stdin, newline appended
    pub stdin: mpsc::UnboundedSender<String>,
    pub output: mpsc::UnboundedReceiver<OutputLine>,
    pub exited: oneshot::Receiver<ExitInfo>,
}

/// Trait for executing commands - allows mocking in tests
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> io::Result<CommandOutput>;

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> io::Result<SpawnedProcess>;

    async fn kill(&self, pid: u32, signal: Signal) -> io::Result<()>;
}

/// Default command executor that runs real commands
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandExecutor;

impl SystemCommandExecutor {
    fn command(program: &str, args: &[String], opts: &ExecOptions) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).envs(&opts.env);
        if let Some(dir) = &opts.cwd {
            cmd.current_dir(dir);
        }
        if let Some(uid) = opts.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = opts.gid {
            cmd.gid(gid);
        }
        cmd
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<OutputLine>, wrap: fn(String) -> OutputLine)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> io::Result<CommandOutput> {
        let output = Self::command(program, args, opts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            exit: ExitInfo {
                code: output.status.code(),
                signal: output.status.signal(),
            },
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> io::Result<SpawnedProcess> {
        let mut child = Self::command(program, args, opts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Failed to get process ID"))?;

        let (line_tx, output) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone(), OutputLine::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx, OutputLine::Stderr);
        }

        let (stdin, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    let written = pipe.write_all(format!("{}\n", line).as_bytes()).await;
                    if written.is_err() || pipe.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        let (exit_tx, exited) = oneshot::channel();
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    warn!("Waiting for pid {} failed: {}", pid, e);
                    ExitInfo::default()
                }
            };
            let _ = exit_tx.send(info);
        });

        Ok(SpawnedProcess {
            pid,
            stdin,
            output,
            exited,
        })
    }

    async fn kill(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        signal::kill(Pid::from_raw(raw), signal)?;
        Ok(())
    }
}

/// Command line as it appears in the logs
pub fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn log_output(bytes: &[u8], stderr: bool) {
    let text = String::from_utf8_lossy(bytes);
    for line in text.lines() {
        if stderr {
            debug!("[STDERR] {}", line);
        } else {
            debug!("[STDOUT] {}", line);
        }
    }
}

/// Run a program to completion, logging the command, its output and its
/// result. A non-zero exit is an error.
pub async fn run(
    executor: &dyn CommandExecutor,
    program: &str,
    args: &[String],
    opts: &ExecOptions,
) -> PaddockResult<CommandOutput> {
    let cmdline = render(program, args);
    debug!("[SHELL.CMD] {}", cmdline);

    let output = executor.execute(program, args, opts).await?;
    log_output(&output.stdout, false);
    log_output(&output.stderr, true);

    if output.success() {
        debug!("[SHELL.OK]");
        Ok(output)
    } else {
        match output.exit.code {
            Some(code) => debug!("[SHELL.RET] {}", code),
            None => debug!("[SHELL.RET] killed {:?}", output.exit.signal),
        }
        Err(PaddockError::driver(cmdline, output.exit))
    }
}

/// Run a command line through the shell
pub async fn sh(
    executor: &dyn CommandExecutor,
    cmdline: &str,
    opts: &ExecOptions,
) -> PaddockResult<CommandOutput> {
    run(executor, SHELL, &["-c".to_string(), cmdline.to_string()], opts).await
}

/// Spawn a command line through the shell, replacing the shell with it
pub async fn spawn_sh(
    executor: &dyn CommandExecutor,
    cmdline: &str,
    opts: &ExecOptions,
) -> PaddockResult<SpawnedProcess> {
    debug!("[SHELL.SPAWN] {}", cmdline);
    let args = ["-c".to_string(), format!("exec {}", cmdline)];
    Ok(executor.spawn(SHELL, &args, opts).await?)
}

/// A spawned process whose output is logged and whose exit can be awaited
#[derive(Clone)]
pub struct Supervised {
    pid: u32,
    stdin: mpsc::UnboundedSender<String>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl fmt::Debug for Supervised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervised")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

impl Supervised {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn send_line(&self, line: &str) -> PaddockResult<()> {
        self.stdin
            .send(line.to_string())
            .map_err(|_| PaddockError::driver("send", "process stdin is closed"))
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        loop {
            if let Some(info) = *rx.borrow_and_update() {
                return info;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().unwrap_or_default();
            }
        }
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`
    pub async fn terminate(&self, executor: &dyn CommandExecutor, grace: Duration) -> ExitInfo {
        if let Some(info) = self.exit_info() {
            return info;
        }
        if let Err(e) = executor.kill(self.pid, Signal::SIGTERM).await {
            debug!("SIGTERM to {} failed: {}", self.pid, e);
        }
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(info) => info,
            Err(_) => {
                warn!("Process {} ignored SIGTERM, killing", self.pid);
                if let Err(e) = executor.kill(self.pid, Signal::SIGKILL).await {
                    debug!("SIGKILL to {} failed: {}", self.pid, e);
                }
                self.wait().await
            }
        }
    }
}

/// Log a spawned process's output, hand stdout lines to `on_stdout` and run
/// `on_exit` once it is gone
pub fn supervise<L, E, F>(
    label: impl Into<String>,
    process: SpawnedProcess,
    mut on_stdout: L,
    on_exit: E,
) -> Supervised
where
    L: FnMut(&str) + Send + 'static,
    E: FnOnce(ExitInfo) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let label = label.into();
    let SpawnedProcess {
        pid,
        stdin,
        mut output,
        mut exited,
    } = process;
    let (exit_tx, exit) = watch::channel(None);

    let mut handle = move |line: OutputLine| match line {
        OutputLine::Stdout(text) => {
            debug!(process = %label, "[STDOUT] {}", text);
            on_stdout(&text);
        }
        OutputLine::Stderr(text) => debug!(process = %label, "[STDERR] {}", text),
    };

    tokio::spawn(async move {
        let info = loop {
            tokio::select! {
                biased;
                line = output.recv() => match line {
                    Some(line) => handle(line),
                    None => break (&mut exited).await.unwrap_or_default(),
                },
                info = &mut exited => {
                    while let Ok(line) = output.try_recv() {
                        handle(line);
                    }
                    break info.unwrap_or_default();
                }
            }
        };
        debug!(pid, "Process terminated: {}", info);
        exit_tx.send_replace(Some(info));
        on_exit(info).await;
    });

    Supervised { pid, stdin, exit }
}

/// Shared executor handle
pub type Executor = Arc<dyn CommandExecutor>;
