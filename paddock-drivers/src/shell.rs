//! Node driver backed by external programs
//!
//! Two modes are supported:
//!
//! - **simple**: the node parameters name command lines for `load`,
//!   `pre-start`, `start`, `post-start`, `pre-stop`, `stop`, `post-stop`,
//!   `unload`, `state` and `status`. Only `start` is required.
//! - **contract**: `ctl` names a controller program that stays up while the
//!   node is loaded. It is told `START`, `STOP`, `STOP-FORCE` and `STATUS` on
//!   stdin and answers with `state <s>`, `error <msg>` or `status <json>`
//!   lines on stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use paddock_core::driver::{Driver, DriverVerb, Monitor, MonitorEvent, VerbOptions, VerbOutcome};
use paddock_core::lifecycle::LifecycleState;
use paddock_core::registry::{DriverContext, DriverFactory};
use paddock_core::{PaddockError, PaddockResult};

use crate::exec::{self, ExecOptions, Executor, Supervised};
use crate::params::{bool_param, str_list, str_map, str_param, u64_param};

const DEFAULT_MONITOR_DELAY: Duration = Duration::from_millis(1000);

/// Command lines of a simple-mode node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCommands {
    pub load: Option<String>,
    pub pre_start: Vec<String>,
    pub start: String,
    pub post_start: Vec<String>,
    pub pre_stop: Vec<String>,
    pub stop: Option<String>,
    pub post_stop: Vec<String>,
    pub unload: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
}

impl ShellCommands {
    pub fn from_params(params: &paddock_core::graph::Properties) -> PaddockResult<Self> {
        let single = |key: &str| str_param(params, key).map(str::to_string);
        Ok(Self {
            load: single("load"),
            pre_start: str_list(params, "pre-start")?,
            start: single("start").ok_or_else(|| PaddockError::no_attr("start"))?,
            post_start: str_list(params, "post-start")?,
            pre_stop: str_list(params, "pre-stop")?,
            stop: single("stop"),
            post_stop: str_list(params, "post-stop")?,
            unload: single("unload"),
            state: single("state"),
            status: single("status"),
        })
    }
}

fn exec_options(ctx: &DriverContext) -> PaddockResult<ExecOptions> {
    let mut opts = ExecOptions::in_dir(&ctx.workdir).env("NODE_ID", ctx.node_id.clone());
    opts.env.extend(str_map(&ctx.params, "env")?);
    opts.uid = u64_param(&ctx.params, "uid")?
        .map(|v| u32::try_from(v).map_err(|_| PaddockError::bad_attr("uid", v)))
        .transpose()?;
    opts.gid = u64_param(&ctx.params, "gid")?
        .map(|v| u32::try_from(v).map_err(|_| PaddockError::bad_attr("gid", v)))
        .transpose()?;
    Ok(opts)
}

fn parse_status(text: &str) -> Option<Value> {
    match serde_json::from_str(text.trim()) {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Status parse error: {}", e);
            None
        }
    }
}

/// Simple-mode driver
pub struct SimpleShellDriver {
    id: String,
    commands: ShellCommands,
    inproc: bool,
    monitor_delay: Duration,
    opts: ExecOptions,
    monitor: Monitor,
    executor: Executor,
    process: Arc<Mutex<Option<Supervised>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SimpleShellDriver {
    pub fn new(ctx: DriverContext, executor: Executor) -> PaddockResult<Self> {
        let commands = ShellCommands::from_params(&ctx.params)?;
        let inproc = bool_param(&ctx.params, "inproc").unwrap_or(false) || commands.stop.is_none();
        let monitor_delay = u64_param(&ctx.params, "monitor-delay")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MONITOR_DELAY);

        Ok(Self {
            opts: exec_options(&ctx)?,
            id: ctx.node_id,
            commands,
            inproc,
            monitor_delay,
            monitor: ctx.monitor,
            executor,
            process: Arc::new(Mutex::new(None)),
            poller: Mutex::new(None),
        })
    }

    pub fn is_inproc(&self) -> bool {
        self.inproc
    }

    async fn invoke(&self, name: &str, cmdline: &str) -> PaddockResult<()> {
        debug!(id = %self.id, "INVOKE {}", name);
        exec::sh(self.executor.as_ref(), cmdline, &self.opts).await?;
        Ok(())
    }

    /// Run hook commands in order. A leading `-` ignores that command's
    /// failure; otherwise the first failure stops the sequence.
    async fn hooks(&self, prefix: &str, cmds: &[String]) -> PaddockResult<()> {
        for cmd in cmds {
            let cmd = cmd.trim();
            let (cmd, ignore) = match cmd.strip_prefix('-') {
                Some(rest) => (rest.trim_start(), true),
                None => (cmd, false),
            };
            debug!(id = %self.id, "{} INVOKE {}", prefix, cmd);
            if let Err(e) = exec::sh(self.executor.as_ref(), cmd, &self.opts).await {
                if !ignore {
                    error!(id = %self.id, "INVOKE ERR: {} {}", e, cmd);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn spawn_start(&self) -> PaddockResult<()> {
        let process = exec::spawn_sh(self.executor.as_ref(), &self.commands.start, &self.opts).await?;
        let pid = process.pid;
        let slot = Arc::clone(&self.process);
        let monitor = self.monitor.clone();
        let supervised = exec::supervise(self.id.clone(), process, |_| {}, move |_info| async move {
            {
                let mut current = slot.lock();
                if current.as_ref().map(Supervised::pid) == Some(pid) {
                    *current = None;
                }
            }
            monitor.state(LifecycleState::Stopped);
        });
        *self.process.lock() = Some(supervised);
        info!(id = %self.id, "Started in-process command (pid {})", pid);
        Ok(())
    }

    fn start_state_monitor(&self) {
        let Some(state_cmd) = self.commands.state.clone() else {
            return;
        };
        let executor = Arc::clone(&self.executor);
        let opts = self.opts.clone();
        let monitor = self.monitor.clone();
        let delay = self.monitor_delay;
        let id = self.id.clone();

        let task = tokio::spawn(async move {
            loop {
                debug!(id = %id, "QUERY_STATE");
                let ok = exec::sh(executor.as_ref(), &state_cmd, &opts).await.is_ok();
                debug!(id = %id, "STATE {}", if ok { 0 } else { 1 });
                monitor.state(if ok {
                    LifecycleState::Running
                } else {
                    LifecycleState::Stopped
                });
                tokio::time::sleep(delay).await;
            }
        });
        if let Some(previous) = self.poller.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_state_monitor(&self) {
        if let Some(task) = self.poller.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SimpleShellDriver {
    fn drop(&mut self) {
        self.stop_state_monitor();
    }
}

#[async_trait]
impl Driver for SimpleShellDriver {
    fn name(&self) -> &str {
        "shell"
    }

    fn supports(&self, _verb: DriverVerb) -> bool {
        true
    }

    async fn load(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        if let Some(cmd) = &self.commands.load {
            self.invoke("load", cmd).await?;
        }
        Ok(VerbOutcome::Completed)
    }

    async fn unload(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        if let Some(cmd) = &self.commands.unload {
            self.invoke("unload", cmd).await?;
        }
        Ok(VerbOutcome::Completed)
    }

    async fn start(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.hooks("PRE-START", &self.commands.pre_start).await?;

        if self.inproc {
            self.spawn_start().await?;
        } else {
            self.invoke("start", &self.commands.start).await?;
        }

        if let Err(e) = self.hooks("POST-START", &self.commands.post_start).await {
            warn!(id = %self.id, "Post-start hook failed: {}", e);
        }
        if !self.inproc {
            self.start_state_monitor();
        }
        Ok(VerbOutcome::Completed)
    }

    async fn stop(&self, opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        // A poll landing mid-stop would read as a fallback to `running`
        self.stop_state_monitor();
        if let Err(e) = self.hooks("PRE-STOP", &self.commands.pre_stop).await {
            warn!(id = %self.id, "Pre-stop hook failed: {}", e);
        }

        let outcome = if let Some(cmd) = &self.commands.stop {
            if let Err(e) = self.invoke("stop", cmd).await {
                self.start_state_monitor();
                return Err(e);
            }
            self.process.lock().take();
            VerbOutcome::Completed
        } else {
            let pid = self.process.lock().as_ref().map(Supervised::pid);
            match pid {
                Some(pid) => {
                    let signal = if opts.force { Signal::SIGKILL } else { Signal::SIGTERM };
                    debug!(id = %self.id, "Sending {} to {}", signal, pid);
                    self.executor.kill(pid, signal).await?;
                    // The exit watcher reports `stopped`
                    VerbOutcome::Pending
                }
                None => VerbOutcome::Completed,
            }
        };

        if let Err(e) = self.hooks("POST-STOP", &self.commands.post_stop).await {
            warn!(id = %self.id, "Post-stop hook failed: {}", e);
        }
        Ok(outcome)
    }

    async fn status(&self) -> PaddockResult<()> {
        if let Some(cmd) = &self.commands.status {
            let output = exec::sh(self.executor.as_ref(), cmd, &self.opts).await?;
            if let Some(status) = parse_status(&output.stdout_text()) {
                self.monitor.status(status);
            }
        }
        Ok(())
    }

    fn dump(&self) -> Value {
        json!({
            "mode": "simple",
            "inproc": self.inproc,
            "pid": self.process.lock().as_ref().map(Supervised::pid),
        })
    }
}

/// Translate one controller output line into a monitor event
pub fn parse_controller_line(line: &str) -> Option<MonitorEvent> {
    let line = line.trim();
    let (event, rest) = match line.split_once(' ') {
        Some((event, rest)) => (event, rest.trim()),
        None => (line, ""),
    };
    match event.to_ascii_lowercase().as_str() {
        "state" => match rest.to_ascii_lowercase().parse::<LifecycleState>() {
            Ok(state) => Some(MonitorEvent::State(state)),
            Err(_) => {
                warn!("Controller reported unknown state '{}'", rest);
                None
            }
        },
        "error" => Some(MonitorEvent::Error(rest.to_string())),
        "status" => parse_status(rest).map(MonitorEvent::Status),
        _ => None,
    }
}

/// Contract-mode driver
pub struct ContractShellDriver {
    id: String,
    ctl: String,
    opts: ExecOptions,
    monitor: Monitor,
    executor: Executor,
    process: Arc<Mutex<Option<Supervised>>>,
    unloading: Arc<AtomicBool>,
}

impl ContractShellDriver {
    pub fn new(ctx: DriverContext, executor: Executor) -> PaddockResult<Self> {
        let ctl = str_param(&ctx.params, "ctl")
            .ok_or_else(|| PaddockError::no_attr("ctl"))?
            .to_string();
        Ok(Self {
            opts: exec_options(&ctx)?,
            id: ctx.node_id,
            ctl,
            monitor: ctx.monitor,
            executor,
            process: Arc::new(Mutex::new(None)),
            unloading: Arc::new(AtomicBool::new(false)),
        })
    }

    fn send(&self, command: &str) -> PaddockResult<()> {
        let guard = self.process.lock();
        let process = guard
            .as_ref()
            .ok_or_else(|| PaddockError::driver(command, "Operation not supported when offline"))?;
        debug!(id = %self.id, "CTL <- {}", command);
        process.send_line(command)
    }
}

#[async_trait]
impl Driver for ContractShellDriver {
    fn name(&self) -> &str {
        "shell"
    }

    fn supports(&self, _verb: DriverVerb) -> bool {
        true
    }

    async fn load(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.unloading.store(false, Ordering::SeqCst);
        let process = exec::spawn_sh(self.executor.as_ref(), &self.ctl, &self.opts).await?;
        let pid = process.pid;

        let reporter = self.monitor.clone();
        let monitor = self.monitor.clone();
        let slot = Arc::clone(&self.process);
        let unloading = Arc::clone(&self.unloading);
        let id = self.id.clone();

        let supervised = exec::supervise(
            self.id.clone(),
            process,
            move |line| {
                if let Some(event) = parse_controller_line(line) {
                    reporter.report(event);
                }
            },
            move |info| async move {
                {
                    let mut current = slot.lock();
                    if current.as_ref().map(Supervised::pid) == Some(pid) {
                        *current = None;
                    }
                }
                if unloading.swap(false, Ordering::SeqCst) {
                    monitor.state(LifecycleState::Offline);
                } else {
                    warn!(id = %id, "Controller exited unexpectedly: {}", info);
                    monitor.error(format!("controller exited: {}", info));
                }
            },
        );
        *self.process.lock() = Some(supervised);
        info!(id = %self.id, "Controller started (pid {})", pid);
        // The controller announces its state itself
        Ok(VerbOutcome::Pending)
    }

    async fn unload(&self, opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        let pid = self.process.lock().as_ref().map(Supervised::pid);
        match pid {
            Some(pid) => {
                self.unloading.store(true, Ordering::SeqCst);
                let signal = if opts.force { Signal::SIGKILL } else { Signal::SIGTERM };
                self.executor.kill(pid, signal).await?;
                Ok(VerbOutcome::Pending)
            }
            None => Ok(VerbOutcome::Completed),
        }
    }

    async fn start(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.send("START")?;
        Ok(VerbOutcome::Pending)
    }

    async fn stop(&self, opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.send(if opts.force { "STOP-FORCE" } else { "STOP" })?;
        Ok(VerbOutcome::Pending)
    }

    async fn status(&self) -> PaddockResult<()> {
        self.send("STATUS")
    }

    fn dump(&self) -> Value {
        json!({
            "mode": "contract",
            "ctl": self.ctl,
            "pid": self.process.lock().as_ref().map(Supervised::pid),
        })
    }
}

/// Factory for the shell node driver; `ctl` selects contract mode
pub struct ShellDriverFactory {
    executor: Executor,
}

impl ShellDriverFactory {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl DriverFactory for ShellDriverFactory {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn description(&self) -> &'static str {
        "Runs nodes through external commands or a controller program"
    }

    fn create(&self, ctx: DriverContext) -> PaddockResult<Arc<dyn Driver>> {
        let executor = Arc::clone(&self.executor);
        if str_param(&ctx.params, "ctl").is_some() {
            Ok(Arc::new(ContractShellDriver::new(ctx, executor)?))
        } else {
            Ok(Arc::new(SimpleShellDriver::new(ctx, executor)?))
        }
    }
}
