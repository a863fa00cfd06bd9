//! Shared helpers for paddock-drivers integration tests

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use paddock_core::config::ConfigBuilder;
use paddock_core::graph::{ObjectType, Properties, RefIds};
use paddock_core::objects;
use paddock_core::registry::PluginRegistry;
use paddock_core::subnet::{MacPrefix, StaticInterfaces, SubnetAllocator};
use paddock_core::Context;
use paddock_drivers::exec::{
    render, CommandExecutor, CommandOutput, ExecOptions, ExitInfo, OutputLine, SpawnedProcess,
};

/// A process handed out by [`FakeExecutor::spawn`], driven by the test
pub struct FakeProcess {
    pub pid: u32,
    pub cmdline: String,
    pub opts: ExecOptions,
    stdin: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    output: mpsc::UnboundedSender<OutputLine>,
    exit: Mutex<Option<oneshot::Sender<ExitInfo>>>,
}

impl FakeProcess {
    /// Write a line to the process's stdout
    pub fn say(&self, line: &str) {
        let _ = self.output.send(OutputLine::Stdout(line.to_string()));
    }

    /// End the process; false if it already ended
    pub fn exit(&self, info: ExitInfo) -> bool {
        match self.exit.lock().take() {
            Some(tx) => tx.send(info).is_ok(),
            None => false,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit.lock().is_none()
    }

    /// Next line the driver wrote to the process's stdin
    pub async fn next_line(&self) -> Option<String> {
        let mut rx = self.stdin.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }
}

struct Rule {
    pattern: String,
    code: i32,
    stdout: String,
}

/// Executor that records command lines and answers from a script.
///
/// Commands succeed with empty output unless a rule matches; the most
/// recently added rule whose pattern occurs in the command line wins.
/// Killing a spawned process ends it with the signal unless
/// [`FakeExecutor::ignore_kills`] was called.
pub struct FakeExecutor {
    commands: Mutex<Vec<(String, ExecOptions)>>,
    rules: Mutex<Vec<Rule>>,
    spawn_failures: Mutex<Vec<String>>,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    kills: Mutex<Vec<(u32, Signal)>>,
    next_pid: AtomicU32,
    ignore_kills: AtomicBool,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            spawn_failures: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1000),
            ignore_kills: AtomicBool::new(false),
        }
    }
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, pattern: &str, code: i32, stdout: &str) {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            code,
            stdout: stdout.to_string(),
        });
    }

    pub fn fail(&self, pattern: &str) {
        self.respond(pattern, 1, "");
    }

    pub fn fail_spawn(&self, pattern: &str) {
        self.spawn_failures.lock().push(pattern.to_string());
    }

    pub fn ignore_kills(&self) {
        self.ignore_kills.store(true, Ordering::SeqCst);
    }

    /// Every command line run or spawned, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(pattern))
            .collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        !self.commands_matching(pattern).is_empty()
    }

    /// Options of the last command matching `pattern`
    pub fn options_of(&self, pattern: &str) -> Option<ExecOptions> {
        self.commands
            .lock()
            .iter()
            .rev()
            .find(|(c, _)| c.contains(pattern))
            .map(|(_, opts)| opts.clone())
    }

    pub fn processes(&self) -> Vec<Arc<FakeProcess>> {
        self.processes.lock().clone()
    }

    pub fn process(&self, pattern: &str) -> Option<Arc<FakeProcess>> {
        self.processes
            .lock()
            .iter()
            .rev()
            .find(|p| p.cmdline.contains(pattern))
            .cloned()
    }

    pub fn kills(&self) -> Vec<(u32, Signal)> {
        self.kills.lock().clone()
    }

    fn record(&self, program: &str, args: &[String], opts: &ExecOptions) -> String {
        let cmdline = render(program, args);
        self.commands.lock().push((cmdline.clone(), opts.clone()));
        cmdline
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> io::Result<CommandOutput> {
        let cmdline = self.record(program, args, opts);
        let rules = self.rules.lock();
        let (code, stdout) = rules
            .iter()
            .rev()
            .find(|r| cmdline.contains(&r.pattern))
            .map(|r| (r.code, r.stdout.clone()))
            .unwrap_or((0, String::new()));
        Ok(CommandOutput {
            exit: ExitInfo::code(code),
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
        })
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> io::Result<SpawnedProcess> {
        let cmdline = self.record(program, args, opts);
        if self.spawn_failures.lock().iter().any(|p| cmdline.contains(p)) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (stdin, stdin_rx) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exited) = oneshot::channel();
        self.processes.lock().push(Arc::new(FakeProcess {
            pid,
            cmdline,
            opts: opts.clone(),
            stdin: tokio::sync::Mutex::new(stdin_rx),
            output: output_tx,
            exit: Mutex::new(Some(exit_tx)),
        }));

        Ok(SpawnedProcess {
            pid,
            stdin,
            output,
            exited,
        })
    }

    async fn kill(&self, pid: u32, signal: Signal) -> io::Result<()> {
        self.kills.lock().push((pid, signal));
        if self.ignore_kills.load(Ordering::SeqCst) {
            return Ok(());
        }
        let process = self.processes.lock().iter().find(|p| p.pid == pid).cloned();
        match process {
            Some(process) => {
                process.exit(ExitInfo::signaled(signal));
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such process")),
        }
    }
}

/// Wait for a condition with simple polling
pub async fn wait_for_condition<F, Fut>(
    mut condition: F,
    max_wait: Duration,
    check_interval: Duration,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if condition().await {
            return Ok(());
        }
        sleep(check_interval).await;
    }
    Err(format!("Condition not met within {:?}", max_wait))
}

/// Poll `condition` every 10ms for up to 5s
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> Result<(), String> {
    wait_for_condition(
        || std::future::ready(condition()),
        Duration::from_secs(5),
        Duration::from_millis(10),
    )
    .await
}

/// Context with every plugin of this crate wired to `executor`
pub fn drivers_context(workdir: &Path, executor: Arc<FakeExecutor>) -> Context {
    let config = ConfigBuilder::new()
        .workdir(workdir)
        .subnets(["10.0.0.0/8,24"])
        .verb_timeout(Duration::from_secs(5))
        .build()
        .expect("valid test config");
    let allocator = SubnetAllocator::with_interfaces(
        config.network.pool_specs().expect("valid pool specs"),
        config.network.reserved_ips,
        MacPrefix::default(),
        Arc::new(StaticInterfaces(Vec::new())),
    );
    let mut registry = PluginRegistry::default();
    paddock_drivers::register_all(&mut registry, executor);
    Context::with_parts(config, registry, allocator, objects::standard_models())
        .expect("valid context")
}

pub fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        _ => Properties::new(),
    }
}

pub fn refs(entries: &[(ObjectType, &str)]) -> RefIds {
    let mut out = RefIds::new();
    for (object_type, id) in entries {
        out.entry(*object_type).or_default().push(id.to_string());
    }
    out
}

/// Image directory `name` under `root` with the given manifest
pub fn write_image(root: &Path, name: &str, manifest: &str) -> String {
    let dir = root.join("images").join(name);
    std::fs::create_dir_all(&dir).expect("image dir");
    std::fs::write(dir.join("manifest.yml"), manifest).expect("manifest");
    dir.to_string_lossy().to_string()
}

/// Cluster `c1` with a network `c1.net` from `provider`
pub async fn cluster_with_network(ctx: &Context, network: Value) {
    ctx.create_object(ObjectType::Cluster, "c1", RefIds::new(), Properties::new())
        .await
        .expect("cluster");
    ctx.create_object(
        ObjectType::Network,
        "c1.net",
        refs(&[(ObjectType::Cluster, "c1")]),
        props(network),
    )
    .await
    .expect("network");
}
