//! QEMU virtual machine driver
//!
//! `load` creates a copy-on-write disk backed by the image's `qemu` (or
//! `vmdk`) mount and `unload` removes it. `start` runs the emulator in the
//! foreground; its exit reports `stopped`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use paddock_core::driver::{Driver, DriverVerb, Monitor, VerbOptions, VerbOutcome};
use paddock_core::lifecycle::LifecycleState;
use paddock_core::registry::{DriverContext, DriverFactory};
use paddock_core::{PaddockError, PaddockResult};

use crate::exec::{self, ExecOptions, Executor, Supervised};
use crate::params::{nics, str_list, str_param, u64_param};

const DISK_FORMATS: &[&str] = &["qemu", "vmdk"];

/// Emulator binary: `qemu` param, else `qemu-system-<arch>`, else `kvm`
pub fn executable(ctx: &DriverContext) -> String {
    if let Some(qemu) = str_param(&ctx.params, "qemu") {
        return qemu.to_string();
    }
    let arch = str_param(&ctx.params, "arch")
        .or_else(|| ctx.image.as_ref().and_then(|i| i.manifest().arch.as_deref()));
    match arch {
        Some(arch) => format!("qemu-system-{}", arch),
        None => "kvm".to_string(),
    }
}

/// Emulator command line, without the executable
pub fn emulator_args(ctx: &DriverContext, disk: &Path) -> PaddockResult<Vec<String>> {
    let params = &ctx.params;
    let mut args = vec![
        "-name".to_string(),
        ctx.node_id.clone(),
        "-m".to_string(),
        u64_param(params, "memory")?.unwrap_or(512).to_string(),
        "-smp".to_string(),
        u64_param(params, "cpus")?.unwrap_or(1).to_string(),
        "-drive".to_string(),
        format!("file={},if=virtio", disk.display()),
        "-nographic".to_string(),
    ];

    for (n, nic) in nics(params, |id| ctx.network(id))?.into_iter().enumerate() {
        let netdev = match nic.link() {
            Some(bridge) => format!("bridge,id=net{},br={}", n, bridge),
            None => format!("user,id=net{}", n),
        };
        let mut device = format!("virtio-net-pci,netdev=net{}", n);
        if let Some(address) = &nic.address {
            device.push_str(&format!(",mac={}", address.mac));
        }
        args.extend(["-netdev".to_string(), netdev, "-device".to_string(), device]);
    }

    args.extend(str_list(params, "qemu-options")?);
    Ok(args)
}

pub struct QemuDriver {
    id: String,
    workdir: PathBuf,
    executable: String,
    source: PathBuf,
    disk: PathBuf,
    args: Vec<String>,
    monitor: Monitor,
    executor: Executor,
    process: Arc<Mutex<Option<Supervised>>>,
}

impl QemuDriver {
    pub fn new(ctx: DriverContext, executor: Executor) -> PaddockResult<Self> {
        let image = ctx.image.as_ref().ok_or_else(|| PaddockError::no_attr("image"))?;
        let source = DISK_FORMATS
            .iter()
            .find_map(|format| image.mount_path(format))
            .ok_or_else(|| {
                PaddockError::validation(
                    "image",
                    format!("{} has no qemu or vmdk mount", image.basedir().display()),
                )
            })?
            .to_path_buf();

        let disk = match source.extension() {
            Some(ext) => ctx.workdir.join(format!("system.{}", ext.to_string_lossy())),
            None => ctx.workdir.join("system"),
        };
        let args = emulator_args(&ctx, &disk)?;

        Ok(Self {
            executable: executable(&ctx),
            id: ctx.node_id,
            workdir: ctx.workdir,
            source,
            disk,
            args,
            monitor: ctx.monitor,
            executor,
            process: Arc::new(Mutex::new(None)),
        })
    }

    pub fn disk(&self) -> &Path {
        &self.disk
    }

    pub fn command_line(&self) -> String {
        exec::render(&self.executable, &self.args)
    }
}

#[async_trait]
impl Driver for QemuDriver {
    fn name(&self) -> &str {
        "qemu"
    }

    fn supports(&self, _verb: DriverVerb) -> bool {
        true
    }

    async fn load(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        let source = self.source.display().to_string();
        let opts = ExecOptions::in_dir(&self.workdir);
        exec::run(
            self.executor.as_ref(),
            "qemu-img",
            &["info".to_string(), source.clone()],
            &opts,
        )
        .await?;
        exec::run(
            self.executor.as_ref(),
            "qemu-img",
            &[
                "create".to_string(),
                "-b".to_string(),
                source,
                self.disk.display().to_string(),
            ],
            &opts,
        )
        .await?;
        Ok(VerbOutcome::Completed)
    }

    async fn unload(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        match tokio::fs::remove_file(&self.disk).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(id = %self.id, "Disk {} already gone", self.disk.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(VerbOutcome::Completed)
    }

    async fn start(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        if self.process.lock().is_some() {
            return Ok(VerbOutcome::Completed);
        }

        let process = self
            .executor
            .spawn(&self.executable, &self.args, &ExecOptions::in_dir(&self.workdir))
            .await?;
        let pid = process.pid;
        let monitor = self.monitor.clone();
        let slot = Arc::clone(&self.process);
        let id = self.id.clone();
        let supervised = exec::supervise(self.id.clone(), process, |_| {}, move |exit| async move {
            info!(id = %id, "Emulator exited: {}", exit);
            {
                let mut current = slot.lock();
                if current.as_ref().map(Supervised::pid) == Some(pid) {
                    *current = None;
                }
            }
            monitor.state(LifecycleState::Stopped);
        });
        *self.process.lock() = Some(supervised);
        info!(id = %self.id, "Emulator started (pid {})", pid);
        Ok(VerbOutcome::Completed)
    }

    async fn stop(&self, opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        let Some(pid) = self.process.lock().as_ref().map(Supervised::pid) else {
            return Ok(VerbOutcome::Completed);
        };
        let signal = if opts.force { Signal::SIGKILL } else { Signal::SIGTERM };
        self.executor.kill(pid, signal).await?;
        Ok(VerbOutcome::Pending)
    }

    fn dump(&self) -> Value {
        json!({
            "executable": self.executable,
            "disk": self.disk,
            "pid": self.process.lock().as_ref().map(Supervised::pid),
        })
    }
}

pub struct QemuDriverFactory {
    executor: Executor,
}

impl QemuDriverFactory {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl DriverFactory for QemuDriverFactory {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn description(&self) -> &'static str {
        "QEMU virtual machines on a copy-on-write disk"
    }

    fn create(&self, ctx: DriverContext) -> PaddockResult<Arc<dyn Driver>> {
        Ok(Arc::new(QemuDriver::new(ctx, Arc::clone(&self.executor))?))
    }
}
