//! LXC container driver
//!
//! The container's root is an overlay mounted over the image's `rootfs`
//! mount, so every node gets a private writable layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use paddock_core::driver::{Driver, Monitor, VerbOptions, VerbOutcome};
use paddock_core::lifecycle::LifecycleState;
use paddock_core::registry::{DriverContext, DriverFactory};
use paddock_core::{PaddockError, PaddockResult};

use crate::exec::{self, ExecOptions, Executor, Supervised};
use crate::params::{bool_param, nics, str_list, str_param, u64_param};

pub const CONFIG_FILE: &str = "lxc-config";
pub const LOG_FILE: &str = "lxc.log";
pub const OVERLAY_DIR: &str = "rootfs-overlay";
pub const ROOT_DIR: &str = "root";

const DEFAULT_CGROUP_DEVICES: &[&str] = &[
    "lxc.cgroup.devices.deny = a",
    "lxc.cgroup.devices.allow = c *:* m",
    "lxc.cgroup.devices.allow = b *:* m",
    "lxc.cgroup.devices.allow = c 1:3 rwm",
    "lxc.cgroup.devices.allow = c 1:5 rwm",
    "lxc.cgroup.devices.allow = c 5:1 rwm",
    "lxc.cgroup.devices.allow = c 5:0 rwm",
    "lxc.cgroup.devices.allow = c 4:0 rwm",
    "lxc.cgroup.devices.allow = c 4:1 rwm",
    "lxc.cgroup.devices.allow = c 1:9 rwm",
    "lxc.cgroup.devices.allow = c 1:8 rwm",
    "lxc.cgroup.devices.allow = c 136:* rwm",
    "lxc.cgroup.devices.allow = c 5:2 rwm",
    "lxc.cgroup.devices.allow = c 254:0 rwm",
    "lxc.cgroup.devices.allow = c 10:229 rwm",
    "lxc.cgroup.devices.allow = c 10:200 rwm",
    "lxc.cgroup.devices.allow = c 1:7 rwm",
    "lxc.cgroup.devices.allow = c 10:228 rwm",
    "lxc.cgroup.devices.allow = c 10:232 rwm",
];

/// Render the container configuration for a node
pub fn render_config(ctx: &DriverContext, rootfs: &Path) -> PaddockResult<Vec<String>> {
    let params = &ctx.params;
    let image = ctx.image.as_ref().ok_or_else(|| PaddockError::no_attr("image"))?;
    let manifest = image.manifest();

    let mut conf = vec![
        format!("lxc.rootfs={}", rootfs.display()),
        format!("lxc.utsname={}", str_param(params, "utsname").unwrap_or("linux")),
        "lxc.devttydir=".to_string(),
        format!("lxc.tty={}", u64_param(params, "tty")?.unwrap_or(4)),
        format!("lxc.pts={}", u64_param(params, "pts")?.unwrap_or(1024)),
    ];

    let mut caps = "lxc.cap.drop=sys_module mac_admin".to_string();
    if let Some(extra) = str_param(params, "drop-caps") {
        caps.push(' ');
        caps.push_str(extra);
    }
    conf.push(caps);

    if let Some(arch) = str_param(params, "arch").or(manifest.arch.as_deref()) {
        conf.push(format!("lxc.arch={}", arch));
    }
    if let Some(profile) = str_param(params, "aa-profile").or(manifest.aa_profile.as_deref()) {
        conf.push(format!("lxc.aa_profile={}", profile));
    }

    for nic in nics(params, |id| ctx.network(id))? {
        conf.push("lxc.network.type=veth".to_string());
        conf.push("lxc.network.flags=up".to_string());
        if let Some(link) = nic.link() {
            conf.push(format!("lxc.network.link={}", link));
        }
        if let Some(address) = nic.address {
            conf.push(format!("lxc.network.hwaddr={}", address.mac));
            conf.push(format!("lxc.network.ipv4={}", address.ip));
        }
    }

    if !bool_param(params, "no-default-cgroup").unwrap_or(false) {
        conf.extend(DEFAULT_CGROUP_DEVICES.iter().map(|line| line.to_string()));
    }
    conf.extend(str_list(params, "lxc-options")?);

    Ok(conf)
}

pub struct LxcDriver {
    id: String,
    workdir: PathBuf,
    lowerdir: PathBuf,
    config: Vec<String>,
    monitor: Monitor,
    executor: Executor,
    process: Arc<Mutex<Option<Supervised>>>,
}

impl LxcDriver {
    pub fn new(ctx: DriverContext, executor: Executor) -> PaddockResult<Self> {
        let image = ctx.image.as_ref().ok_or_else(|| PaddockError::no_attr("image"))?;
        let lowerdir = image
            .mount_path("rootfs")
            .ok_or_else(|| {
                PaddockError::validation("image", format!("{} has no rootfs mount", image.basedir().display()))
            })?
            .to_path_buf();
        let config = render_config(&ctx, &ctx.workdir.join(ROOT_DIR))?;

        Ok(Self {
            id: ctx.node_id,
            workdir: ctx.workdir,
            lowerdir,
            config,
            monitor: ctx.monitor,
            executor,
            process: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &[String] {
        &self.config
    }

    fn rootfs(&self) -> PathBuf {
        self.workdir.join(ROOT_DIR)
    }

    async fn unmount_rootfs(executor: &Executor, rootfs: &Path) {
        let args = [rootfs.display().to_string()];
        if let Err(e) = exec::run(executor.as_ref(), "umount", &args, &ExecOptions::default()).await {
            warn!("Unmount of {} failed: {}", rootfs.display(), e);
        }
    }

    async fn launch(&self) -> PaddockResult<Supervised> {
        let upperdir = self.workdir.join(OVERLAY_DIR);
        let rootfs = self.rootfs();
        let conffile = self.workdir.join(CONFIG_FILE);
        let logfile = self.workdir.join(LOG_FILE);

        tokio::fs::create_dir_all(&upperdir).await?;
        tokio::fs::create_dir_all(&rootfs).await?;
        tokio::fs::write(&conffile, self.config.join("\n")).await?;

        let mount_args = vec![
            "-t".to_string(),
            "overlayfs".to_string(),
            "-o".to_string(),
            format!("upperdir={},lowerdir={}", upperdir.display(), self.lowerdir.display()),
            "overlay".to_string(),
            rootfs.display().to_string(),
        ];
        exec::run(self.executor.as_ref(), "mount", &mount_args, &ExecOptions::default()).await?;

        let start_args = vec![
            "-n".to_string(),
            self.id.clone(),
            "-f".to_string(),
            conffile.display().to_string(),
            "-o".to_string(),
            logfile.display().to_string(),
        ];
        let process = match self
            .executor
            .spawn("lxc-start", &start_args, &ExecOptions::in_dir(&self.workdir))
            .await
        {
            Ok(process) => process,
            Err(e) => {
                Self::unmount_rootfs(&self.executor, &rootfs).await;
                return Err(e.into());
            }
        };

        let pid = process.pid;
        let executor = Arc::clone(&self.executor);
        let monitor = self.monitor.clone();
        let slot = Arc::clone(&self.process);
        let id = self.id.clone();
        Ok(exec::supervise(self.id.clone(), process, |_| {}, move |exit| async move {
            info!(id = %id, "Container exited: {}", exit);
            {
                let mut current = slot.lock();
                if current.as_ref().map(Supervised::pid) == Some(pid) {
                    *current = None;
                }
            }
            Self::unmount_rootfs(&executor, &rootfs).await;
            monitor.state(LifecycleState::Stopped);
        }))
    }
}

#[async_trait]
impl Driver for LxcDriver {
    fn name(&self) -> &str {
        "lxc"
    }

    async fn start(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        if self.process.lock().is_some() {
            return Ok(VerbOutcome::Completed);
        }
        let supervised = self.launch().await?;
        info!(id = %self.id, "Container started (pid {})", supervised.pid());
        *self.process.lock() = Some(supervised);
        Ok(VerbOutcome::Completed)
    }

    async fn stop(&self, opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        let Some(pid) = self.process.lock().as_ref().map(Supervised::pid) else {
            return Ok(VerbOutcome::Completed);
        };

        if opts.force {
            self.executor.kill(pid, nix::sys::signal::Signal::SIGKILL).await?;
        } else {
            let args = vec!["-n".to_string(), self.id.clone()];
            if let Err(e) = exec::run(self.executor.as_ref(), "lxc-stop", &args, &ExecOptions::default()).await {
                warn!(id = %self.id, "lxc-stop failed: {}", e);
            }
        }
        // Exit of lxc-start reports `stopped` once the rootfs is unmounted
        Ok(VerbOutcome::Pending)
    }

    fn dump(&self) -> Value {
        json!({
            "rootfs": self.rootfs(),
            "lowerdir": self.lowerdir,
            "pid": self.process.lock().as_ref().map(Supervised::pid),
        })
    }
}

pub struct LxcDriverFactory {
    executor: Executor,
}

impl LxcDriverFactory {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl DriverFactory for LxcDriverFactory {
    fn name(&self) -> &'static str {
        "lxc"
    }

    fn description(&self) -> &'static str {
        "Linux containers over an overlay of the image rootfs"
    }

    fn create(&self, ctx: DriverContext) -> PaddockResult<Arc<dyn Driver>> {
        Ok(Arc::new(LxcDriver::new(ctx, Arc::clone(&self.executor))?))
    }
}
