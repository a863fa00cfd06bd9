//! DHCP for a network through a foreground `dnsmasq`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use paddock_core::graph::Properties;
use paddock_core::objects::network::NetworkDevice;
use paddock_core::objects::service::NetworkService;
use paddock_core::registry::{NetworkServiceFactory, ServiceContext};
use paddock_core::subnet::Subnet;
use paddock_core::{PaddockError, PaddockResult};

use crate::exec::{self, ExecOptions, Executor, Supervised};
use crate::params::{bool_param, i64_param, object_param, str_list, truthy};

pub const PROGRAM: &str = "dnsmasq";

/// Time dnsmasq gets to exit after SIGTERM
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Command line arguments for serving `subnet` on `device`
pub fn dnsmasq_args(
    params: &Properties,
    subnet: &Subnet,
    device: &NetworkDevice,
) -> PaddockResult<Vec<String>> {
    let mut args = vec![
        if truthy(params, "debug") { "-d" } else { "--keep-in-foreground" }.to_string(),
        format!("--interface={}", device.name),
        "--except-interface=lo".to_string(),
        "--bind-interfaces".to_string(),
        "--strict-order".to_string(),
        "--conf-file=".to_string(),
        "--leasefile-ro".to_string(),
        "--dhcp-no-override".to_string(),
    ];
    if bool_param(params, "authoritative") != Some(false) {
        args.push("--dhcp-authoritative".to_string());
    }

    let statics = object_param(params, "static");
    if let (Some(start), Some(count)) = (i64_param(&statics, "start")?, i64_param(&statics, "count")?) {
        if start != 0 && count > 0 {
            for index in start..start + count {
                if let Some(address) = subnet.address_at(index) {
                    args.push(format!("--dhcp-host={},{}", address.mac, address.ip));
                }
            }
        }
    }

    let dynamic = object_param(params, "dynamic");
    let start = i64_param(&dynamic, "start")?.unwrap_or(0);
    let count = match i64_param(&dynamic, "count")? {
        Some(count) => count,
        None => subnet.address_count() as i64 - start,
    };
    if count > 0 {
        let first = subnet.address_at(start);
        let last = subnet.address_at(start + count - 1);
        match (first, last) {
            (Some(first), Some(last)) => args.push(format!("--dhcp-range={},{}", first.ip, last.ip)),
            _ => {
                return Err(PaddockError::bad_attr(
                    "dynamic",
                    format!("{}+{} outside {}", start, count, subnet),
                ))
            }
        }
    }

    args.extend(str_list(params, "arguments")?);
    Ok(args)
}

pub struct DnsmasqService {
    id: String,
    args: Vec<String>,
    workdir: PathBuf,
    executor: Executor,
    process: Mutex<Option<Supervised>>,
}

impl DnsmasqService {
    pub fn new(ctx: ServiceContext, executor: Executor) -> PaddockResult<Self> {
        let device = ctx.device.as_ref().ok_or_else(|| {
            PaddockError::validation("device", "dnsmasq needs a network with a host device")
        })?;
        Ok(Self {
            args: dnsmasq_args(&ctx.params, &ctx.subnet, device)?,
            id: ctx.service_id,
            workdir: ctx.workdir,
            executor,
            process: Mutex::new(None),
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl NetworkService for DnsmasqService {
    fn name(&self) -> &str {
        PROGRAM
    }

    async fn start(&self) -> PaddockResult<()> {
        let process = self
            .executor
            .spawn(PROGRAM, &self.args, &ExecOptions::in_dir(&self.workdir))
            .await?;
        let id = self.id.clone();
        let supervised = exec::supervise(self.id.clone(), process, |_| {}, move |exit| async move {
            info!(id = %id, "dnsmasq terminated: {}", exit);
        });
        info!(id = %self.id, "dnsmasq started (pid {})", supervised.pid());
        *self.process.lock() = Some(supervised);
        Ok(())
    }

    async fn stop(&self) -> PaddockResult<()> {
        let process = self.process.lock().take();
        if let Some(process) = process {
            let exit = process.terminate(self.executor.as_ref(), STOP_GRACE).await;
            if exit.signal.is_none() && !exit.success() {
                warn!(id = %self.id, "dnsmasq exited with {}", exit);
            }
        }
        Ok(())
    }

    fn dump(&self) -> Value {
        json!({
            "args": self.args,
            "pid": self.process.lock().as_ref().map(Supervised::pid),
        })
    }
}

pub struct DnsmasqServiceFactory {
    executor: Executor,
}

impl DnsmasqServiceFactory {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl NetworkServiceFactory for DnsmasqServiceFactory {
    fn role(&self) -> &'static str {
        "dhcp"
    }

    fn name(&self) -> &'static str {
        PROGRAM
    }

    fn description(&self) -> &'static str {
        "DHCP server for the network's host device"
    }

    fn create(&self, ctx: ServiceContext) -> PaddockResult<Arc<dyn NetworkService>> {
        Ok(Arc::new(DnsmasqService::new(ctx, Arc::clone(&self.executor))?))
    }
}
