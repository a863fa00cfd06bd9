//! Network provider backed by a local Linux bridge
//!
//! Parameters:
//! - `host-ip` (default `true`): give the bridge the subnet's host address
//! - `type`: `nat` enables both DHCP and NAT
//! - `dhcp`: enables DHCP; an object is passed to dnsmasq as its parameters
//!   and `{disabled: true}` turns it off again
//! - `mac-prefix`: override the allocator's MAC prefix

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use paddock_core::graph::Properties;
use paddock_core::objects::network::{allocate_options, NetworkDevice, NetworkProvider, SubnetLease};
use paddock_core::objects::service::NetworkService;
use paddock_core::registry::{NetworkProviderFactory, ProviderContext, ServiceContext};
use paddock_core::subnet::{Address, Subnet};
use paddock_core::{PaddockError, PaddockResult};

use crate::dnsmasq::DnsmasqService;
use crate::exec::{self, ExecOptions, Executor};
use crate::iptables::NatRules;
use crate::params::{bool_param, object_param, str_param, truthy};

/// Where the kernel lists virtual network devices
pub const SYSFS_VIRTUAL_NET: &str = "/sys/devices/virtual/net";

const SUFFIX_LEN: usize = 6;
const NAME_ATTEMPTS: usize = 32;

#[derive(Default)]
struct BridgeState {
    ifname: Option<String>,
    host: Option<Address>,
    dhcp: Option<Arc<DnsmasqService>>,
    nat: Option<Arc<NatRules>>,
}

pub struct BridgeProvider {
    network_id: String,
    params: Properties,
    prefix: String,
    cluster_workdir: PathBuf,
    sysfs: PathBuf,
    lease: SubnetLease,
    executor: Executor,
    state: Mutex<BridgeState>,
}

impl BridgeProvider {
    pub fn new(ctx: ProviderContext, executor: Executor) -> Self {
        Self {
            network_id: ctx.network_id,
            params: ctx.params,
            prefix: ctx.config.network.bridge_prefix.clone(),
            cluster_workdir: ctx.cluster_workdir,
            sysfs: PathBuf::from(SYSFS_VIRTUAL_NET),
            lease: SubnetLease::new(ctx.allocator),
            executor,
            state: Mutex::new(BridgeState::default()),
        }
    }

    /// Look for existing devices under `sysfs` instead of the real one
    pub fn with_sysfs(mut self, sysfs: impl Into<PathBuf>) -> Self {
        self.sysfs = sysfs.into();
        self
    }

    fn dhcp_params(&self) -> Option<Properties> {
        let enabled = str_param(&self.params, "type") == Some("nat") || truthy(&self.params, "dhcp");
        if !enabled {
            return None;
        }
        let params = object_param(&self.params, "dhcp");
        if truthy(&params, "disabled") {
            None
        } else {
            Some(params)
        }
    }

    fn service_context(&self, role: &str, params: Properties, subnet: Subnet) -> ServiceContext {
        ServiceContext {
            service_id: format!("{}.{}", self.network_id, role),
            params,
            subnet,
            device: self.device(),
            workdir: self.cluster_workdir.clone(),
        }
    }

    fn subnet_or_err(&self) -> PaddockResult<Subnet> {
        self.lease
            .get()
            .ok_or_else(|| PaddockError::driver("bridge", "no subnet leased"))
    }

    async fn unused_name(&self) -> PaddockResult<String> {
        for _ in 0..NAME_ATTEMPTS {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(SUFFIX_LEN)
                .map(|c| char::from(c).to_ascii_lowercase())
                .collect();
            let name = format!("{}{}", self.prefix, suffix);
            if !tokio::fs::try_exists(self.sysfs.join(&name)).await? {
                return Ok(name);
            }
            debug!(id = %self.network_id, "Device {} exists, picking another name", name);
        }
        Err(PaddockError::ResourceExhausted {
            resource: format!("{} device names", self.prefix),
        })
    }

    async fn setup_subnet(&self) -> PaddockResult<()> {
        let subnet = self.lease.acquire(&allocate_options(&self.params)?)?;
        info!(id = %self.network_id, "SUBNET: {}", subnet);
        Ok(())
    }

    async fn setup_bridge(&self) -> PaddockResult<()> {
        let subnet = self.subnet_or_err()?;
        let host = if bool_param(&self.params, "host-ip") != Some(false) {
            subnet.host()
        } else {
            None
        };
        let ifname = self.unused_name().await?;
        {
            let mut state = self.state.lock();
            state.ifname = Some(ifname.clone());
            state.host = host.clone();
        }

        let opts = ExecOptions::default();
        exec::run(self.executor.as_ref(), "brctl", &["addbr".to_string(), ifname.clone()], &opts).await?;

        let mut args = vec![ifname];
        if let Some(host) = host {
            args.extend([host.ip.to_string(), "netmask".to_string(), subnet.netmask().to_string()]);
        }
        args.push("up".to_string());
        exec::run(self.executor.as_ref(), "ifconfig", &args, &opts).await?;
        Ok(())
    }

    async fn setup_dhcp(&self) -> PaddockResult<()> {
        let Some(params) = self.dhcp_params() else {
            return Ok(());
        };
        let ctx = self.service_context("dhcp", params, self.subnet_or_err()?);
        let service = Arc::new(DnsmasqService::new(ctx, Arc::clone(&self.executor))?);
        service.start().await?;
        self.state.lock().dhcp = Some(service);
        Ok(())
    }

    async fn setup_nat(&self) -> PaddockResult<()> {
        if str_param(&self.params, "type") != Some("nat") {
            return Ok(());
        }
        let ctx = self.service_context("nat", self.params.clone(), self.subnet_or_err()?);
        let service = Arc::new(NatRules::new(ctx, Arc::clone(&self.executor))?);
        service.start().await?;
        self.state.lock().nat = Some(service);
        Ok(())
    }

    async fn destroy_bridge(&self) {
        let Some(ifname) = self.state.lock().ifname.take() else {
            return;
        };
        let opts = ExecOptions::default();
        let steps = [
            ("ifconfig", vec![ifname.clone(), "down".to_string()]),
            ("brctl", vec!["delbr".to_string(), ifname.clone()]),
        ];
        for (program, args) in steps {
            if let Err(e) = exec::run(self.executor.as_ref(), program, &args, &opts).await {
                warn!(id = %self.network_id, "Bridge teardown step failed: {}", e);
            }
        }
        self.state.lock().host = None;
    }
}

#[async_trait]
impl NetworkProvider for BridgeProvider {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn setup(&self) -> PaddockResult<()> {
        let result = async {
            self.setup_subnet().await?;
            self.setup_bridge().await?;
            self.setup_dhcp().await?;
            self.setup_nat().await
        }
        .await;

        if let Err(e) = &result {
            warn!(id = %self.network_id, "Bridge setup failed: {}", e);
            self.destroy().await?;
        }
        result
    }

    /// Tear down in reverse order; individual failures are logged and the
    /// remaining steps still run
    async fn destroy(&self) -> PaddockResult<()> {
        let nat = self.state.lock().nat.take();
        if let Some(nat) = nat {
            if let Err(e) = nat.stop().await {
                warn!(id = %self.network_id, "Stopping nat failed: {}", e);
            }
        }
        let dhcp = self.state.lock().dhcp.take();
        if let Some(dhcp) = dhcp {
            if let Err(e) = dhcp.stop().await {
                warn!(id = %self.network_id, "Stopping dhcp failed: {}", e);
            }
        }
        self.destroy_bridge().await;
        self.lease.release();
        Ok(())
    }

    fn subnet(&self) -> Option<Subnet> {
        self.lease.get()
    }

    fn device(&self) -> Option<NetworkDevice> {
        let state = self.state.lock();
        state.ifname.as_ref().map(|name| NetworkDevice {
            kind: "bridge".to_string(),
            name: name.clone(),
            address: state.host.clone(),
        })
    }

    fn dump(&self) -> Value {
        let mut services = Map::new();
        {
            let state = self.state.lock();
            if let Some(dhcp) = &state.dhcp {
                services.insert("dhcp".to_string(), dhcp.dump());
            }
            if let Some(nat) = &state.nat {
                services.insert("nat".to_string(), nat.dump());
            }
        }
        json!({
            "device": self.device(),
            "services": services,
        })
    }
}

pub struct BridgeProviderFactory {
    executor: Executor,
}

impl BridgeProviderFactory {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl NetworkProviderFactory for BridgeProviderFactory {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn description(&self) -> &'static str {
        "Local bridge with optional DHCP and NAT"
    }

    fn create(&self, ctx: ProviderContext) -> PaddockResult<Arc<dyn NetworkProvider>> {
        Ok(Arc::new(BridgeProvider::new(ctx, Arc::clone(&self.executor))))
    }
}
