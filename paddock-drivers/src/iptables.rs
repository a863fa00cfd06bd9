//! NAT for a network through an iptables MASQUERADE rule

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use paddock_core::objects::service::NetworkService;
use paddock_core::registry::{NetworkServiceFactory, ServiceContext};
use paddock_core::subnet::Subnet;
use paddock_core::{PaddockError, PaddockResult};

use crate::exec::{self, ExecOptions, Executor};

pub const PROGRAM: &str = "iptables";

/// `POSTROUTING` rule masquerading traffic that leaves `subnet`
pub fn masquerade_rule(subnet: &Subnet) -> Vec<String> {
    let net = format!("{}/{}", subnet.base(), subnet.bitmask());
    vec![
        "POSTROUTING".to_string(),
        "-s".to_string(),
        net.clone(),
        "!".to_string(),
        "-d".to_string(),
        net,
        "-j".to_string(),
        "MASQUERADE".to_string(),
    ]
}

pub struct NatRules {
    rule: Vec<String>,
    executor: Executor,
}

impl NatRules {
    pub fn new(ctx: ServiceContext, executor: Executor) -> PaddockResult<Self> {
        if ctx.device.is_none() {
            return Err(PaddockError::validation(
                "device",
                "nat needs a network with a host device",
            ));
        }
        Ok(Self {
            rule: masquerade_rule(&ctx.subnet),
            executor,
        })
    }

    async fn apply(&self, action: &str) -> PaddockResult<()> {
        let mut args = vec!["-t".to_string(), "nat".to_string(), action.to_string()];
        args.extend(self.rule.iter().cloned());
        exec::run(self.executor.as_ref(), PROGRAM, &args, &ExecOptions::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkService for NatRules {
    fn name(&self) -> &str {
        PROGRAM
    }

    async fn start(&self) -> PaddockResult<()> {
        self.apply("-A").await
    }

    async fn stop(&self) -> PaddockResult<()> {
        self.apply("-D").await
    }

    fn dump(&self) -> Value {
        json!({ "rule": self.rule.join(" ") })
    }
}

pub struct NatServiceFactory {
    executor: Executor,
}

impl NatServiceFactory {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

impl NetworkServiceFactory for NatServiceFactory {
    fn role(&self) -> &'static str {
        "nat"
    }

    fn name(&self) -> &'static str {
        PROGRAM
    }

    fn description(&self) -> &'static str {
        "Masquerades traffic leaving the network's subnet"
    }

    fn create(&self, ctx: ServiceContext) -> PaddockResult<Arc<dyn NetworkService>> {
        Ok(Arc::new(NatRules::new(ctx, Arc::clone(&self.executor))?))
    }
}
