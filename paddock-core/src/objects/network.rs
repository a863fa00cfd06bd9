use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{str_prop, Cluster};
use crate::error::{PaddockError, PaddockResult};
use crate::graph::{CreateRequest, ManagedObject, ObjectFactory, ObjectType, Properties};
use crate::registry::ProviderContext;
use crate::subnet::{Address, AllocateOptions, Subnet, SubnetAllocator};

/// Host-side device a network is attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub address: Option<Address>,
}

/// Sets up the host side of a network: subnet, devices, services
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the network up. A failed setup leaves nothing behind.
    async fn setup(&self) -> PaddockResult<()>;

    /// Tear the network down, releasing the subnet exactly once
    async fn destroy(&self) -> PaddockResult<()>;

    fn subnet(&self) -> Option<Subnet>;

    fn device(&self) -> Option<NetworkDevice> {
        None
    }

    fn dump(&self) -> Value {
        Value::Null
    }
}

/// Parse allocation overrides from provider params
pub fn allocate_options(params: &Properties) -> PaddockResult<AllocateOptions> {
    let mac_prefix = match str_prop(params, "mac-prefix") {
        Some(prefix) => Some(
            prefix
                .parse()
                .map_err(|_| PaddockError::bad_attr("mac-prefix", prefix))?,
        ),
        None => None,
    };
    Ok(AllocateOptions { mac_prefix })
}

/// Subnet lease that is returned to the allocator at most once
pub struct SubnetLease {
    allocator: Arc<SubnetAllocator>,
    subnet: Mutex<Option<Subnet>>,
}

impl SubnetLease {
    pub fn new(allocator: Arc<SubnetAllocator>) -> Self {
        Self {
            allocator,
            subnet: Mutex::new(None),
        }
    }

    pub fn acquire(&self, opts: &AllocateOptions) -> PaddockResult<Subnet> {
        let subnet = self
            .allocator
            .allocate(opts)?
            .ok_or_else(|| PaddockError::ResourceExhausted {
                resource: "subnet".to_string(),
            })?;
        *self.subnet.lock() = Some(subnet.clone());
        Ok(subnet)
    }

    pub fn get(&self) -> Option<Subnet> {
        self.subnet.lock().clone()
    }

    pub fn release(&self) {
        if let Some(subnet) = self.subnet.lock().take() {
            self.allocator.release(&subnet);
        }
    }
}

/// Provider that only leases a subnet; nodes attach to it without a host device
pub struct StaticProvider {
    network_id: String,
    params: Properties,
    lease: SubnetLease,
}

impl StaticProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        Self {
            network_id: ctx.network_id,
            params: ctx.params,
            lease: SubnetLease::new(ctx.allocator),
        }
    }
}

#[async_trait]
impl NetworkProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn setup(&self) -> PaddockResult<()> {
        let subnet = self.lease.acquire(&allocate_options(&self.params)?)?;
        info!(id = %self.network_id, "SUBNET: {}", subnet);
        Ok(())
    }

    async fn destroy(&self) -> PaddockResult<()> {
        self.lease.release();
        Ok(())
    }

    fn subnet(&self) -> Option<Subnet> {
        self.lease.get()
    }
}

/// A network inside a cluster, backed by a provider
pub struct Network {
    id: String,
    properties: Properties,
    cluster: Arc<Cluster>,
    provider_name: String,
    provider: Arc<dyn NetworkProvider>,
}

impl Network {
    pub fn name(&self) -> Option<&str> {
        str_prop(&self.properties, "name")
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn provider(&self) -> &Arc<dyn NetworkProvider> {
        &self.provider
    }

    pub fn subnet(&self) -> Option<Subnet> {
        self.provider.subnet()
    }

    pub fn device(&self) -> Option<NetworkDevice> {
        self.provider.device()
    }

    pub fn address_at(&self, index: i64) -> Option<Address> {
        self.subnet()?.address_at(index)
    }

    pub fn address_count(&self) -> u64 {
        self.subnet().map(|s| s.address_count()).unwrap_or(0)
    }
}

#[async_trait]
impl ManagedObject for Network {
    fn object_type(&self) -> ObjectType {
        ObjectType::Network
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn dump(&self) -> Value {
        let mut provider = json!({ "name": self.provider_name });
        if let (Some(out), Value::Object(extra)) = (provider.as_object_mut(), self.provider.dump()) {
            out.extend(extra);
        }
        json!({
            "subnet": self.subnet().map(|s| s.dump()),
            "provider": provider,
        })
    }

    async fn destruct(&self) -> PaddockResult<()> {
        self.provider.destroy().await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct NetworkFactory;

#[async_trait]
impl ObjectFactory for NetworkFactory {
    async fn create(&self, req: CreateRequest<'_>) -> PaddockResult<Arc<dyn ManagedObject>> {
        let cluster: Arc<Cluster> = req.refs.first_as(ObjectType::Cluster)?;
        let provider_name = str_prop(&req.properties, "provider")
            .ok_or_else(|| PaddockError::no_attr("provider"))?
            .to_string();

        let provider = req.context.plugins().create_provider(
            &provider_name,
            ProviderContext {
                network_id: req.id.clone(),
                cluster_workdir: cluster.workdir().to_path_buf(),
                params: req.properties.clone(),
                allocator: Arc::clone(req.context.allocator()),
                config: Arc::clone(req.context.config()),
            },
        )?;
        provider.setup().await?;

        Ok(Arc::new(Network {
            id: req.id,
            properties: req.properties,
            cluster,
            provider_name,
            provider,
        }))
    }
}
