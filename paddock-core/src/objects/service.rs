use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::error;

use super::{str_prop, Network};
use crate::error::{PaddockError, PaddockResult};
use crate::graph::{CreateRequest, ManagedObject, ObjectFactory, ObjectType, Properties};
use crate::registry::ServiceContext;

/// A service attached to a network, e.g. DHCP or NAT
#[async_trait]
pub trait NetworkService: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> PaddockResult<()>;

    async fn stop(&self) -> PaddockResult<()>;

    fn dump(&self) -> Value {
        Value::Null
    }
}

pub struct Service {
    id: String,
    properties: Properties,
    network: Arc<Network>,
    service: Arc<dyn NetworkService>,
}

impl Service {
    pub fn role(&self) -> Option<&str> {
        str_prop(&self.properties, "role")
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }
}

#[async_trait]
impl ManagedObject for Service {
    fn object_type(&self) -> ObjectType {
        ObjectType::Service
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn dump(&self) -> Value {
        let mut out = json!({
            "role": self.role(),
            "name": str_prop(&self.properties, "name"),
        });
        if let (Some(map), Value::Object(extra)) = (out.as_object_mut(), self.service.dump()) {
            map.extend(extra);
        }
        out
    }

    async fn destruct(&self) -> PaddockResult<()> {
        if let Err(e) = self.service.stop().await {
            error!(id = %self.id, "Service stop error: {}", e);
        }
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct ServiceFactory;

#[async_trait]
impl ObjectFactory for ServiceFactory {
    async fn create(&self, req: CreateRequest<'_>) -> PaddockResult<Arc<dyn ManagedObject>> {
        let role = str_prop(&req.properties, "role").ok_or_else(|| PaddockError::no_attr("role"))?;
        let network: Arc<Network> = req.refs.first_as(ObjectType::Network)?;
        let subnet = network.subnet().ok_or_else(|| {
            PaddockError::validation("network", format!("{} has no subnet", network.id()))
        })?;

        let service = req.context.plugins().create_service(
            role,
            str_prop(&req.properties, "name"),
            ServiceContext {
                service_id: req.id.clone(),
                params: req.properties.clone(),
                subnet,
                device: network.device(),
                workdir: network.cluster().workdir().to_path_buf(),
            },
        )?;
        service.start().await?;

        Ok(Arc::new(Service {
            id: req.id,
            properties: req.properties,
            network,
            service,
        }))
    }
}
