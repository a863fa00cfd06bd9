use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::str_prop;
use crate::error::PaddockResult;
use crate::graph::{CreateRequest, ManagedObject, ObjectFactory, ObjectType, Properties};

/// Top-level grouping of networks and nodes, owning a working directory
#[derive(Debug)]
pub struct Cluster {
    id: String,
    properties: Properties,
    workdir: PathBuf,
}

impl Cluster {
    pub fn name(&self) -> Option<&str> {
        str_prop(&self.properties, "name")
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

#[async_trait]
impl ManagedObject for Cluster {
    fn object_type(&self) -> ObjectType {
        ObjectType::Cluster
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn dump(&self) -> Value {
        json!({
            "name": self.name(),
            "workdir": self.workdir,
        })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct ClusterFactory;

#[async_trait]
impl ObjectFactory for ClusterFactory {
    async fn create(&self, req: CreateRequest<'_>) -> PaddockResult<Arc<dyn ManagedObject>> {
        let workdir = req.context.config().server.workdir.join(&req.id);
        tokio::fs::create_dir_all(&workdir).await?;

        Ok(Arc::new(Cluster {
            id: req.id,
            properties: req.properties,
            workdir,
        }))
    }
}
