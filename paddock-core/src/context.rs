//! Process-wide composition root
//!
//! A [`Context`] owns the configuration, the subnet allocator, the plugin
//! registry and the object graph. Everything an object needs at setup time
//! is reached through it; there is no global state.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{PaddockError, PaddockResult};
use crate::graph::{
    downcast, ManagedObject, ModelDefinition, ObjectGraph, ObjectKey, ObjectType, Properties,
    RefIds,
};
use crate::objects::{self, Image};
use crate::registry::PluginRegistry;
use crate::subnet::SubnetAllocator;

pub struct Context {
    config: Arc<Config>,
    allocator: Arc<SubnetAllocator>,
    plugins: Arc<PluginRegistry>,
    objects: ObjectGraph,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("allocator", &self.allocator)
            .field("plugins", &self.plugins)
            .field("objects", &self.objects)
            .finish()
    }
}

impl Context {
    /// Context with the standard object models and an allocator built from
    /// the network configuration
    pub fn new(config: Config, plugins: PluginRegistry) -> PaddockResult<Self> {
        let allocator = SubnetAllocator::from_config(&config.network)?;
        Self::with_parts(config, plugins, allocator, objects::standard_models())
    }

    /// Context with an explicit allocator and model table
    pub fn with_parts(
        config: Config,
        plugins: PluginRegistry,
        allocator: SubnetAllocator,
        models: Vec<ModelDefinition>,
    ) -> PaddockResult<Self> {
        let mut objects = ObjectGraph::new();
        objects.define(models)?;

        info!(
            "Context ready: workdir={} pools={:?}",
            config.server.workdir.display(),
            config.network.subnets
        );

        Ok(Self {
            config: Arc::new(config),
            allocator: Arc::new(allocator),
            plugins: Arc::new(plugins),
            objects,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<SubnetAllocator> {
        &self.allocator
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn objects(&self) -> &ObjectGraph {
        &self.objects
    }

    pub async fn create_object(
        &self,
        object_type: ObjectType,
        id: impl Into<String>,
        refs: RefIds,
        properties: Properties,
    ) -> PaddockResult<Arc<dyn ManagedObject>> {
        self.objects
            .create(self, ObjectKey::new(object_type, id), refs, properties)
            .await
    }

    /// Typed variant of [`Context::create_object`]
    pub async fn create_as<T: ManagedObject>(
        &self,
        object_type: ObjectType,
        id: impl Into<String>,
        refs: RefIds,
        properties: Properties,
    ) -> PaddockResult<Arc<T>> {
        downcast(self.create_object(object_type, id, refs, properties).await?)
    }

    /// The image rooted at `dir`, loading it on first use
    pub async fn load_image(&self, dir: &str) -> PaddockResult<Arc<Image>> {
        let key = ObjectKey::new(ObjectType::Image, dir);
        loop {
            if let Some(image) = self.objects.find_as::<Image>(ObjectType::Image, dir) {
                return Ok(image);
            }

            let mut props = Properties::new();
            props.insert("dir".to_string(), Value::String(dir.to_string()));
            match self.create_as::<Image>(ObjectType::Image, dir, RefIds::new(), props).await {
                Ok(image) => return Ok(image),
                Err(PaddockError::AlreadyExists { .. }) => {
                    // Another node is loading the same image
                    self.objects.wait_settled(&key).await;
                    if self.objects.find(ObjectType::Image, dir).is_none() {
                        debug!("Concurrent load of image {} failed, retrying", dir);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn get(&self, object_type: ObjectType, id: &str) -> PaddockResult<Arc<dyn ManagedObject>> {
        self.objects.get(object_type, id)
    }

    pub fn list(&self, object_type: ObjectType) -> Vec<String> {
        self.objects.list(object_type)
    }

    pub async fn update(
        &self,
        object_type: ObjectType,
        id: &str,
        properties: &Properties,
    ) -> PaddockResult<()> {
        self.objects.update(object_type, id, properties).await
    }

    pub async fn delete(&self, object_type: ObjectType, id: &str, recursive: bool) -> PaddockResult<()> {
        self.objects
            .destroy(&ObjectKey::new(object_type, id), recursive)
            .await
    }

    pub async fn destroy_all(&self) -> PaddockResult<()> {
        self.objects.destroy_all().await
    }
}
