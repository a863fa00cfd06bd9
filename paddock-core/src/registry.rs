//! Plugin registry
//!
//! Concrete drivers, network providers, network services and image formats
//! are registered by name at startup and looked up when an object is set up.
//! `paddock-core` only ships the `mock` node driver and the `static` network
//! provider; everything else is registered by the binary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::driver::{Driver, MockDriver, Monitor};
use crate::error::{PaddockError, PaddockResult};
use crate::graph::{ManagedObject, Properties};
use crate::objects::image::{Image, ImageFormat};
use crate::objects::network::{
    Network, NetworkDevice, NetworkProvider, StaticProvider,
};
use crate::objects::service::NetworkService;
use crate::subnet::{Subnet, SubnetAllocator};

pub const NODE_DRIVER: &str = "node.driver";
pub const NETWORK_PROVIDER: &str = "network.provider";
pub const NETWORK_SERVICE: &str = "network.service";
pub const IMAGE_FORMAT: &str = "image.format";

/// Everything a node driver gets at construction
pub struct DriverContext {
    pub node_id: String,
    pub workdir: PathBuf,
    /// Image manifest `node` section overlaid with the node's properties
    pub params: Properties,
    pub image: Option<Arc<Image>>,
    pub networks: Vec<Arc<Network>>,
    pub monitor: Monitor,
    pub config: Arc<Config>,
}

impl DriverContext {
    pub fn network(&self, id: &str) -> Option<&Arc<Network>> {
        self.networks.iter().find(|n| n.id() == id)
    }
}

/// Everything a network provider gets at construction
pub struct ProviderContext {
    pub network_id: String,
    pub cluster_workdir: PathBuf,
    pub params: Properties,
    pub allocator: Arc<SubnetAllocator>,
    pub config: Arc<Config>,
}

/// Everything a network service gets at construction
pub struct ServiceContext {
    pub service_id: String,
    pub params: Properties,
    pub subnet: Subnet,
    pub device: Option<NetworkDevice>,
    pub workdir: PathBuf,
}

/// Everything an image format gets at construction
pub struct FormatContext {
    pub image_id: String,
    /// The manifest entry declaring the format
    pub params: Properties,
}

pub trait DriverFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn create(&self, ctx: DriverContext) -> PaddockResult<Arc<dyn Driver>>;
}

pub trait NetworkProviderFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn create(&self, ctx: ProviderContext) -> PaddockResult<Arc<dyn NetworkProvider>>;
}

pub trait NetworkServiceFactory: Send + Sync {
    /// Role the service fills, e.g. `dhcp` or `nat`
    fn role(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn create(&self, ctx: ServiceContext) -> PaddockResult<Arc<dyn NetworkService>>;
}

pub trait ImageFormatFactory: Send + Sync {
    /// Format name as declared in image manifests, e.g. `rootfs`
    fn format(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn create(&self, ctx: FormatContext) -> PaddockResult<Arc<dyn ImageFormat>>;
}

/// Description of one registered plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub extension: String,
    pub name: String,
    pub description: String,
}

/// Factories of one kind keyed by (extension point, name)
struct PluginTable<F: ?Sized> {
    factories: BTreeMap<(String, String), Arc<F>>,
}

impl<F: ?Sized> Default for PluginTable<F> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<F: ?Sized> PluginTable<F> {
    fn insert(&mut self, extension: String, name: &str, description: &str, factory: Arc<F>) {
        tracing::info!("Registering {} plugin: {} ({})", extension, name, description);
        self.factories.insert((extension, name.to_string()), factory);
    }

    fn names(&self, extension: &str) -> Vec<String> {
        self.factories
            .keys()
            .filter(|(ext, _)| ext == extension)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Exact lookup, or the first plugin of the extension when no name is given
    fn get(&self, extension: &str, name: Option<&str>) -> PaddockResult<&Arc<F>> {
        let found = match name {
            Some(name) => self
                .factories
                .get(&(extension.to_string(), name.to_string())),
            None => self
                .factories
                .iter()
                .find(|((ext, _), _)| ext == extension)
                .map(|(_, f)| f),
        };
        found.ok_or_else(|| PaddockError::DriverNotFound {
            extension: extension.to_string(),
            name: name.unwrap_or("<any>").to_string(),
            available: self.names(extension),
        })
    }
}

/// Registry of every plugin the process knows about
pub struct PluginRegistry {
    drivers: PluginTable<dyn DriverFactory>,
    providers: PluginTable<dyn NetworkProviderFactory>,
    services: PluginTable<dyn NetworkServiceFactory>,
    formats: PluginTable<dyn ImageFormatFactory>,
    descriptions: BTreeMap<(String, String), String>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.descriptions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            drivers: PluginTable::default(),
            providers: PluginTable::default(),
            services: PluginTable::default(),
            formats: PluginTable::default(),
            descriptions: BTreeMap::new(),
        }
    }

    fn describe(&mut self, extension: &str, name: &str, description: &str) {
        self.descriptions.insert(
            (extension.to_string(), name.to_string()),
            description.to_string(),
        );
    }

    pub fn register_driver(&mut self, factory: Arc<dyn DriverFactory>) {
        let (name, description) = (factory.name(), factory.description());
        self.describe(NODE_DRIVER, name, description);
        self.drivers
            .insert(NODE_DRIVER.to_string(), name, description, factory);
    }

    pub fn register_provider(&mut self, factory: Arc<dyn NetworkProviderFactory>) {
        let (name, description) = (factory.name(), factory.description());
        self.describe(NETWORK_PROVIDER, name, description);
        self.providers
            .insert(NETWORK_PROVIDER.to_string(), name, description, factory);
    }

    pub fn register_service(&mut self, factory: Arc<dyn NetworkServiceFactory>) {
        let extension = format!("{}.{}", NETWORK_SERVICE, factory.role());
        let (name, description) = (factory.name(), factory.description());
        self.describe(&extension, name, description);
        self.services.insert(extension, name, description, factory);
    }

    pub fn register_format(&mut self, factory: Arc<dyn ImageFormatFactory>) {
        let extension = format!("{}.{}", IMAGE_FORMAT, factory.format());
        let (name, description) = (factory.name(), factory.description());
        self.describe(&extension, name, description);
        self.formats.insert(extension, name, description, factory);
    }

    pub fn create_driver(&self, name: &str, ctx: DriverContext) -> PaddockResult<Arc<dyn Driver>> {
        self.drivers.get(NODE_DRIVER, Some(name))?.create(ctx)
    }

    pub fn create_provider(
        &self,
        name: &str,
        ctx: ProviderContext,
    ) -> PaddockResult<Arc<dyn NetworkProvider>> {
        self.providers.get(NETWORK_PROVIDER, Some(name))?.create(ctx)
    }

    /// Service for `role`; without a name the first registered one is used
    pub fn create_service(
        &self,
        role: &str,
        name: Option<&str>,
        ctx: ServiceContext,
    ) -> PaddockResult<Arc<dyn NetworkService>> {
        let extension = format!("{}.{}", NETWORK_SERVICE, role);
        self.services.get(&extension, name)?.create(ctx)
    }

    pub fn create_format(
        &self,
        format: &str,
        name: &str,
        ctx: FormatContext,
    ) -> PaddockResult<Arc<dyn ImageFormat>> {
        let extension = format!("{}.{}", IMAGE_FORMAT, format);
        self.formats.get(&extension, Some(name))?.create(ctx)
    }

    /// Names registered under one extension point
    pub fn list(&self, extension: &str) -> Vec<String> {
        self.descriptions
            .keys()
            .filter(|(ext, _)| ext == extension)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Every registered plugin, ordered by extension point then name
    pub fn info(&self) -> Vec<PluginInfo> {
        self.descriptions
            .iter()
            .map(|((extension, name), description)| PluginInfo {
                extension: extension.clone(),
                name: name.clone(),
                description: description.clone(),
            })
            .collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = Self::new();

        registry.register_driver(Arc::new(MockDriverFactory));
        registry.register_provider(Arc::new(StaticProviderFactory));

        // NOTE: shell/lxc/qemu drivers, the bridge provider, network services
        // and image formats live in paddock-drivers and are registered by the
        // main binary

        registry
    }
}

/// Factory for the mock node driver (built-in for testing)
pub struct MockDriverFactory;

impl DriverFactory for MockDriverFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn description(&self) -> &'static str {
        "Mock node driver for testing (every verb completes immediately)"
    }

    fn create(&self, _ctx: DriverContext) -> PaddockResult<Arc<dyn Driver>> {
        Ok(Arc::new(MockDriver::new()))
    }
}

/// Factory for the static network provider
pub struct StaticProviderFactory;

impl NetworkProviderFactory for StaticProviderFactory {
    fn name(&self) -> &'static str {
        "static"
    }

    fn description(&self) -> &'static str {
        "Allocates a subnet without configuring any host device"
    }

    fn create(&self, ctx: ProviderContext) -> PaddockResult<Arc<dyn NetworkProvider>> {
        Ok(Arc::new(StaticProvider::new(ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = PluginRegistry::default();
        assert_eq!(registry.list(NODE_DRIVER), vec!["mock"]);
        assert_eq!(registry.list(NETWORK_PROVIDER), vec!["static"]);
        assert_eq!(registry.info().len(), 2);
    }

    #[test]
    fn test_unknown_provider_lists_available() {
        let registry = PluginRegistry::default();
        let allocator = Arc::new(SubnetAllocator::new(Vec::new(), 9, Default::default()));
        let ctx = ProviderContext {
            network_id: "n".to_string(),
            cluster_workdir: PathBuf::from("/tmp"),
            params: Properties::new(),
            allocator,
            config: Arc::new(Config::default()),
        };
        match registry.create_provider("bridge", ctx) {
            Err(PaddockError::DriverNotFound {
                extension,
                name,
                available,
            }) => {
                assert_eq!(extension, NETWORK_PROVIDER);
                assert_eq!(name, "bridge");
                assert_eq!(available, vec!["static"]);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bridge should not be registered"),
        }
    }
}
