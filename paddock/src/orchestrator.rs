use std::path::Path;

use tracing::{error, info, warn};

use paddock_core::config::Config;
use paddock_core::registry::PluginRegistry;
use paddock_core::{Context, PaddockResult};

use crate::import::{self, Description, ImportSummary};

/// Registry with the built-in plugins plus everything paddock-drivers ships
pub fn plugin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::default();
    paddock_drivers::register_system(&mut registry);
    registry
}

/// Configuration from `path` when given, defaults otherwise. Environment
/// overrides apply either way and the result is validated.
pub fn load_config(path: Option<&Path>) -> PaddockResult<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Owns the process context: imports descriptions into it and tears
/// everything down on shutdown
///
/// ```text
///   description file ──import──▶ Context ──▶ ObjectGraph
///                                   │
///                                   ├── SubnetAllocator
///                                   └── PluginRegistry (core + drivers)
/// ```
pub struct Orchestrator {
    context: Context,
}

impl Orchestrator {
    /// Create an orchestrator with every plugin registered
    pub fn new(config: Config) -> PaddockResult<Self> {
        let registry = plugin_registry();
        info!("Creating paddock orchestrator with {} plugin(s)", registry.info().len());
        Ok(Self::from_context(Context::new(config, registry)?))
    }

    pub fn from_context(context: Context) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub async fn import_file(&self, path: &Path, start: bool) -> PaddockResult<ImportSummary> {
        info!("Importing {}", path.display());
        let description = Description::from_file(path)?;
        self.import(&description, start).await
    }

    pub async fn import(&self, description: &Description, start: bool) -> PaddockResult<ImportSummary> {
        let summary = import::import(&self.context, description, start).await?;
        info!(
            "Imported {} cluster(s), {} network(s), {} node(s)",
            summary.clusters.len(),
            summary.networks.len(),
            summary.nodes.len()
        );
        Ok(summary)
    }

    /// Destroy every object, dependents first
    pub async fn shutdown(&self) -> PaddockResult<()> {
        info!("Shutting down paddock orchestrator");
        match self.context.destroy_all().await {
            Ok(()) => {
                info!("All objects destroyed");
                Ok(())
            }
            Err(e) => {
                error!("Teardown finished with errors: {}", e);
                Err(e)
            }
        }
    }

    /// Block until Ctrl-C, then shut down
    pub async fn run_until_signal(&self) -> PaddockResult<()> {
        info!("Running; press Ctrl-C to tear down");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
        self.shutdown().await
    }
}
