pub mod import;
pub mod logging;
pub mod orchestrator;

pub use import::{Description, ImportStep, ImportSummary};
pub use orchestrator::{load_config, plugin_registry, Orchestrator};

// Re-export commonly used types
pub use paddock_core::{config::Config, Context, PaddockError, PaddockResult};
