pub mod bridge;
pub mod dnsmasq;
pub mod exec;
pub mod formats;
pub mod iptables;
pub mod lxc;
pub mod params;
pub mod qemu;
pub mod shell;

use std::sync::Arc;

use paddock_core::registry::PluginRegistry;

pub use bridge::{BridgeProvider, BridgeProviderFactory};
pub use dnsmasq::{DnsmasqService, DnsmasqServiceFactory};
pub use exec::{CommandExecutor, Executor, SystemCommandExecutor};
pub use formats::{DirFormatFactory, SquashfsFormatFactory};
pub use iptables::{NatRules, NatServiceFactory};
pub use lxc::{LxcDriver, LxcDriverFactory};
pub use qemu::{QemuDriver, QemuDriverFactory};
pub use shell::{ContractShellDriver, ShellDriverFactory, SimpleShellDriver};

/// Image formats a plain directory can stand in for
pub const DIR_FORMATS: &[&str] = &["rootfs", "qemu", "vmdk"];

/// Register every driver, provider, service and format in this crate,
/// all running their commands through `executor`
pub fn register_all(registry: &mut PluginRegistry, executor: Executor) {
    registry.register_driver(Arc::new(ShellDriverFactory::new(Arc::clone(&executor))));
    registry.register_driver(Arc::new(LxcDriverFactory::new(Arc::clone(&executor))));
    registry.register_driver(Arc::new(QemuDriverFactory::new(Arc::clone(&executor))));

    registry.register_provider(Arc::new(BridgeProviderFactory::new(Arc::clone(&executor))));

    registry.register_service(Arc::new(DnsmasqServiceFactory::new(Arc::clone(&executor))));
    registry.register_service(Arc::new(NatServiceFactory::new(Arc::clone(&executor))));

    for format in DIR_FORMATS {
        registry.register_format(Arc::new(DirFormatFactory::new(format)));
    }
    registry.register_format(Arc::new(SquashfsFormatFactory::new(executor)));
}

/// [`register_all`] with commands run on this host
pub fn register_system(registry: &mut PluginRegistry) {
    register_all(registry, Arc::new(SystemCommandExecutor));
}
