use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use paddock::{load_config, plugin_registry, Description, Orchestrator};
use paddock_core::config::ConfigBuilder;
use paddock_core::graph::{ManagedObject, ObjectType};
use paddock_core::lifecycle::LifecycleState;
use paddock_core::objects::{self, Network, Node};
use paddock_core::registry::PluginRegistry;
use paddock_core::subnet::{MacPrefix, StaticInterfaces, SubnetAllocator};
use paddock_core::{Context, PaddockError};

const LAB: &str = r#"
clusters:
  - id: lab
    networks:
      - id: front
        provider: static
      - id: back
        provider: static
    nodes:
      - id: web
        driver: mock
        nics: [front, { network: back, address-index: 2 }]
      - id: db
        driver: mock
        nics: [back]
"#;

/// Orchestrator over the core plugins only, with no host interfaces in the way
fn test_orchestrator(workdir: &std::path::Path) -> Orchestrator {
    let config = ConfigBuilder::new()
        .workdir(workdir)
        .subnets(["10.0.0.0/8,24"])
        .verb_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let allocator = SubnetAllocator::with_interfaces(
        config.network.pool_specs().unwrap(),
        config.network.reserved_ips,
        MacPrefix::default(),
        Arc::new(StaticInterfaces(Vec::new())),
    );
    let context = Context::with_parts(
        config,
        PluginRegistry::default(),
        allocator,
        objects::standard_models(),
    )
    .unwrap();
    Orchestrator::from_context(context)
}

async fn wait_running(node: &Node) {
    for _ in 0..500 {
        if node.state() == LifecycleState::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {} never reached running: {:?}", node.id(), node.snapshot());
}

#[tokio::test]
async fn test_import_creates_and_starts_everything() {
    let dir = TempDir::new().unwrap();
    let orchestrator = test_orchestrator(dir.path());
    let ctx = orchestrator.context();

    let summary = orchestrator
        .import(&Description::from_yaml(LAB).unwrap(), true)
        .await
        .unwrap();
    assert_eq!(summary.clusters, vec!["lab"]);
    assert_eq!(summary.networks, vec!["lab.front", "lab.back"]);
    assert_eq!(summary.nodes, vec!["lab.web", "lab.db"]);
    assert_eq!(summary.started, summary.nodes);

    assert_eq!(ctx.allocator().leased().len(), 2);
    let web = ctx.objects().find_as::<Node>(ObjectType::Node, "lab.web").unwrap();
    let ids: Vec<&str> = web.networks().iter().map(|n| n.id()).collect();
    assert_eq!(ids, vec!["lab.front", "lab.back"]);
    assert_eq!(web.expected_state(), LifecycleState::Running);
    wait_running(&web).await;

    let db = ctx.objects().find_as::<Node>(ObjectType::Node, "lab.db").unwrap();
    wait_running(&db).await;

    // Networks in use by nodes cannot go first
    let result = ctx.delete(ObjectType::Network, "lab.back", false).await;
    assert!(matches!(result, Err(PaddockError::InUse { .. })));

    orchestrator.shutdown().await.unwrap();
    assert!(ctx.objects().is_empty());
    assert!(ctx.allocator().leased().is_empty());
}

#[tokio::test]
async fn test_import_without_start_leaves_nodes_offline() {
    let dir = TempDir::new().unwrap();
    let orchestrator = test_orchestrator(dir.path());

    let summary = orchestrator
        .import(&Description::from_yaml(LAB).unwrap(), false)
        .await
        .unwrap();
    assert!(summary.started.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    for id in ["lab.web", "lab.db"] {
        let node = orchestrator
            .context()
            .objects()
            .find_as::<Node>(ObjectType::Node, id)
            .unwrap();
        assert_eq!(node.state(), LifecycleState::Offline);
        assert_eq!(node.expected_state(), LifecycleState::Offline);
    }
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_import_stops_and_keeps_earlier_objects() {
    let dir = TempDir::new().unwrap();
    let orchestrator = test_orchestrator(dir.path());
    let description = Description::from_yaml(
        "clusters:\n  - id: c\n    networks:\n      - id: ok\n        provider: static\n      - id: odd\n        provider: bridge\n    nodes:\n      - id: n\n        driver: mock\n",
    )
    .unwrap();

    let result = orchestrator.import(&description, true).await;
    assert!(matches!(result, Err(PaddockError::DriverNotFound { .. })));

    let ctx = orchestrator.context();
    assert_eq!(ctx.list(ObjectType::Network), vec!["c.ok"]);
    assert!(ctx.list(ObjectType::Node).is_empty());
    assert!(ctx.objects().find_as::<Network>(ObjectType::Network, "c.ok").is_some());

    orchestrator.shutdown().await.unwrap();
    assert!(ctx.objects().is_empty());
}

#[tokio::test]
async fn test_import_file_reports_missing_network() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lab.yaml");
    std::fs::write(
        &path,
        "clusters:\n  - id: c\n    nodes:\n      - id: n\n        driver: mock\n        nics: [nowhere]\n",
    )
    .unwrap();
    let orchestrator = test_orchestrator(&dir.path().join("work"));

    let result = orchestrator.import_file(&path, true).await;
    match result {
        Err(PaddockError::RefNotFound { object_type, id }) => {
            assert_eq!(object_type, "network");
            assert_eq!(id, "c.nowhere");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_load_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("paddock.toml");
    std::fs::write(
        &path,
        "[server]\nworkdir = \"/srv/lab\"\n\n[network]\nsubnets = [\"10.10.0.0/16,24\"]\n\n[lifecycle]\nverb_timeout = \"30s\"\n",
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.network.subnets, vec!["10.10.0.0/16,24"]);
    assert_eq!(config.lifecycle.verb_timeout, Duration::from_secs(30));
    assert_eq!(config.network.bridge_prefix, "br");

    std::fs::write(&path, "[network]\nsubnets = [\"10.10.0.0/16\"]\n").unwrap();
    assert!(load_config(Some(&path)).is_err());
}

#[test]
fn test_config_renders_as_toml() {
    let config = ConfigBuilder::new().build().unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    assert!(rendered.contains("[network]"));
    assert!(rendered.contains("verb_timeout = \"2m\""));
}

#[test]
fn test_every_plugin_is_registered() {
    let registry = plugin_registry();
    assert_eq!(registry.list("node.driver"), vec!["lxc", "mock", "qemu", "shell"]);
    assert_eq!(registry.list("network.provider"), vec!["bridge", "static"]);
    assert_eq!(registry.list("network.service.dhcp"), vec!["dnsmasq"]);
    assert_eq!(registry.list("network.service.nat"), vec!["iptables"]);
    assert_eq!(registry.list("image.format.rootfs"), vec!["dir", "squashfs"]);
}
