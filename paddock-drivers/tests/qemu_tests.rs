mod common;

use std::sync::Arc;

use nix::sys::signal::Signal;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

use common::{cluster_with_network, drivers_context, props, refs, write_image, FakeExecutor};
use paddock_core::graph::ObjectType;
use paddock_core::lifecycle::LifecycleState;
use paddock_core::objects::{Network, Node};
use paddock_core::{Context, PaddockError};

const MANIFEST: &str = "\
arch: x86_64
formats:
  - name: qemu
    driver: dir
    dir: disk.qcow2
node:
  driver: qemu
  memory: 1024
";

async fn qemu_node(ctx: &Context, image: &str, extra: Value) -> Result<Arc<Node>, PaddockError> {
    let mut node_props = props(extra);
    node_props.insert("image".into(), json!(image));
    ctx.create_as::<Node>(
        ObjectType::Node,
        "c1.vm",
        refs(&[(ObjectType::Cluster, "c1"), (ObjectType::Network, "c1.net")]),
        node_props,
    )
    .await
}

#[tokio::test]
async fn test_vm_lifecycle() {
    let dir = TempDir::new().unwrap();
    let image = write_image(dir.path(), "vm", MANIFEST);
    let executor = FakeExecutor::new();
    let ctx = drivers_context(&dir.path().join("work"), executor.clone());
    cluster_with_network(&ctx, json!({ "provider": "static" })).await;
    let network = ctx.objects().find_as::<Network>(ObjectType::Network, "c1.net").unwrap();
    let mac = network.address_at(1).unwrap().mac;

    let node = qemu_node(
        &ctx,
        &image,
        json!({ "nics": [{ "network": "c1.net", "address-index": 1 }, "c1.net"] }),
    )
    .await
    .unwrap();
    let source = std::path::Path::new(&image).join("disk.qcow2");
    let disk = node.workdir().join("system.qcow2");

    assert_eq!(node.settle(LifecycleState::Running).await.unwrap(), LifecycleState::Running);
    assert_eq!(
        executor.commands(),
        vec![
            format!("qemu-img info {}", source.display()),
            format!("qemu-img create -b {} {}", source.display(), disk.display()),
            format!(
                "qemu-system-x86_64 -name c1.vm -m 1024 -smp 1 -drive file={},if=virtio -nographic \
                 -netdev user,id=net0 -device virtio-net-pci,netdev=net0,mac={} \
                 -netdev user,id=net1 -device virtio-net-pci,netdev=net1",
                disk.display(),
                mac
            ),
        ]
    );
    let emulator = executor.process("qemu-system-x86_64").unwrap();
    assert_eq!(emulator.opts.cwd.as_deref(), Some(node.workdir()));
    assert_eq!(node.driver().dump()["pid"], emulator.pid);

    // qemu-img is faked, so put the overlay disk in place by hand
    std::fs::write(&disk, b"overlay").unwrap();
    assert_eq!(node.settle(LifecycleState::Offline).await.unwrap(), LifecycleState::Offline);
    assert_eq!(executor.kills(), vec![(emulator.pid, Signal::SIGTERM)]);
    assert!(!disk.exists());
}

#[tokio::test]
async fn test_failed_disk_check_keeps_node_offline() {
    let dir = TempDir::new().unwrap();
    let image = write_image(dir.path(), "vm", MANIFEST);
    let executor = FakeExecutor::new();
    executor.fail("qemu-img info");
    let ctx = drivers_context(&dir.path().join("work"), executor.clone());
    cluster_with_network(&ctx, json!({ "provider": "static" })).await;

    let node = qemu_node(&ctx, &image, json!({})).await.unwrap();
    assert!(node.settle(LifecycleState::Running).await.is_err());
    assert_eq!(node.state(), LifecycleState::Offline);
    assert!(!executor.ran("qemu-img create"));
    assert!(executor.processes().is_empty());
}

#[tokio::test]
async fn test_executable_selection() {
    let dir = TempDir::new().unwrap();
    let no_arch = write_image(
        dir.path(),
        "vmdk",
        "formats:\n  - name: vmdk\n    driver: dir\n    dir: disk.vmdk\nnode:\n  driver: qemu\n",
    );
    let executor = FakeExecutor::new();
    let ctx = drivers_context(&dir.path().join("work"), executor);
    cluster_with_network(&ctx, json!({ "provider": "static" })).await;

    let node = qemu_node(&ctx, &no_arch, json!({})).await.unwrap();
    let dump = node.driver().dump();
    assert_eq!(dump["executable"], "kvm");
    assert_eq!(
        dump["disk"],
        json!(node.workdir().join("system.vmdk").display().to_string())
    );
    ctx.delete(ObjectType::Node, "c1.vm", false).await.unwrap();

    let node = qemu_node(&ctx, &no_arch, json!({ "qemu": "/opt/qemu/bin/qemu", "cpus": 4 }))
        .await
        .unwrap();
    assert_eq!(node.driver().dump()["executable"], "/opt/qemu/bin/qemu");
}

#[tokio::test]
async fn test_image_without_disk_is_rejected() {
    let dir = TempDir::new().unwrap();
    let image = write_image(dir.path(), "ct", "formats:\n  - name: rootfs\n    driver: dir\n");
    let executor = FakeExecutor::new();
    let ctx = drivers_context(&dir.path().join("work"), executor);
    cluster_with_network(&ctx, json!({ "provider": "static" })).await;

    let result = qemu_node(&ctx, &image, json!({ "driver": "qemu" })).await;
    assert!(matches!(result, Err(PaddockError::Validation { .. })));
}
