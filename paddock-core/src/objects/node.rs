//! A node is an isolated environment (container or VM) running an operating
//! system, driven through a [`LifecycleMachine`].

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{overlay, str_prop, Cluster, Image, Network};
use crate::driver::Driver;
use crate::error::{PaddockError, PaddockResult};
use crate::graph::{
    CreateRequest, ManagedObject, ObjectFactory, ObjectKey, ObjectType, Properties,
};
use crate::lifecycle::{
    self, LifecycleEvent, LifecycleMachine, LifecycleState, MachineOptions, MachineSnapshot,
};
use crate::registry::DriverContext;

pub struct Node {
    id: String,
    properties: Properties,
    cluster: Arc<Cluster>,
    networks: Vec<Arc<Network>>,
    image: Option<Arc<Image>>,
    workdir: PathBuf,
    driver_name: String,
    driver: Arc<dyn Driver>,
    machine: LifecycleMachine,
    destructing: AtomicBool,
}

impl Node {
    pub fn name(&self) -> Option<&str> {
        str_prop(&self.properties, "name")
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn networks(&self) -> &[Arc<Network>] {
        &self.networks
    }

    pub fn network(&self, id: &str) -> Option<&Arc<Network>> {
        self.networks.iter().find(|n| n.id() == id)
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        self.image.as_ref()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.current()
    }

    pub fn expected_state(&self) -> LifecycleState {
        self.machine.expected()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.machine.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.machine.subscribe()
    }

    /// Request a stable state; refused once the node is being destroyed
    pub async fn set_state(&self, target: LifecycleState) -> PaddockResult<bool> {
        if self.destructing.load(Ordering::SeqCst) {
            debug!(id = %self.id, "Refusing state {} while destroying", target);
            return Err(PaddockError::validation("state", "node is being destroyed"));
        }
        self.machine.set_expected_state(target).await
    }

    /// Request a stable state and wait for the machine to get there
    pub async fn settle(&self, target: LifecycleState) -> PaddockResult<LifecycleState> {
        self.machine.settle(target).await
    }

    /// Ask the driver for a fresh status report
    pub fn request_status(&self) -> &Self {
        self.machine.request_status();
        self
    }
}

#[async_trait]
impl ManagedObject for Node {
    fn object_type(&self) -> ObjectType {
        ObjectType::Node
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn dump(&self) -> Value {
        let snapshot = self.machine.snapshot();
        let mut driver = json!({ "name": self.driver_name });
        if let (Some(map), Value::Object(extra)) = (driver.as_object_mut(), self.driver.dump()) {
            map.extend(extra);
        }
        json!({
            "image": self.image.as_ref().map(|i| i.id().to_string()),
            "name": self.name(),
            "state": {
                "current": snapshot.current,
                "expected": snapshot.expected,
            },
            "status": snapshot.status,
            "fault": snapshot.fault,
            "driver": driver,
            "workdir": self.workdir,
        })
    }

    /// Only `state` may change after creation, and only to a stable state.
    /// Asking for the state the node is already settled in changes nothing.
    async fn update(&self, props: &Properties) -> PaddockResult<()> {
        let value = props.get("state").ok_or_else(|| PaddockError::no_attr("state"))?;
        let target: LifecycleState = value
            .as_str()
            .ok_or_else(|| PaddockError::bad_attr("state", value))?
            .parse()?;
        if !target.is_stable() {
            return Err(PaddockError::bad_attr("state", target));
        }

        let initiated = self.set_state(target).await?;
        debug!(id = %self.id, "State update to {} (initiated: {})", target, initiated);
        Ok(())
    }

    async fn destruct(&self) -> PaddockResult<()> {
        self.destructing.store(true, Ordering::SeqCst);
        let result = self.machine.settle(LifecycleState::Offline).await;
        self.machine.shutdown();
        result.map(|_| ())
    }

    fn dependencies(&self) -> Vec<ObjectKey> {
        self.image.iter().map(|image| image.key()).collect()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct NodeFactory;

#[async_trait]
impl ObjectFactory for NodeFactory {
    async fn create(&self, req: CreateRequest<'_>) -> PaddockResult<Arc<dyn ManagedObject>> {
        let cluster: Arc<Cluster> = req.refs.first_as(ObjectType::Cluster)?;
        let networks: Vec<Arc<Network>> = req.refs.all_as(ObjectType::Network)?;

        let workdir = cluster.workdir().join(format!("c-{}", req.id));
        tokio::fs::create_dir_all(&workdir).await?;

        let image = match str_prop(&req.properties, "image") {
            Some(dir) => Some(req.context.load_image(dir).await?),
            None => None,
        };
        let manifest = image.as_ref().map(|i| i.manifest());

        let driver_name = str_prop(&req.properties, "driver")
            .or_else(|| str_prop(&req.properties, "interior"))
            .or_else(|| manifest.and_then(|m| m.node_driver()))
            .ok_or_else(|| PaddockError::no_attr("driver"))?
            .to_string();
        let params = overlay(manifest.and_then(|m| m.node.as_ref()), &req.properties);

        let (monitor, inbox) = lifecycle::channel();
        let driver = req.context.plugins().create_driver(
            &driver_name,
            DriverContext {
                node_id: req.id.clone(),
                workdir: workdir.clone(),
                params,
                image: image.clone(),
                networks: networks.clone(),
                monitor,
                config: Arc::clone(req.context.config()),
            },
        )?;

        let machine = LifecycleMachine::spawn(
            req.id.clone(),
            Arc::clone(&driver),
            inbox,
            MachineOptions {
                initial: LifecycleState::Offline,
                verb_timeout: req.context.config().lifecycle.verb_timeout(),
            },
        );
        info!(id = %req.id, "Node ready with driver {}", driver_name);

        Ok(Arc::new(Node {
            id: req.id,
            properties: req.properties,
            cluster,
            networks,
            image,
            workdir,
            driver_name,
            driver,
            machine,
            destructing: AtomicBool::new(false),
        }))
    }
}
