//! Management objects: cluster, network, node, service, image

pub mod cluster;
pub mod image;
pub mod network;
pub mod node;
pub mod service;

use std::sync::Arc;

use serde_json::Value;

use crate::graph::{ModelDefinition, ObjectType, Properties};

pub use cluster::Cluster;
pub use image::Image;
pub use network::Network;
pub use node::Node;
pub use service::Service;

/// The model table every context starts with
pub fn standard_models() -> Vec<ModelDefinition> {
    vec![
        ModelDefinition::new(ObjectType::Image, Arc::new(image::ImageFactory)),
        ModelDefinition::new(ObjectType::Cluster, Arc::new(cluster::ClusterFactory)),
        ModelDefinition::new(ObjectType::Network, Arc::new(network::NetworkFactory))
            .refs([ObjectType::Cluster]),
        ModelDefinition::new(ObjectType::Service, Arc::new(service::ServiceFactory))
            .refs([ObjectType::Network]),
        ModelDefinition::new(ObjectType::Node, Arc::new(node::NodeFactory))
            .refs([ObjectType::Cluster, ObjectType::Network])
            .implicit_refs([ObjectType::Image]),
    ]
}

pub(crate) fn str_prop<'a>(props: &'a Properties, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str)
}

/// Merge `overlay` on top of `base`, key by key
pub(crate) fn overlay(base: Option<&Properties>, overlay: &Properties) -> Properties {
    let mut merged = base.cloned().unwrap_or_default();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
