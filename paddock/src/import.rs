//! Cluster description files
//!
//! A description lists clusters, each carrying its networks and nodes.
//! Network and node ids are local to their cluster in the file and become
//! `<cluster>.<id>` in the object graph; nic network references are
//! rewritten the same way. Everything else is passed through as object
//! properties.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use paddock_core::graph::{ObjectType, Properties, RefIds};
use paddock_core::{Context, PaddockError, PaddockResult};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Description {
    #[serde(default)]
    pub clusters: Vec<ClusterDescription>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClusterDescription {
    pub id: String,
    #[serde(default)]
    pub networks: Vec<MemberDescription>,
    #[serde(default)]
    pub nodes: Vec<MemberDescription>,
    #[serde(flatten)]
    pub properties: Properties,
}

/// A network or node entry; `id` is relative to the enclosing cluster
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MemberDescription {
    pub id: String,
    #[serde(flatten)]
    pub properties: Properties,
}

/// One object to create, in the order objects must be created
#[derive(Debug, Clone, PartialEq)]
pub struct ImportStep {
    pub object_type: ObjectType,
    pub id: String,
    pub refs: RefIds,
    pub properties: Properties,
}

/// What an import created
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportSummary {
    pub clusters: Vec<String>,
    pub networks: Vec<String>,
    pub nodes: Vec<String>,
    pub started: Vec<String>,
}

impl Description {
    /// Load a description; `.json` files are parsed as JSON, anything else
    /// as YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> PaddockResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn from_yaml(contents: &str) -> PaddockResult<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Creation order: each cluster, then its networks, then its nodes
    pub fn plan(&self) -> PaddockResult<Vec<ImportStep>> {
        let mut steps = Vec::new();
        for cluster in &self.clusters {
            check_id("cluster", &cluster.id)?;
            steps.push(ImportStep {
                object_type: ObjectType::Cluster,
                id: cluster.id.clone(),
                refs: RefIds::new(),
                properties: cluster.properties.clone(),
            });

            for network in &cluster.networks {
                check_id("network", &network.id)?;
                steps.push(ImportStep {
                    object_type: ObjectType::Network,
                    id: scoped(&cluster.id, &network.id),
                    refs: cluster_refs(&cluster.id),
                    properties: network.properties.clone(),
                });
            }

            for node in &cluster.nodes {
                check_id("node", &node.id)?;
                steps.push(node_step(&cluster.id, node)?);
            }
        }
        Ok(steps)
    }
}

fn check_id(kind: &str, id: &str) -> PaddockResult<()> {
    if id.trim().is_empty() {
        return Err(PaddockError::validation(
            format!("{}.id", kind),
            "must not be empty",
        ));
    }
    Ok(())
}

fn scoped(cluster: &str, id: &str) -> String {
    format!("{}.{}", cluster, id)
}

fn cluster_refs(cluster: &str) -> RefIds {
    let mut refs = RefIds::new();
    refs.insert(ObjectType::Cluster, vec![cluster.to_string()]);
    refs
}

fn node_step(cluster: &str, node: &MemberDescription) -> PaddockResult<ImportStep> {
    let mut properties = node.properties.clone();
    let mut networks: Vec<String> = Vec::new();

    let nics = match properties.remove("nics") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(other) => return Err(PaddockError::bad_attr("nics", other)),
    };

    let mut rewritten = Vec::with_capacity(nics.len());
    for nic in nics {
        let mut nic = match nic {
            Value::String(network) => {
                let mut nic = Map::new();
                nic.insert("network".to_string(), Value::String(network));
                nic
            }
            Value::Object(nic) => nic,
            other => return Err(PaddockError::bad_attr("nics", other)),
        };
        let network = match nic.get("network") {
            Some(Value::String(network)) => scoped(cluster, network),
            Some(other) => return Err(PaddockError::bad_attr("nics.network", other)),
            None => return Err(PaddockError::no_attr("nics.network")),
        };
        if !networks.contains(&network) {
            networks.push(network.clone());
        }
        nic.insert("network".to_string(), Value::String(network));
        rewritten.push(Value::Object(nic));
    }
    properties.insert("nics".to_string(), Value::Array(rewritten));

    let mut refs = cluster_refs(cluster);
    refs.insert(ObjectType::Network, networks);

    Ok(ImportStep {
        object_type: ObjectType::Node,
        id: scoped(cluster, &node.id),
        refs,
        properties,
    })
}

/// Create every object of `description`, stopping at the first failure.
/// With `start`, each node is asked to run as soon as it exists.
pub async fn import(
    context: &Context,
    description: &Description,
    start: bool,
) -> PaddockResult<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut running = Properties::new();
    running.insert("state".to_string(), Value::String("running".to_string()));

    for step in description.plan()? {
        info!("IMPORT {:<8} {}", step.object_type.as_str().to_uppercase(), step.id);
        context
            .create_object(step.object_type, step.id.clone(), step.refs, step.properties)
            .await?;

        match step.object_type {
            ObjectType::Cluster => summary.clusters.push(step.id),
            ObjectType::Network => summary.networks.push(step.id),
            ObjectType::Node => {
                if start {
                    info!("IMPORT START    {}", step.id);
                    context.update(ObjectType::Node, &step.id, &running).await?;
                    summary.started.push(step.id.clone());
                }
                summary.nodes.push(step.id);
            }
            _ => {}
        }
    }

    Ok(summary)
}
