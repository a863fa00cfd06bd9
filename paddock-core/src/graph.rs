//! Management object graph
//!
//! Objects are addressed by [`ObjectKey`] (type + id), never by pointer.
//! References between objects are declared per type in a
//! [`ModelDefinition`]; the type-level relation must be acyclic and its
//! topological order drives `destroy_all`.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{AggregateError, PaddockError, PaddockResult};

/// Free-form property bag supplied at creation
pub type Properties = serde_json::Map<String, Value>;

/// Referenced ids per type, as supplied by callers
pub type RefIds = BTreeMap<ObjectType, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Cluster,
    Network,
    Node,
    Service,
    Image,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Cluster => "cluster",
            ObjectType::Network => "network",
            ObjectType::Node => "node",
            ObjectType::Service => "service",
            ObjectType::Image => "image",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = PaddockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(ObjectType::Cluster),
            "network" => Ok(ObjectType::Network),
            "node" => Ok(ObjectType::Node),
            "service" => Ok(ObjectType::Service),
            "image" => Ok(ObjectType::Image),
            _ => Err(PaddockError::UnknownType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub object_type: ObjectType,
    pub id: String,
}

impl ObjectKey {
    pub fn new(object_type: ObjectType, id: impl Into<String>) -> Self {
        Self {
            object_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.object_type, self.id)
    }
}

/// Behaviour shared by every entity in the graph
#[async_trait]
pub trait ManagedObject: Send + Sync + 'static {
    fn object_type(&self) -> ObjectType;

    fn id(&self) -> &str;

    fn properties(&self) -> &Properties;

    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.object_type(), self.id())
    }

    /// Plain serializable snapshot
    fn dump(&self) -> Value {
        Value::Object(self.properties().clone())
    }

    async fn update(&self, _props: &Properties) -> PaddockResult<()> {
        Err(PaddockError::validation(
            "properties",
            format!("{} objects cannot be updated", self.object_type()),
        ))
    }

    /// Release everything the object owns
    async fn destruct(&self) -> PaddockResult<()> {
        Ok(())
    }

    /// Dependencies discovered during setup, beyond the caller-supplied refs
    fn dependencies(&self) -> Vec<ObjectKey> {
        Vec::new()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Downcast a graph object to its concrete type
pub fn downcast<T: ManagedObject>(object: Arc<dyn ManagedObject>) -> PaddockResult<Arc<T>> {
    let key = object.key();
    object
        .into_any()
        .downcast::<T>()
        .map_err(|_| PaddockError::Internal {
            message: format!("{} has an unexpected concrete type", key),
        })
}

/// Referenced objects handed to a factory, in the order they were given
#[derive(Default, Clone)]
pub struct ResolvedRefs {
    refs: BTreeMap<ObjectType, Vec<Arc<dyn ManagedObject>>>,
}

impl ResolvedRefs {
    pub fn get(&self, object_type: ObjectType) -> &[Arc<dyn ManagedObject>] {
        self.refs.get(&object_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First referenced object of `object_type`; the reference is mandatory
    pub fn first_as<T: ManagedObject>(&self, object_type: ObjectType) -> PaddockResult<Arc<T>> {
        let object = self.get(object_type).first().cloned().ok_or_else(|| {
            PaddockError::validation(
                format!("refs.{}", object_type),
                "a reference is required",
            )
        })?;
        downcast(object)
    }

    pub fn all_as<T: ManagedObject>(&self, object_type: ObjectType) -> PaddockResult<Vec<Arc<T>>> {
        self.get(object_type)
            .iter()
            .cloned()
            .map(downcast)
            .collect()
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.refs
            .values()
            .flatten()
            .map(|object| object.key())
            .collect()
    }
}

/// Input to an [`ObjectFactory`]
pub struct CreateRequest<'a> {
    pub context: &'a Context,
    pub id: String,
    pub properties: Properties,
    pub refs: ResolvedRefs,
}

/// Builds and sets up objects of one type
#[async_trait]
pub trait ObjectFactory: Send + Sync {
    async fn create(&self, req: CreateRequest<'_>) -> PaddockResult<Arc<dyn ManagedObject>>;
}

/// Per-type declaration registered through [`ObjectGraph::define`]
#[derive(Clone)]
pub struct ModelDefinition {
    pub object_type: ObjectType,
    /// Types a caller may reference when creating this type
    pub refs: Vec<ObjectType>,
    /// Types this type may come to depend on during setup
    pub implicit_refs: Vec<ObjectType>,
    pub factory: Arc<dyn ObjectFactory>,
}

impl ModelDefinition {
    pub fn new(object_type: ObjectType, factory: Arc<dyn ObjectFactory>) -> Self {
        Self {
            object_type,
            refs: Vec::new(),
            implicit_refs: Vec::new(),
            factory,
        }
    }

    pub fn refs(mut self, refs: impl IntoIterator<Item = ObjectType>) -> Self {
        self.refs = refs.into_iter().collect();
        self
    }

    pub fn implicit_refs(mut self, refs: impl IntoIterator<Item = ObjectType>) -> Self {
        self.implicit_refs = refs.into_iter().collect();
        self
    }

    fn depends_on(&self) -> impl Iterator<Item = &ObjectType> {
        self.refs.iter().chain(self.implicit_refs.iter())
    }
}

struct Entry {
    object: Arc<dyn ManagedObject>,
    seq: u64,
}

#[derive(Default)]
struct GraphState {
    objects: HashMap<ObjectKey, Entry>,
    pending: BTreeSet<ObjectKey>,
    /// Forward edges: what each key references
    refs: HashMap<ObjectKey, Vec<ObjectKey>>,
    /// Back edges: who references each key
    dependents: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
    next_seq: u64,
}

impl GraphState {
    fn link(&mut self, from: &ObjectKey, targets: Vec<ObjectKey>) {
        for target in &targets {
            self.dependents
                .entry(target.clone())
                .or_default()
                .insert(from.clone());
        }
        self.refs.entry(from.clone()).or_default().extend(targets);
    }

    fn unlink(&mut self, from: &ObjectKey) {
        for target in self.refs.remove(from).unwrap_or_default() {
            if let Some(set) = self.dependents.get_mut(&target) {
                set.remove(from);
                if set.is_empty() {
                    self.dependents.remove(&target);
                }
            }
        }
    }

    fn dependents_of(&self, key: &ObjectKey) -> Vec<ObjectKey> {
        self.dependents
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Registry of live objects keyed by (type, id)
pub struct ObjectGraph {
    models: BTreeMap<ObjectType, ModelDefinition>,
    definition_order: Vec<ObjectType>,
    topo_order: Vec<ObjectType>,
    state: Mutex<GraphState>,
    /// Signalled whenever a pending creation finishes
    settled: Notify,
}

impl fmt::Debug for ObjectGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObjectGraph")
            .field("types", &self.topo_order)
            .field("objects", &state.objects.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Default for ObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
            definition_order: Vec::new(),
            topo_order: Vec::new(),
            state: Mutex::new(GraphState::default()),
            settled: Notify::new(),
        }
    }

    /// Register model definitions. The whole table is rejected when a type
    /// references an undefined type or the refs relation has a cycle.
    pub fn define(&mut self, models: Vec<ModelDefinition>) -> PaddockResult<()> {
        let mut table = self.models.clone();
        let mut order = self.definition_order.clone();
        for model in models {
            if !order.contains(&model.object_type) {
                order.push(model.object_type);
            }
            table.insert(model.object_type, model);
        }

        let topo = topological_order(&table, &order)?;
        debug!("Object types in dependency order: {:?}", topo);

        self.models = table;
        self.definition_order = order;
        self.topo_order = topo;
        Ok(())
    }

    /// Defined types, referenced types first
    pub fn types(&self) -> &[ObjectType] {
        &self.topo_order
    }

    pub fn model(&self, object_type: ObjectType) -> Option<&ModelDefinition> {
        self.models.get(&object_type)
    }

    /// Resolve refs, run the factory and register the result. Nothing is
    /// registered when any step fails.
    pub async fn create(
        &self,
        context: &Context,
        key: ObjectKey,
        ref_ids: RefIds,
        properties: Properties,
    ) -> PaddockResult<Arc<dyn ManagedObject>> {
        let model = self
            .models
            .get(&key.object_type)
            .ok_or_else(|| PaddockError::UnknownType(key.object_type.to_string()))?;

        for ref_type in ref_ids.keys() {
            if !model.refs.contains(ref_type) {
                return Err(PaddockError::InvalidRef {
                    object_type: key.object_type.to_string(),
                    ref_type: ref_type.to_string(),
                });
            }
        }

        let refs = {
            let mut state = self.state.lock();
            if state.objects.contains_key(&key) || state.pending.contains(&key) {
                return Err(PaddockError::AlreadyExists {
                    resource: key.to_string(),
                });
            }

            let mut refs = ResolvedRefs::default();
            for (ref_type, ids) in &ref_ids {
                let resolved = refs.refs.entry(*ref_type).or_default();
                for id in ids {
                    let ref_key = ObjectKey::new(*ref_type, id.clone());
                    let entry = state.objects.get(&ref_key).ok_or_else(|| {
                        PaddockError::RefNotFound {
                            object_type: ref_type.to_string(),
                            id: id.clone(),
                        }
                    })?;
                    resolved.push(Arc::clone(&entry.object));
                }
            }

            // Referenced objects are in use while the factory runs
            state.pending.insert(key.clone());
            state.link(&key, refs.keys());
            refs
        };

        debug!("NEW-MO {}", key);
        let request = CreateRequest {
            context,
            id: key.id.clone(),
            properties,
            refs,
        };

        match model.factory.create(request).await {
            Ok(object) => {
                let mut state = self.state.lock();
                state.pending.remove(&key);

                let allowed: BTreeSet<ObjectType> = model.depends_on().copied().collect();
                let extra: Vec<ObjectKey> = object
                    .dependencies()
                    .into_iter()
                    .filter(|dep| {
                        let ok = allowed.contains(&dep.object_type) && state.objects.contains_key(dep);
                        if !ok {
                            warn!("{} declares unusable dependency {}", key, dep);
                        }
                        ok
                    })
                    .collect();
                state.link(&key, extra);

                let seq = state.next_seq;
                state.next_seq += 1;
                state.objects.insert(
                    key.clone(),
                    Entry {
                        object: Arc::clone(&object),
                        seq,
                    },
                );
                drop(state);
                self.settled.notify_waiters();
                info!("Created {}", key);
                Ok(object)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.pending.remove(&key);
                state.unlink(&key);
                drop(state);
                self.settled.notify_waiters();
                warn!("Failed to create {}: {}", key, e);
                Err(e)
            }
        }
    }

    pub fn find(&self, object_type: ObjectType, id: &str) -> Option<Arc<dyn ManagedObject>> {
        let key = ObjectKey::new(object_type, id);
        self.state
            .lock()
            .objects
            .get(&key)
            .map(|entry| Arc::clone(&entry.object))
    }

    pub fn find_as<T: ManagedObject>(&self, object_type: ObjectType, id: &str) -> Option<Arc<T>> {
        self.find(object_type, id)
            .and_then(|object| downcast(object).ok())
    }

    pub fn get(&self, object_type: ObjectType, id: &str) -> PaddockResult<Arc<dyn ManagedObject>> {
        self.find(object_type, id)
            .ok_or_else(|| PaddockError::NotFound {
                resource: ObjectKey::new(object_type, id).to_string(),
            })
    }

    pub fn is_pending(&self, key: &ObjectKey) -> bool {
        self.state.lock().pending.contains(key)
    }

    /// Wait until `key` has no creation in flight
    pub async fn wait_settled(&self, key: &ObjectKey) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            // Register before checking so a finish in between is not missed
            notified.as_mut().enable();
            if !self.is_pending(key) {
                return;
            }
            notified.await;
        }
    }

    /// Ids of live objects of one type, in creation order
    pub fn list(&self, object_type: ObjectType) -> Vec<String> {
        self.list_keys(object_type)
            .into_iter()
            .map(|key| key.id)
            .collect()
    }

    fn list_keys(&self, object_type: ObjectType) -> Vec<ObjectKey> {
        let state = self.state.lock();
        let mut keys: Vec<(u64, ObjectKey)> = state
            .objects
            .iter()
            .filter(|(key, _)| key.object_type == object_type)
            .map(|(key, entry)| (entry.seq, key.clone()))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of objects (live or still being created) referencing `key`
    pub fn dependents(&self, key: &ObjectKey) -> Vec<ObjectKey> {
        self.state.lock().dependents_of(key)
    }

    /// Keys `key` references
    pub fn references(&self, key: &ObjectKey) -> Vec<ObjectKey> {
        self.state
            .lock()
            .refs
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn update(
        &self,
        object_type: ObjectType,
        id: &str,
        properties: &Properties,
    ) -> PaddockResult<()> {
        self.get(object_type, id)?.update(properties).await
    }

    pub fn dump(&self, object_type: ObjectType, id: &str) -> PaddockResult<Value> {
        Ok(self.get(object_type, id)?.dump())
    }

    /// Every live object, grouped by type
    pub fn dump_all(&self) -> Value {
        let mut out = serde_json::Map::new();
        for object_type in &self.topo_order {
            let mut objects = serde_json::Map::new();
            for key in self.list_keys(*object_type) {
                if let Some(object) = self.find(key.object_type, &key.id) {
                    objects.insert(key.id, object.dump());
                }
            }
            out.insert(object_type.to_string(), Value::Object(objects));
        }
        Value::Object(out)
    }

    /// Destroy one object. Fails with `InUse` while other objects reference
    /// it, unless `recursive` is set, in which case dependents go first.
    ///
    /// An object whose `destruct` fails is still removed from the graph and
    /// the failure is reported.
    pub async fn destroy(&self, key: &ObjectKey, recursive: bool) -> PaddockResult<()> {
        self.destroy_boxed(key.clone(), recursive).await
    }

    fn destroy_boxed(&self, key: ObjectKey, recursive: bool) -> BoxFuture<'_, PaddockResult<()>> {
        async move {
            let dependents = {
                let state = self.state.lock();
                if !state.objects.contains_key(&key) {
                    return Err(PaddockError::NotFound {
                        resource: key.to_string(),
                    });
                }
                let dependents = state.dependents_of(&key);
                let pending: Vec<ObjectKey> = dependents
                    .iter()
                    .filter(|dep| state.pending.contains(*dep))
                    .cloned()
                    .collect();
                if (!dependents.is_empty() && !recursive) || !pending.is_empty() {
                    return Err(PaddockError::InUse {
                        resource: key.to_string(),
                        dependents: dependents.iter().map(ToString::to_string).collect(),
                    });
                }
                dependents
            };

            let mut errors = AggregateError::new();
            for dependent in dependents {
                match self.destroy_boxed(dependent.clone(), true).await {
                    Ok(()) | Err(PaddockError::NotFound { .. }) => {}
                    Err(e) => errors.push(dependent.to_string(), e),
                }
            }

            let object = {
                let mut state = self.state.lock();
                match state.objects.remove(&key) {
                    Some(entry) => entry.object,
                    // Someone else got there while dependents were going away
                    None => return errors.into_result(),
                }
            };

            debug!("DEL-MO {}", key);
            let result = object.destruct().await;
            self.state.lock().unlink(&key);

            match result {
                Ok(()) => info!("Destroyed {}", key),
                Err(e) => {
                    warn!("Destruct of {} failed: {}", key, e);
                    errors.push(key.to_string(), e);
                }
            }
            errors.into_result()
        }
        .boxed()
    }

    /// Destroy everything, one type batch at a time with dependent types
    /// first. Objects of one type are destroyed concurrently. Every object is
    /// attempted; failures come back as an aggregate of per-type aggregates.
    pub async fn destroy_all(&self) -> PaddockResult<()> {
        let mut all = AggregateError::new();

        for object_type in self.topo_order.iter().rev() {
            let keys = self.list_keys(*object_type);
            if keys.is_empty() {
                continue;
            }
            info!("Destroying {} {} object(s)", keys.len(), object_type);

            let results = join_all(keys.iter().map(|key| self.destroy(key, true))).await;

            let mut batch = AggregateError::new();
            for (key, result) in keys.iter().zip(results) {
                match result {
                    Ok(()) | Err(PaddockError::NotFound { .. }) => {}
                    Err(e) => batch.push(key.to_string(), e),
                }
            }
            if !batch.is_empty() {
                all.push(object_type.to_string(), PaddockError::Aggregate(batch));
            }
        }

        all.into_result()
    }
}

/// Kahn's algorithm over the type-level refs relation. Among types that are
/// ready at the same time, definition order wins.
fn topological_order(
    models: &BTreeMap<ObjectType, ModelDefinition>,
    definition_order: &[ObjectType],
) -> PaddockResult<Vec<ObjectType>> {
    let mut indegree: BTreeMap<ObjectType, usize> = BTreeMap::new();
    let mut users: BTreeMap<ObjectType, Vec<ObjectType>> = BTreeMap::new();

    for object_type in definition_order {
        let model = &models[object_type];
        let deps: BTreeSet<ObjectType> = model.depends_on().copied().collect();
        for dep in &deps {
            if !models.contains_key(dep) {
                return Err(PaddockError::validation(
                    format!("{}.refs", object_type),
                    format!("references undefined type {}", dep),
                ));
            }
            users.entry(*dep).or_default().push(*object_type);
        }
        indegree.insert(*object_type, deps.len());
    }

    let position = |t: &ObjectType| definition_order.iter().position(|d| d == t);
    let mut ready: VecDeque<ObjectType> = definition_order
        .iter()
        .filter(|t| indegree[*t] == 0)
        .copied()
        .collect();
    let mut order = Vec::with_capacity(definition_order.len());

    while let Some(object_type) = ready.pop_front() {
        order.push(object_type);
        let mut released = Vec::new();
        for user in users.get(&object_type).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(user) {
                *count -= 1;
                if *count == 0 {
                    released.push(*user);
                }
            }
        }
        ready.extend(released);
        let mut sorted: Vec<ObjectType> = ready.drain(..).collect();
        sorted.sort_by_key(|t| position(t));
        ready.extend(sorted);
    }

    if order.len() != definition_order.len() {
        let stuck: Vec<String> = definition_order
            .iter()
            .filter(|t| !order.contains(t))
            .map(ToString::to_string)
            .collect();
        return Err(PaddockError::validation(
            "models",
            format!("reference cycle among types: {}", stuck.join(", ")),
        ));
    }

    Ok(order)
}
