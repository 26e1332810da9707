//! Definition store and cluster catalog backed by hash maps

use parking_lot::Mutex;
use shardcall_core::{
    ClusterCatalog, ClusterDefinition, DefinitionStore, FunctionDefinition, FunctionId,
    ProxyResult, RoutingRule, RunOnRule, Stamp, TypeId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Routed function definitions keyed by id
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    functions: Mutex<HashMap<FunctionId, FunctionDefinition>>,
    loads: AtomicUsize,
}

impl InMemoryDefinitionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a definition, keeping its stamp
    pub fn insert(&self, def: FunctionDefinition) {
        self.functions.lock().insert(def.id, def);
    }

    /// Replace a definition as an edit would: the stored stamp advances
    pub fn update(&self, mut def: FunctionDefinition) {
        let mut functions = self.functions.lock();
        if let Some(old) = functions.get(&def.id) {
            def.stamp = old.stamp.next();
        }
        functions.insert(def.id, def);
    }

    /// Advance a definition's stamp without changing it
    pub fn touch(&self, id: FunctionId) {
        if let Some(def) = self.functions.lock().get_mut(&id) {
            def.stamp = def.stamp.next();
        }
    }

    /// Delete a definition
    pub fn remove(&self, id: FunctionId) {
        self.functions.lock().remove(&id);
    }

    /// How many times `load_function` ran
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn load_function(&self, id: FunctionId) -> ProxyResult<Option<FunctionDefinition>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.functions.lock().get(&id).cloned())
    }

    fn function_stamp(&self, id: FunctionId) -> ProxyResult<Option<Stamp>> {
        Ok(self.functions.lock().get(&id).map(|d| d.stamp))
    }
}

/// Cluster definitions keyed by name
#[derive(Default)]
pub struct InMemoryCatalog {
    clusters: Mutex<HashMap<String, ClusterDefinition>>,
    loads: AtomicUsize,
}

impl InMemoryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a cluster, keeping its stamp
    pub fn insert(&self, def: ClusterDefinition) {
        self.clusters.lock().insert(def.name.clone(), def);
    }

    /// Replace a cluster as an edit would: the stored stamp advances
    pub fn update(&self, mut def: ClusterDefinition) {
        let mut clusters = self.clusters.lock();
        if let Some(old) = clusters.get(&def.name) {
            def.stamp = old.stamp.next();
        }
        clusters.insert(def.name.clone(), def);
    }

    /// Delete a cluster
    pub fn remove(&self, name: &str) {
        self.clusters.lock().remove(name);
    }

    /// How many times `load_cluster` ran
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ClusterCatalog for InMemoryCatalog {
    fn load_cluster(&self, name: &str) -> ProxyResult<Option<ClusterDefinition>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.clusters.lock().get(name).cloned())
    }

    fn cluster_stamp(&self, name: &str) -> ProxyResult<Option<Stamp>> {
        Ok(self.clusters.lock().get(name).map(|d| d.stamp))
    }
}

/// Cluster with `nodes` nodes at `host=<name>-<i>`
pub fn cluster_def(name: &str, nodes: usize) -> ClusterDefinition {
    ClusterDefinition {
        id: 1,
        name: name.to_string(),
        options: (0..nodes)
            .map(|i| (format!("node_{}", i), format!("host={}-{}", name, i)))
            .collect(),
        user_options: Vec::new(),
        stamp: Stamp::new(1, 1),
    }
}

/// Single-valued function calling its same-named remote counterpart
pub fn function_def(
    id: u32,
    name: &str,
    args: &[(Option<&str>, TypeId)],
    return_type: TypeId,
    cluster: &str,
    run_on: RunOnRule,
) -> FunctionDefinition {
    FunctionDefinition {
        id: FunctionId(id),
        name: name.to_string(),
        arg_names: args.iter().map(|(n, _)| n.map(str::to_string)).collect(),
        arg_types: args.iter().map(|(_, t)| *t).collect(),
        return_type,
        return_typmod: -1,
        returns_set: false,
        rule: RoutingRule {
            cluster: cluster.to_string(),
            run_on,
            query: None,
        },
        stamp: Stamp::new(1, u64::from(id)),
    }
}
