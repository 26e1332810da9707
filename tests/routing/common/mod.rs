//! Shared fixtures for the routing integration suite.
//!
//! `Harness` wires a runtime to in-memory definitions, the built-in type set,
//! a scripted transport and a manual clock. The local executor answers hash
//! queries with the first integer parameter modulo the node count.

#![allow(dead_code)]

use shardcall::testing::{
    cluster_def, function_def, BuiltinTypes, FnExecutor, InMemoryCatalog,
    InMemoryDefinitionStore, ManualClock, ScriptedTransport,
};
use shardcall::{
    Collaborators, FunctionDefinition, FunctionId, ProxyConfig, ProxyError, ProxyRuntime,
    QueryText, RunOnRule, TypeId, Value,
};
use std::sync::{Arc, Once};

static INIT_TRACING: Once = Once::new();

/// Route engine logs to the test writer; `RUST_LOG` style filtering is left
/// to the subscriber defaults.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub const NODES: usize = 4;

pub struct Harness {
    pub store: Arc<InMemoryDefinitionStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub types: Arc<BuiltinTypes>,
    pub transport: ScriptedTransport,
    pub local: Arc<FnExecutor>,
    pub clock: ManualClock,
    pub runtime: ProxyRuntime,
}

impl Harness {
    /// Cluster `shard1` with four nodes and a 60 second connection lifetime
    pub fn new() -> Self {
        Self::with_config(ProxyConfig::default())
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryDefinitionStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let mut shard1 = cluster_def("shard1", NODES);
        shard1
            .options
            .push(("connection_lifetime".to_string(), "60".to_string()));
        catalog.insert(shard1);
        let types = Arc::new(BuiltinTypes::new());
        let transport = ScriptedTransport::new();
        let local = Arc::new(FnExecutor::new(|_, params| {
            let n = params
                .first()
                .and_then(|p| p.value.as_int())
                .ok_or_else(|| ProxyError::parse("hash query", "expected an integer parameter"))?;
            Ok(vec![vec![Value::Int(n.rem_euclid(NODES as i64))]])
        }));
        let clock = ManualClock::new();
        let collaborators = Collaborators {
            store: store.clone(),
            catalog: catalog.clone(),
            types: types.clone(),
            transport: Arc::new(transport.clone()),
            local: local.clone(),
        };
        let runtime = ProxyRuntime::new(config, collaborators)
            .expect("valid config")
            .with_clock(Arc::new(clock.clone()));
        Harness {
            store,
            catalog,
            types,
            transport,
            local,
            clock,
            runtime,
        }
    }

    /// Register a routed function on `shard1`
    pub fn define(&self, def: FunctionDefinition) -> FunctionId {
        let id = def.id;
        self.store.insert(def);
        id
    }
}

/// `get_user(username int4) returns text`, hashed on its argument
pub fn hashed_lookup(id: u32) -> FunctionDefinition {
    function_def(
        id,
        "get_user",
        &[(Some("username"), BuiltinTypes::INT4)],
        BuiltinTypes::TEXT,
        "shard1",
        RunOnRule::Hash(QueryText::new(
            "select shard_of($1)",
            vec!["username".to_string()],
        )),
    )
}

/// Function with no arguments running on `node`
pub fn fixed_node(id: u32, name: &str, return_type: TypeId, node: i64) -> FunctionDefinition {
    function_def(id, name, &[], return_type, "shard1", RunOnRule::Node(node))
}

/// Node index a session was opened for, from its `host=shard1-<n>` address
pub fn node_of(address: &str) -> usize {
    address
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .expect("address ends with a node number")
}
