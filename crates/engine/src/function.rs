//! Routing-function compiler and cache
//!
//! `compile` turns a parsed function definition into a [`RoutingDescriptor`]:
//! the cluster is resolved, every argument reference is bound to a position,
//! every argument and return type is resolved to a codec, and the remote
//! statement is fixed (or prepared for per-call completion when the function
//! returns an anonymous record).
//!
//! # Caching
//!
//! Descriptors are cached by function id as `Arc<RoutingDescriptor>`. A
//! lookup re-checks the definition stamp and the stamps of every referenced
//! codec; on mismatch the function is recompiled and the entry replaced. An
//! in-flight call keeps its own `Arc`, so a superseded descriptor is destroyed
//! only when the last call using it returns.
//!
//! # Locking
//!
//! Compilation runs with the function cache unlocked. The cluster and type
//! caches are locked only for the duration of one lookup each.

use crate::cluster::{Cluster, ClusterRegistry};
use crate::codec::{CachedType, RecordField, TypeCodecCache};
use crate::query::{
    derive_call_sql, derive_record_call_sql, resolve_argument, with_column_list, BoundQuery,
};
use parking_lot::Mutex;
use shardcall_core::{
    ClusterCatalog, DefinitionKind, DefinitionStore, FunctionDefinition, FunctionId, Limits,
    ProxyError, ProxyResult, RunOnRule, Stamp, TypeCategory, TypeId, TypeProvider, WireFormat,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// How a compiled function picks its node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOn {
    /// Run the bound query locally; its result is the node index
    Hash(BoundQuery),
    /// Fixed node index, checked against the cluster at compile time
    Node(usize),
    /// Node index read from the argument at this position
    ArgNode(usize),
    /// Any node, chosen per call
    Any,
}

impl RunOn {
    /// Mode keyword, for logs
    pub fn mode(&self) -> &'static str {
        match self {
            RunOn::Hash(_) => "hash",
            RunOn::Node(_) => "node",
            RunOn::ArgNode(_) => "argument node",
            RunOn::Any => "any",
        }
    }
}

/// Statement sent to the chosen node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteQuery {
    /// Sent as is
    Fixed(BoundQuery),
    /// `select * from f(...)`; each call appends its expected column list
    RecordCall(BoundQuery),
}

impl RemoteQuery {
    /// Argument position for each placeholder
    pub fn arg_indexes(&self) -> &[usize] {
        match self {
            RemoteQuery::Fixed(q) | RemoteQuery::RecordCall(q) => q.arg_indexes(),
        }
    }
}

/// One declared argument
#[derive(Debug, Clone)]
pub struct ArgumentSlot {
    /// Declared name, if any
    pub name: Option<String>,
    /// Resolved codec
    pub ty: Arc<CachedType>,
}

/// A compiled routed function
#[derive(Debug)]
pub struct RoutingDescriptor {
    function_id: FunctionId,
    name: String,
    cluster: String,
    run_on: RunOn,
    remote: RemoteQuery,
    args: Vec<ArgumentSlot>,
    arg_types: Vec<Arc<CachedType>>,
    return_type: Arc<CachedType>,
    return_typmod: i32,
    returns_set: bool,
    binary: bool,
    untyped_record: bool,
    stamp: Stamp,
}

impl RoutingDescriptor {
    /// Function id
    pub fn function_id(&self) -> FunctionId {
        self.function_id
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target cluster name
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Node selection rule
    pub fn run_on(&self) -> &RunOn {
        &self.run_on
    }

    /// Remote statement
    pub fn remote_query(&self) -> &RemoteQuery {
        &self.remote
    }

    /// Declared arguments
    pub fn args(&self) -> &[ArgumentSlot] {
        &self.args
    }

    /// Argument codecs, by position
    pub fn arg_types(&self) -> &[Arc<CachedType>] {
        &self.arg_types
    }

    /// Return codec (element type for sets)
    pub fn return_type(&self) -> &Arc<CachedType> {
        &self.return_type
    }

    /// Return type modifier
    pub fn return_typmod(&self) -> i32 {
        self.return_typmod
    }

    /// True for set-returning functions
    pub fn returns_set(&self) -> bool {
        self.returns_set
    }

    /// True when every argument and return codec supports binary transfer
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// True when the function returns an anonymous record
    pub fn is_untyped_record(&self) -> bool {
        self.untyped_record
    }

    /// Definition version this was compiled from
    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Wire format for one call. Anonymous records also need every column
    /// codec to support binary.
    pub fn wire_format(&self, fields: Option<&[RecordField]>) -> WireFormat {
        let columns_binary = fields.map_or(true, |f| f.iter().all(|c| c.ty.supports_binary()));
        if self.binary && columns_binary {
            WireFormat::Binary
        } else {
            WireFormat::Text
        }
    }

    /// Statement text for one call.
    ///
    /// # Errors
    ///
    /// `UnsupportedContext` when a derived record call has no column list.
    pub fn remote_sql(&self, fields: Option<&[RecordField]>) -> ProxyResult<String> {
        match &self.remote {
            RemoteQuery::Fixed(q) => Ok(q.sql().to_string()),
            RemoteQuery::RecordCall(q) => {
                let fields = fields.ok_or_else(|| {
                    ProxyError::UnsupportedContext(format!(
                        "function '{}' returns record and needs a column definition list",
                        self.name
                    ))
                })?;
                Ok(with_column_list(q.sql(), fields))
            }
        }
    }

    /// True when the definition or any referenced type changed since compile
    pub fn is_stale(
        &self,
        store: &dyn DefinitionStore,
        types: &dyn TypeProvider,
    ) -> ProxyResult<bool> {
        let current = store.function_stamp(self.function_id)?;
        if current.map_or(true, |s| !self.stamp.matches(&s)) {
            return Ok(true);
        }
        for ty in self.arg_types.iter().chain(std::iter::once(&self.return_type)) {
            if !TypeCodecCache::is_fresh(ty, types)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Drop for RoutingDescriptor {
    fn drop(&mut self) {
        debug!(
            target: "shardcall::function",
            function = %self.name,
            stamp = %self.stamp,
            "Routing descriptor destroyed"
        );
    }
}

/// Everything compilation reads
pub struct CompileEnv<'a> {
    /// Cluster cache
    pub clusters: &'a Mutex<ClusterRegistry>,
    /// Type codec cache
    pub types: &'a Mutex<TypeCodecCache>,
    /// Function definitions
    pub store: &'a dyn DefinitionStore,
    /// Cluster definitions
    pub catalog: &'a dyn ClusterCatalog,
    /// Type definitions
    pub type_provider: &'a dyn TypeProvider,
    /// Size limits
    pub limits: &'a Limits,
}

impl CompileEnv<'_> {
    fn cluster(&self, name: &str) -> ProxyResult<Arc<Cluster>> {
        self.clusters.lock().get(name, self.catalog)
    }

    fn codec(&self, id: TypeId) -> ProxyResult<Arc<CachedType>> {
        self.types.lock().get(id, self.type_provider)
    }
}

/// Compile a definition.
///
/// The result is not cached; callers that only validate drop it.
pub fn compile(def: &FunctionDefinition, env: &CompileEnv<'_>) -> ProxyResult<RoutingDescriptor> {
    let invalid =
        |reason: String| ProxyError::invalid(DefinitionKind::Function, &def.name, reason);

    env.limits
        .check_args(def.arg_types.len())
        .map_err(|e| invalid(e.to_string()))?;
    if def.arg_names.len() != def.arg_types.len() {
        return Err(invalid(format!(
            "{} argument names for {} argument types",
            def.arg_names.len(),
            def.arg_types.len()
        )));
    }

    let cluster = env.cluster(&def.rule.cluster)?;

    let arg_types = def
        .arg_types
        .iter()
        .map(|&id| env.codec(id))
        .collect::<ProxyResult<Vec<_>>>()?;
    let return_type = env.codec(def.return_type)?;

    let run_on = match &def.rule.run_on {
        RunOnRule::Hash(text) => RunOn::Hash(BoundQuery::bind(text, def)?),
        RunOnRule::Node(n) => RunOn::Node(cluster.check_node(*n)?),
        RunOnRule::ArgNode(reference) => {
            let index = resolve_argument(def, reference)?;
            if arg_types[index].category() != TypeCategory::Integer {
                return Err(invalid(format!(
                    "node argument '{}' must be an integer, not {}",
                    reference,
                    arg_types[index].name()
                )));
            }
            RunOn::ArgNode(index)
        }
        RunOnRule::Any => RunOn::Any,
        RunOnRule::Unrecognized(mode) => {
            return Err(ProxyError::unroutable(
                &def.name,
                format!("unrecognized run-on mode '{}'", mode),
            ))
        }
    };

    let untyped_record = return_type.category() == TypeCategory::UntypedRecord;
    let remote = match &def.rule.query {
        Some(text) => RemoteQuery::Fixed(BoundQuery::bind(text, def)?),
        None => {
            let all_args = (0..arg_types.len()).collect();
            if untyped_record {
                RemoteQuery::RecordCall(BoundQuery::new(
                    derive_record_call_sql(&def.name, &arg_types),
                    all_args,
                ))
            } else {
                RemoteQuery::Fixed(BoundQuery::new(
                    derive_call_sql(&def.name, &arg_types),
                    all_args,
                ))
            }
        }
    };

    let binary = arg_types.iter().all(|t| t.supports_binary()) && return_type.supports_binary();

    let args = def
        .arg_names
        .iter()
        .zip(&arg_types)
        .map(|(name, ty)| ArgumentSlot {
            name: name.clone(),
            ty: Arc::clone(ty),
        })
        .collect();

    debug!(
        target: "shardcall::function",
        function = %def.name,
        cluster = %def.rule.cluster,
        mode = run_on.mode(),
        binary,
        "Compiled routing function"
    );

    Ok(RoutingDescriptor {
        function_id: def.id,
        name: def.name.clone(),
        cluster: def.rule.cluster.clone(),
        run_on,
        remote,
        args,
        arg_types,
        return_type,
        return_typmod: def.return_typmod,
        returns_set: def.returns_set,
        binary,
        untyped_record,
        stamp: def.stamp,
    })
}

/// Cache of compiled descriptors by function id
#[derive(Default)]
pub struct FunctionCache {
    entries: HashMap<FunctionId, Arc<RoutingDescriptor>>,
}

impl FunctionCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached descriptor, stale or not
    pub fn lookup(&self, id: FunctionId) -> Option<Arc<RoutingDescriptor>> {
        self.entries.get(&id).cloned()
    }

    /// Insert, returning the entry it replaces
    pub fn insert(&mut self, descriptor: Arc<RoutingDescriptor>) -> Option<Arc<RoutingDescriptor>> {
        self.entries.insert(descriptor.function_id(), descriptor)
    }

    /// Release a descriptor, removing it from the cache first when `purge`
    /// is set and the cached entry is this same descriptor.
    ///
    /// Memory is freed once no call still holds it.
    pub fn destroy(&mut self, descriptor: Arc<RoutingDescriptor>, purge: bool) {
        if purge {
            let cached = self.entries.get(&descriptor.function_id());
            if cached.map_or(false, |c| Arc::ptr_eq(c, &descriptor)) {
                self.entries.remove(&descriptor.function_id());
            }
        }
        drop(descriptor);
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached descriptors
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Return a fresh descriptor for `id`, compiling it if absent or stale.
///
/// # Errors
///
/// `DefinitionNotFound` if the store has no such function, or any compile
/// error.
pub fn get_or_compile(
    cache: &Mutex<FunctionCache>,
    id: FunctionId,
    env: &CompileEnv<'_>,
) -> ProxyResult<Arc<RoutingDescriptor>> {
    let cached = cache.lock().lookup(id);
    if let Some(descriptor) = cached {
        if !descriptor.is_stale(env.store, env.type_provider)? {
            return Ok(descriptor);
        }
        debug!(
            target: "shardcall::function",
            function = %descriptor.name(),
            "Definition changed, recompiling"
        );
    }

    let def = env
        .store
        .load_function(id)?
        .ok_or_else(|| ProxyError::not_found(DefinitionKind::Function, id.to_string()))?;
    let descriptor = Arc::new(compile(&def, env)?);

    // A nested call may have compiled the same function meanwhile; last writer wins.
    let replaced = cache.lock().insert(Arc::clone(&descriptor));
    drop(replaced);
    Ok(descriptor)
}
