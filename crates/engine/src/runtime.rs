//! Process-scoped runtime and entry points
//!
//! `ProxyRuntime` owns every cache and the dispatch event loop. Hosts create
//! one per process and call [`ProxyRuntime::call_handler`] for each
//! invocation of a routed function.
//!
//! # Call pipeline
//!
//! ```text
//! call_handler
//!   ├─ get_or_compile        function cache (recompile when stale)
//!   ├─ select_node           cluster registry, local hash query
//!   ├─ pool.acquire          one connection per node address
//!   ├─ dispatcher.execute    transaction forwarding, cancellable wait
//!   └─ deliver               single value, or first row of a stream
//! ```
//!
//! # Locking
//!
//! Each cache has its own mutex and no lock is held while compiling, while
//! the local executor runs, or while waiting on a node. A hash query may
//! therefore call other routed functions on the same runtime.

use crate::cluster::{ClusterDefaults, ClusterRegistry};
use crate::codec::{RecordField, TypeCodecCache};
use crate::config::ProxyConfig;
use crate::dispatch::{marshal_args, RemoteCall, RemoteDispatcher};
use crate::function::{compile, get_or_compile, CompileEnv, FunctionCache, RoutingDescriptor};
use crate::pool::{Connection, ConnectionPool, SharedConnection};
use crate::result::{PendingResult, ResultCache, ResultOrigin, RowDecoder};
use crate::selector::select_node;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use shardcall_core::{
    CallContext, CallId, CallKind, Clock, ClusterCatalog, DefinitionKind, DefinitionStore,
    FunctionId, LocalExecutor, ProxyError, ProxyResult, RemoteTransport, SystemClock,
    TypeProvider, Value,
};
use std::sync::Arc;
use tracing::{info, warn};

/// External collaborators a runtime calls into
#[derive(Clone)]
pub struct Collaborators {
    /// Routed function definitions
    pub store: Arc<dyn DefinitionStore>,
    /// Cluster definitions
    pub catalog: Arc<dyn ClusterCatalog>,
    /// Type codecs
    pub types: Arc<dyn TypeProvider>,
    /// Remote connections
    pub transport: Arc<dyn RemoteTransport>,
    /// Statements on the invoking engine
    pub local: Arc<dyn LocalExecutor>,
}

/// What one invocation of `call_handler` produced
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    /// Result of a single-valued call
    Value(Value),
    /// Next row of a set-returning call
    Row(Value),
    /// A set-returning call has no more rows
    EndOfSequence,
}

/// Cache sizes, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    /// Cached clusters
    pub clusters: usize,
    /// Pooled connections
    pub connections: usize,
    /// Cached routing descriptors
    pub functions: usize,
    /// Cached type codecs
    pub types: usize,
    /// Set-returning calls still streaming
    pub streams: usize,
}

/// Snapshot of one pooled connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Cluster name
    pub cluster: String,
    /// Node index
    pub node: usize,
    /// Pool connection id
    pub id: u64,
    /// Remote transaction depth
    pub depth: usize,
}

/// Remote transaction that went away with its discarded connection
#[derive(Debug, Clone)]
struct LostTransaction {
    function: String,
    cluster: String,
    node: usize,
}

impl LostTransaction {
    fn into_error(self) -> ProxyError {
        ProxyError::RemoteQueryError {
            function: self.function,
            cluster: self.cluster,
            node: self.node,
            message: "remote transaction was lost when its connection was discarded; \
                      the transaction was rolled back"
                .to_string(),
        }
    }
}

/// Caches and event loop, created once by `startup`
struct Caches {
    clusters: Mutex<ClusterRegistry>,
    pool: Mutex<ConnectionPool>,
    functions: Mutex<FunctionCache>,
    types: Mutex<TypeCodecCache>,
    results: Mutex<ResultCache>,
    dispatcher: RemoteDispatcher,
    lost: Mutex<Vec<LostTransaction>>,
}

impl Caches {
    /// Discard a broken connection. Remote work it carried from earlier
    /// calls is gone, so the caller's next commit must fail.
    fn discard(&self, conn: &SharedConnection, depth_before: usize) {
        self.pool.lock().discard(conn, &self.dispatcher);
        if depth_before == 0 {
            return;
        }
        let guard = conn.lock();
        let lost = LostTransaction {
            function: guard.last_function().to_string(),
            cluster: guard.cluster().to_string(),
            node: guard.node(),
        };
        warn!(
            target: "shardcall::txn",
            function = %lost.function,
            cluster = %lost.cluster,
            node = lost.node,
            depth = depth_before,
            "Open remote transaction lost with its connection"
        );
        self.lost.lock().push(lost);
    }
}

/// The routing runtime
pub struct ProxyRuntime {
    config: ProxyConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    state: OnceCell<Caches>,
}

impl ProxyRuntime {
    /// Create a runtime; caches are built on `startup` or the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub fn new(config: ProxyConfig, collaborators: Collaborators) -> ProxyResult<Self> {
        config.validate()?;
        Ok(ProxyRuntime {
            config,
            collaborators,
            clock: Arc::new(SystemClock),
            state: OnceCell::new(),
        })
    }

    /// Use `clock` for connection aging
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configuration in effect
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Build the caches and start the dispatch event loop. Later calls are
    /// no-ops.
    pub fn startup(&self) -> ProxyResult<()> {
        self.caches().map(|_| ())
    }

    /// True once `startup` has run
    pub fn is_started(&self) -> bool {
        self.state.get().is_some()
    }

    fn caches(&self) -> ProxyResult<&Caches> {
        self.state.get_or_try_init(|| {
            let limits = self.config.limits.clone();
            let defaults = ClusterDefaults {
                isolation_level: self.config.isolation_level()?,
                connection_lifetime: self.config.default_connection_lifetime(),
            };
            let clusters = Mutex::new(ClusterRegistry::new(limits.clone(), defaults));
            let pool = Mutex::new(ConnectionPool::new(limits.max_connections));
            let functions = Mutex::new(FunctionCache::new());
            let types = Mutex::new(TypeCodecCache::new());
            let results = Mutex::new(ResultCache::new());
            let dispatcher = RemoteDispatcher::new(
                Arc::clone(&self.collaborators.transport),
                self.config.cancel_timeout(),
            )?;
            info!(
                target: "shardcall::dispatch",
                max_connections = limits.max_connections,
                "Routing runtime started"
            );
            Ok(Caches {
                clusters,
                pool,
                functions,
                types,
                results,
                dispatcher,
                lost: Mutex::new(Vec::new()),
            })
        })
    }

    fn compile_env<'a>(&'a self, caches: &'a Caches) -> CompileEnv<'a> {
        CompileEnv {
            clusters: &caches.clusters,
            types: &caches.types,
            store: self.collaborators.store.as_ref(),
            catalog: self.collaborators.catalog.as_ref(),
            type_provider: self.collaborators.types.as_ref(),
            limits: &self.config.limits,
        }
    }

    /// Handle one invocation of a routed function.
    ///
    /// Single-valued calls run the whole pipeline and return
    /// [`CallOutput::Value`]. Set-returning calls run it on the first
    /// invocation and then return one [`CallOutput::Row`] per invocation
    /// until [`CallOutput::EndOfSequence`], which repeats on any further
    /// invocation.
    ///
    /// # Errors
    ///
    /// `UnsupportedContext` for trigger-style calls; otherwise any error of
    /// the pipeline. A failed call leaves no stream behind.
    pub fn call_handler(&self, ctx: &dyn CallContext) -> ProxyResult<CallOutput> {
        if ctx.kind() == CallKind::Trigger {
            return Err(ProxyError::UnsupportedContext(
                "routed functions cannot be called as triggers".to_string(),
            ));
        }
        let caches = self.caches()?;

        if ctx.returns_set() && !ctx.is_first_call() {
            return resume(caches, ctx.call_id());
        }

        // A new first invocation replaces anything left under this id.
        caches.results.lock().abandon(ctx.call_id());

        let pending = self.run_remote(caches, ctx)?;
        if pending.returns_set() {
            caches
                .results
                .lock()
                .start(ctx.call_id(), pending.into_stream());
            resume(caches, ctx.call_id())
        } else {
            pending.into_single().map(CallOutput::Value)
        }
    }

    fn run_remote(&self, caches: &Caches, ctx: &dyn CallContext) -> ProxyResult<PendingResult> {
        let descriptor = get_or_compile(
            &caches.functions,
            ctx.function_id(),
            &self.compile_env(caches),
        )?;
        let cluster = caches
            .clusters
            .lock()
            .get(descriptor.cluster(), self.collaborators.catalog.as_ref())?;
        let node = select_node(
            &descriptor,
            &cluster,
            ctx.args(),
            self.collaborators.local.as_ref(),
        )?;

        let fields = self.record_fields(caches, &descriptor, ctx)?;
        let sql = descriptor.remote_sql(fields.as_deref())?;
        let format = descriptor.wire_format(fields.as_deref());
        let params = marshal_args(&descriptor, ctx.args(), format)?;

        let conn = caches.pool.lock().acquire(
            &cluster,
            node,
            descriptor.name(),
            self.clock.now(),
            &caches.dispatcher,
        )?;
        let cancel = ctx.cancellation();
        let call = RemoteCall {
            function: descriptor.name(),
            cluster: &cluster,
            node,
            sql: &sql,
            params,
            format,
            nest_level: ctx.transaction_nest_level(),
            cancel: &cancel,
        };
        let (raw, broken, depth_before) = {
            let mut guard = conn.lock();
            let depth_before = guard.depth();
            let raw = caches.dispatcher.execute(&mut guard, &call);
            (raw, guard.is_broken(), depth_before)
        };
        if broken {
            caches.discard(&conn, depth_before);
        }

        let decoder = RowDecoder::for_call(&descriptor, fields);
        let origin = ResultOrigin {
            cluster: cluster.name().to_string(),
            node,
        };
        Ok(PendingResult::new(descriptor, raw?, decoder, origin))
    }

    fn record_fields(
        &self,
        caches: &Caches,
        descriptor: &RoutingDescriptor,
        ctx: &dyn CallContext,
    ) -> ProxyResult<Option<Vec<RecordField>>> {
        if !descriptor.is_untyped_record() {
            return Ok(None);
        }
        let columns = ctx.record_columns().ok_or_else(|| {
            ProxyError::UnsupportedContext(format!(
                "function '{}' returns record and needs a column definition list",
                descriptor.name()
            ))
        })?;
        columns
            .iter()
            .map(|c| {
                let ty = caches
                    .types
                    .lock()
                    .get(c.type_id, self.collaborators.types.as_ref())?;
                Ok(RecordField {
                    name: c.name.clone(),
                    ty,
                })
            })
            .collect::<ProxyResult<Vec<_>>>()
            .map(Some)
    }

    /// Compile a function without caching it.
    ///
    /// # Errors
    ///
    /// `UnsupportedContext` for trigger-style invocations; otherwise any
    /// compile error.
    pub fn validate(&self, function_id: FunctionId, kind: CallKind) -> ProxyResult<()> {
        if kind == CallKind::Trigger {
            return Err(ProxyError::UnsupportedContext(
                "routed functions cannot be validated as triggers".to_string(),
            ));
        }
        let caches = self.caches()?;
        let def = self
            .collaborators
            .store
            .load_function(function_id)?
            .ok_or_else(|| ProxyError::not_found(DefinitionKind::Function, function_id.to_string()))?;
        let descriptor = compile(&def, &self.compile_env(caches))?;
        drop(descriptor);
        Ok(())
    }

    /// The caller's top-level transaction ended: commit or roll back every
    /// remote transaction opened on its behalf.
    ///
    /// Every connection is processed; the first failure is returned and
    /// failed connections are discarded. If a connection carrying part of
    /// the transaction was discarded earlier, a commit rolls back every
    /// remaining connection instead and fails with `RemoteQueryError`.
    pub fn end_transaction(&self, commit: bool) -> ProxyResult<()> {
        let caches = match self.state.get() {
            Some(caches) => caches,
            None => return Ok(()),
        };
        let lost = std::mem::take(&mut *caches.lost.lock());
        let remote_commit = commit && lost.is_empty();
        let result =
            self.finish_level(|dispatcher, conn| dispatcher.end_transaction(conn, remote_commit));
        // Failures while ending are reported through `result`.
        caches.lost.lock().clear();
        result?;
        match lost.into_iter().next() {
            Some(lost) if commit => Err(lost.into_error()),
            _ => Ok(()),
        }
    }

    /// The caller's subtransaction at nesting `level` ended.
    pub fn end_subtransaction(&self, level: usize, commit: bool) -> ProxyResult<()> {
        self.finish_level(|dispatcher, conn| dispatcher.end_subtransaction(conn, level, commit))
    }

    fn finish_level<F>(&self, step: F) -> ProxyResult<()>
    where
        F: Fn(&RemoteDispatcher, &mut Connection) -> Result<(), String>,
    {
        let caches = match self.state.get() {
            Some(caches) => caches,
            None => return Ok(()),
        };
        let connections = caches.pool.lock().connections();
        let mut first_error = None;
        for conn in connections {
            let (failure, depth_before) = {
                let mut guard = conn.lock();
                let depth_before = guard.depth();
                let failure = match step(&caches.dispatcher, &mut guard) {
                    Ok(()) => None,
                    Err(message) => Some(ProxyError::RemoteQueryError {
                        function: guard.last_function().to_string(),
                        cluster: guard.cluster().to_string(),
                        node: guard.node(),
                        message,
                    }),
                };
                (failure, depth_before)
            };
            if let Some(err) = failure {
                warn!(target: "shardcall::txn", error = %err, "Remote transaction end failed");
                caches.discard(&conn, depth_before);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The host ended a set-returning call early; drop its stream.
    pub fn abandon_call(&self, call: CallId) -> bool {
        self.state
            .get()
            .map_or(false, |caches| caches.results.lock().abandon(call))
    }

    /// Drop cached clusters, descriptors and codecs. Connections and
    /// in-progress streams are kept.
    pub fn clear_caches(&self) {
        if let Some(caches) = self.state.get() {
            caches.clusters.lock().clear();
            caches.functions.lock().clear();
            caches.types.lock().clear();
            info!(target: "shardcall::function", "Caches cleared");
        }
    }

    /// Drop clusters whose catalog entry changed; returns how many.
    pub fn evict_stale_clusters(&self) -> ProxyResult<usize> {
        match self.state.get() {
            Some(caches) => caches
                .clusters
                .lock()
                .evict_stale(self.collaborators.catalog.as_ref()),
            None => Ok(0),
        }
    }

    /// Close every pooled connection
    pub fn close_connections(&self) {
        if let Some(caches) = self.state.get() {
            caches.pool.lock().close_all(&caches.dispatcher);
        }
    }

    /// Cached descriptor for `id`, without checking staleness
    pub fn cached_descriptor(&self, id: FunctionId) -> Option<Arc<RoutingDescriptor>> {
        self.state
            .get()
            .and_then(|caches| caches.functions.lock().lookup(id))
    }

    /// Current cache sizes
    pub fn stats(&self) -> RuntimeStats {
        match self.state.get() {
            Some(caches) => RuntimeStats {
                clusters: caches.clusters.lock().len(),
                connections: caches.pool.lock().len(),
                functions: caches.functions.lock().len(),
                types: caches.types.lock().len(),
                streams: caches.results.lock().len(),
            },
            None => RuntimeStats::default(),
        }
    }

    /// Every pooled connection, ordered by cluster and node
    pub fn connection_states(&self) -> Vec<ConnectionState> {
        let caches = match self.state.get() {
            Some(caches) => caches,
            None => return Vec::new(),
        };
        let connections = caches.pool.lock().connections();
        let mut states: Vec<ConnectionState> = connections
            .iter()
            .map(|c| {
                let c = c.lock();
                ConnectionState {
                    cluster: c.cluster().to_string(),
                    node: c.node(),
                    id: c.id(),
                    depth: c.depth(),
                }
            })
            .collect();
        states.sort_by(|a, b| (&a.cluster, a.node).cmp(&(&b.cluster, b.node)));
        states
    }
}

fn resume(caches: &Caches, call: CallId) -> ProxyResult<CallOutput> {
    let stream = caches.results.lock().take(call);
    let mut stream = match stream {
        Some(stream) => stream,
        None => return Ok(CallOutput::EndOfSequence),
    };
    match stream.next_row()? {
        Some(row) => {
            // Kept even when exhausted; the next resumption ends the sequence.
            caches.results.lock().put_back(call, stream);
            Ok(CallOutput::Row(row))
        }
        None => Ok(CallOutput::EndOfSequence),
    }
}
