//! Host-side stand-ins: local executor, call context, clock

use parking_lot::Mutex;
use shardcall_core::{
    CallContext, CallId, CallKind, CancellationToken, Clock, FunctionId, LocalExecutor, LocalParam,
    ProxyResult, RecordColumn, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type QueryFn = dyn Fn(&str, &[LocalParam]) -> ProxyResult<Vec<Vec<Value>>> + Send + Sync;

/// [`LocalExecutor`] backed by a closure
pub struct FnExecutor {
    query: Box<QueryFn>,
    calls: AtomicUsize,
}

impl FnExecutor {
    /// Run every local statement through `query`
    pub fn new<F>(query: F) -> Self
    where
        F: Fn(&str, &[LocalParam]) -> ProxyResult<Vec<Vec<Value>>> + Send + Sync + 'static,
    {
        FnExecutor {
            query: Box::new(query),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of statements run
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LocalExecutor for FnExecutor {
    fn query(&self, sql: &str, params: &[LocalParam]) -> ProxyResult<Vec<Vec<Value>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.query)(sql, params)
    }
}

/// [`CallContext`] built field by field
#[derive(Debug, Clone)]
pub struct TestCall {
    function_id: FunctionId,
    call_id: CallId,
    kind: CallKind,
    args: Vec<Value>,
    returns_set: bool,
    first_call: bool,
    record_columns: Option<Vec<RecordColumn>>,
    nest_level: usize,
    cancel: CancellationToken,
}

impl TestCall {
    /// Single-valued, top-level call with no arguments
    pub fn new(function_id: FunctionId) -> Self {
        TestCall {
            function_id,
            call_id: CallId(1),
            kind: CallKind::Function,
            args: Vec::new(),
            returns_set: false,
            first_call: true,
            record_columns: None,
            nest_level: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the arguments
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set the call id
    pub fn with_call_id(mut self, id: u64) -> Self {
        self.call_id = CallId(id);
        self
    }

    /// Invoke as a trigger
    pub fn as_trigger(mut self) -> Self {
        self.kind = CallKind::Trigger;
        self
    }

    /// Mark as set-returning
    pub fn set_returning(mut self) -> Self {
        self.returns_set = true;
        self
    }

    /// Expected anonymous-record columns
    pub fn with_record_columns(mut self, columns: Vec<RecordColumn>) -> Self {
        self.record_columns = Some(columns);
        self
    }

    /// Caller's transaction nesting level
    pub fn with_nest_level(mut self, level: usize) -> Self {
        self.nest_level = level;
        self
    }

    /// Token that cancels this call
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next resumption of a set-returning call
    pub fn resumed(&self) -> Self {
        TestCall {
            first_call: false,
            ..self.clone()
        }
    }
}

impl CallContext for TestCall {
    fn function_id(&self) -> FunctionId {
        self.function_id
    }

    fn call_id(&self) -> CallId {
        self.call_id
    }

    fn kind(&self) -> CallKind {
        self.kind
    }

    fn args(&self) -> &[Value] {
        &self.args
    }

    fn returns_set(&self) -> bool {
        self.returns_set
    }

    fn is_first_call(&self) -> bool {
        self.first_call
    }

    fn record_columns(&self) -> Option<&[RecordColumn]> {
        self.record_columns.as_deref()
    }

    fn transaction_nest_level(&self) -> usize {
        self.nest_level
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// [`Clock`] that only moves when told to
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Clock frozen at the current instant
    pub fn new() -> Self {
        ManualClock {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}
