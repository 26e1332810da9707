//! Remote dispatch
//!
//! Runs one routed call on a pooled connection:
//!
//! 1. bring the remote transaction depth in line with the caller's nesting
//! 2. marshal arguments through their codecs
//! 3. send the statement and wait for the result
//!
//! Waiting happens on a current-thread tokio runtime owned by the
//! dispatcher. The transport future is raced against the call's
//! cancellation token, so a cancelled call stops waiting immediately; the
//! dispatcher then asks the node to cancel and rolls the connection back to
//! its pre-call level, or marks it broken so the pool discards it.
//!
//! Entry points block the calling thread and must not be called from inside
//! an async runtime.

use crate::cluster::Cluster;
use crate::function::RoutingDescriptor;
use crate::pool::{Connection, Connector};
use crate::transaction::{
    end_subtransaction_steps, end_transaction_steps, error_cleanup_steps, sync_steps, TxnStep,
};
use shardcall_core::{
    CancellationToken, ProxyError, ProxyResult, RawResult, RemoteSession, RemoteTransport,
    TransportError, Value, WireFormat, WireParam,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Outcome of a cancellable wait
enum Wait<T> {
    Done(T),
    Cancelled,
}

/// One remote statement for one call
pub struct RemoteCall<'a> {
    /// Function being called
    pub function: &'a str,
    /// Target cluster
    pub cluster: &'a Cluster,
    /// Target node
    pub node: usize,
    /// Statement text
    pub sql: &'a str,
    /// Marshaled arguments
    pub params: Vec<WireParam>,
    /// Argument and result format
    pub format: WireFormat,
    /// Caller's transaction nesting level
    pub nest_level: usize,
    /// Interrupts the wait
    pub cancel: &'a CancellationToken,
}

impl RemoteCall<'_> {
    fn remote_error(&self, message: impl Into<String>) -> ProxyError {
        ProxyError::RemoteQueryError {
            function: self.function.to_string(),
            cluster: self.cluster.name().to_string(),
            node: self.node,
            message: message.into(),
        }
    }

    fn cancelled(&self) -> ProxyError {
        ProxyError::Cancelled {
            function: self.function.to_string(),
            cluster: self.cluster.name().to_string(),
            node: self.node,
        }
    }
}

/// Encode the remote query's arguments.
///
/// # Errors
///
/// `ParseError` if a codec rejects a value.
pub fn marshal_args(
    descriptor: &RoutingDescriptor,
    args: &[Value],
    format: WireFormat,
) -> ProxyResult<Vec<WireParam>> {
    descriptor
        .remote_query()
        .arg_indexes()
        .iter()
        .map(|&i| {
            let ty = &descriptor.arg_types()[i];
            let value = match args.get(i) {
                Some(value) => ty.encode(value, format)?,
                None => None,
            };
            Ok(WireParam {
                type_id: ty.id(),
                value,
            })
        })
        .collect()
}

/// Sends statements to remote nodes and waits for them
pub struct RemoteDispatcher {
    runtime: Runtime,
    transport: Arc<dyn RemoteTransport>,
    cancel_timeout: Duration,
}

impl RemoteDispatcher {
    /// Start the dispatch event loop.
    ///
    /// `cancel_timeout` bounds every wait that cannot itself be cancelled:
    /// cancel acknowledgements, cleanup statements and session close.
    pub fn new(transport: Arc<dyn RemoteTransport>, cancel_timeout: Duration) -> ProxyResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                ProxyError::UnsupportedContext(format!("cannot start dispatch event loop: {}", e))
            })?;
        Ok(RemoteDispatcher {
            runtime,
            transport,
            cancel_timeout,
        })
    }

    /// Run `call` on `conn` and return the raw result.
    ///
    /// On return the connection is either at the caller's nesting level,
    /// rolled back to its pre-call level, or marked broken.
    ///
    /// # Errors
    ///
    /// - `RemoteQueryError` with the node's error text
    /// - `Cancelled` if the call's token fired while waiting
    pub fn execute(&self, conn: &mut Connection, call: &RemoteCall<'_>) -> ProxyResult<RawResult> {
        if call.cancel.is_cancelled() {
            return Err(call.cancelled());
        }

        let conn_id = conn.id();
        for step in sync_steps(call.cluster.isolation_level(), conn.depth(), call.nest_level) {
            debug!(target: "shardcall::txn", conn_id, sql = %step.sql, "Forwarding transaction state");
            let session = live_session(conn).map_err(|e| call.remote_error(e.to_string()))?;
            match self.wait(call.cancel, session.execute(&step.sql, &[], WireFormat::Text)) {
                Wait::Done(Ok(_)) => conn.set_depth(step.depth),
                Wait::Done(Err(e)) => {
                    conn.mark_broken();
                    return Err(call.remote_error(e.to_string()));
                }
                Wait::Cancelled => {
                    self.abort_statement(conn);
                    conn.mark_broken();
                    return Err(call.cancelled());
                }
            }
        }

        debug!(
            target: "shardcall::dispatch",
            function = call.function,
            cluster = %call.cluster.name(),
            node = call.node,
            conn_id,
            params = call.params.len(),
            "Sending remote query"
        );
        let session = live_session(conn).map_err(|e| call.remote_error(e.to_string()))?;
        match self.wait(call.cancel, session.execute(call.sql, &call.params, call.format)) {
            Wait::Done(Ok(raw)) => Ok(raw),
            Wait::Done(Err(e)) => {
                if e.is_connection_lost() {
                    conn.mark_broken();
                } else {
                    self.rollback_level(conn);
                }
                warn!(
                    target: "shardcall::dispatch",
                    function = call.function,
                    cluster = %call.cluster.name(),
                    node = call.node,
                    error = %e,
                    "Remote query failed"
                );
                Err(call.remote_error(e.to_string()))
            }
            Wait::Cancelled => {
                debug!(
                    target: "shardcall::dispatch",
                    function = call.function,
                    conn_id,
                    "Call cancelled while waiting"
                );
                if self.abort_statement(conn) {
                    self.rollback_level(conn);
                } else {
                    conn.mark_broken();
                }
                Err(call.cancelled())
            }
        }
    }

    /// Commit or roll back the remote transaction on `conn`.
    ///
    /// # Errors
    ///
    /// The node's error text; the connection is marked broken.
    pub fn end_transaction(&self, conn: &mut Connection, commit: bool) -> Result<(), String> {
        let steps = end_transaction_steps(conn.depth(), commit);
        self.run_steps(conn, steps)
    }

    /// Release or roll back the savepoint for nesting `level` on `conn`.
    ///
    /// # Errors
    ///
    /// The node's error text; the connection is marked broken.
    pub fn end_subtransaction(
        &self,
        conn: &mut Connection,
        level: usize,
        commit: bool,
    ) -> Result<(), String> {
        let steps = end_subtransaction_steps(conn.depth(), level, commit);
        self.run_steps(conn, steps)
    }

    /// Undo the innermost level after a failed statement; a failed cleanup
    /// marks the connection broken.
    fn rollback_level(&self, conn: &mut Connection) {
        let steps = error_cleanup_steps(conn.depth());
        if let Err(e) = self.run_steps(conn, steps) {
            warn!(target: "shardcall::txn", conn_id = conn.id(), error = %e, "Rollback after remote error failed");
        }
    }

    fn run_steps(&self, conn: &mut Connection, steps: Vec<TxnStep>) -> Result<(), String> {
        let conn_id = conn.id();
        for step in steps {
            debug!(target: "shardcall::txn", conn_id, sql = %step.sql, "Running transaction statement");
            let result = match live_session(conn) {
                Ok(session) => self.bounded(session.execute(&step.sql, &[], WireFormat::Text)),
                Err(e) => Some(Err(e)),
            };
            match result {
                Some(Ok(_)) => conn.set_depth(step.depth),
                Some(Err(e)) => {
                    conn.mark_broken();
                    return Err(e.to_string());
                }
                None => {
                    conn.mark_broken();
                    return Err(format!("'{}' timed out", step.sql));
                }
            }
        }
        Ok(())
    }

    /// Ask the node to abandon the statement in flight. Returns false if
    /// the node did not acknowledge within the cancel timeout.
    fn abort_statement(&self, conn: &mut Connection) -> bool {
        let conn_id = conn.id();
        let acknowledged = match live_session(conn) {
            Ok(session) => matches!(self.bounded(session.cancel()), Some(Ok(()))),
            Err(_) => false,
        };
        if !acknowledged {
            warn!(target: "shardcall::dispatch", conn_id, "Node did not acknowledge cancel");
        }
        acknowledged
    }

    fn wait<F: Future>(&self, cancel: &CancellationToken, fut: F) -> Wait<F::Output> {
        self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Wait::Cancelled,
                out = fut => Wait::Done(out),
            }
        })
    }

    fn bounded<F: Future>(&self, fut: F) -> Option<F::Output> {
        // The timer must be created inside the runtime.
        self.runtime
            .block_on(async { tokio::time::timeout(self.cancel_timeout, fut).await })
            .ok()
    }
}

impl Connector for RemoteDispatcher {
    fn connect(&self, address: &str) -> Result<Box<dyn RemoteSession>, TransportError> {
        self.runtime.block_on(self.transport.connect(address))
    }

    fn disconnect(&self, mut session: Box<dyn RemoteSession>) {
        if self.bounded(session.close()).is_none() {
            warn!(target: "shardcall::pool", "Session close timed out");
        }
    }
}

fn live_session(conn: &mut Connection) -> Result<&mut (dyn RemoteSession + 'static), TransportError> {
    conn.session_mut()
        .ok_or_else(|| TransportError::ConnectionLost("connection is closed".to_string()))
}
