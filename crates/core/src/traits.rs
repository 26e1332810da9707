//! Trait definitions for the collaborators the core consumes
//!
//! The core never talks to a concrete engine, catalog or network stack. Every
//! external capability is one of these traits:
//!
//! - [`DefinitionStore`]: routed function definitions
//! - [`ClusterCatalog`]: cluster membership and connection policy
//! - [`TypeProvider`] / [`TypeCodec`]: per-type marshaling
//! - [`RemoteTransport`] / [`RemoteSession`]: one SQL round trip to a node
//! - [`LocalExecutor`]: statements against the invoking engine itself
//! - [`CallContext`]: the host's calling convention for one call
//! - [`Clock`]: time source for connection aging
//!
//! Store-like traits return `Ok(None)` for a missing definition; the core turns
//! that into `DefinitionNotFound` with the right context.

use crate::definition::{
    ClusterDefinition, FunctionDefinition, LocalParam, RecordColumn, TypeDefinition,
};
use crate::error::{CodecError, ProxyResult, TransportError};
use crate::stamp::Stamp;
use crate::types::{CallId, CallKind, FunctionId, TypeId};
use crate::value::Value;
use crate::wire::{RawResult, WireFormat, WireParam, WireValue};
use async_trait::async_trait;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Marshal/unmarshal handle for one type
pub trait TypeCodec: Send + Sync {
    /// Whether binary send/receive is available
    fn supports_binary(&self) -> bool;

    /// Binary encoding of a non-null value
    fn encode_binary(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Text encoding of a non-null value
    fn encode_text(&self, value: &Value) -> Result<String, CodecError>;

    /// Decode a binary field
    fn decode_binary(&self, bytes: &[u8], io_param: u32, typmod: i32) -> Result<Value, CodecError>;

    /// Decode a text field
    fn decode_text(&self, text: &str, io_param: u32, typmod: i32) -> Result<Value, CodecError>;

    /// Encode in the requested format
    fn encode(&self, value: &Value, format: WireFormat) -> Result<WireValue, CodecError> {
        match format {
            WireFormat::Binary => self.encode_binary(value).map(WireValue::Binary),
            WireFormat::Text => self.encode_text(value).map(WireValue::Text),
        }
    }

    /// Decode a field in whatever format it arrived in
    fn decode(&self, field: &WireValue, io_param: u32, typmod: i32) -> Result<Value, CodecError> {
        match field {
            WireValue::Binary(bytes) => self.decode_binary(bytes, io_param, typmod),
            WireValue::Text(text) => self.decode_text(text, io_param, typmod),
        }
    }
}

/// Source of type codecs
pub trait TypeProvider: Send + Sync {
    /// Load a type and its codec
    fn load_type(&self, id: TypeId) -> ProxyResult<Option<TypeDefinition>>;

    /// Current stamp of a type, without loading its codec
    fn type_stamp(&self, id: TypeId) -> ProxyResult<Option<Stamp>>;
}

/// Source of routed function definitions
pub trait DefinitionStore: Send + Sync {
    /// Load a function with its parsed body
    fn load_function(&self, id: FunctionId) -> ProxyResult<Option<FunctionDefinition>>;

    /// Current stamp of a function, without loading it
    fn function_stamp(&self, id: FunctionId) -> ProxyResult<Option<Stamp>>;
}

/// Source of cluster definitions
pub trait ClusterCatalog: Send + Sync {
    /// Load a cluster by name
    fn load_cluster(&self, name: &str) -> ProxyResult<Option<ClusterDefinition>>;

    /// Current stamp of a cluster, without loading it
    fn cluster_stamp(&self, name: &str) -> ProxyResult<Option<Stamp>>;
}

/// Runs statements on the invoking engine itself
///
/// Implementations may re-enter the runtime (a statement may call another
/// routed function); the core holds no cache lock while calling this.
pub trait LocalExecutor: Send + Sync {
    /// Run `sql` with bound parameters and return all rows
    fn query(&self, sql: &str, params: &[LocalParam]) -> ProxyResult<Vec<Vec<Value>>>;
}

/// Opens sessions to remote nodes
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Connect to a node address
    async fn connect(&self, address: &str) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// One live session to one remote node
///
/// Futures returned by these methods must make progress only when awaited and
/// must be safe to drop mid-flight; the dispatcher drops an `execute` future
/// when the call is cancelled and then calls [`RemoteSession::cancel`].
#[async_trait]
pub trait RemoteSession: Send {
    /// Send a statement with its parameters and wait for the complete result
    async fn execute(
        &mut self,
        sql: &str,
        params: &[WireParam],
        result_format: WireFormat,
    ) -> Result<RawResult, TransportError>;

    /// Ask the node to abort the statement in flight and wait until the
    /// session is idle again
    async fn cancel(&mut self) -> Result<(), TransportError>;

    /// Close the session
    async fn close(&mut self);
}

/// The host's view of one call
pub trait CallContext {
    /// Function being called
    fn function_id(&self) -> FunctionId;

    /// Identity of this call activation
    fn call_id(&self) -> CallId;

    /// How the host invoked us
    fn kind(&self) -> CallKind {
        CallKind::Function
    }

    /// Argument values, in declaration order
    fn args(&self) -> &[Value];

    /// Argument value at `index`
    fn argument(&self, index: usize) -> Option<&Value> {
        self.args().get(index)
    }

    /// True when the function returns a set of rows
    fn returns_set(&self) -> bool {
        false
    }

    /// For set-returning calls: true on the first resumption only
    fn is_first_call(&self) -> bool {
        true
    }

    /// Record shape the caller expects, for functions returning anonymous records
    fn record_columns(&self) -> Option<&[RecordColumn]> {
        None
    }

    /// Caller's transaction nesting level: 1 in a top-level transaction,
    /// one more per open subtransaction
    fn transaction_nest_level(&self) -> usize {
        1
    }

    /// Token the host cancels to interrupt the call
    fn cancellation(&self) -> CancellationToken;
}

/// Time source for connection aging
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by `Instant::now`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
