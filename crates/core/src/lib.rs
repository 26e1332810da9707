//! Core types and traits for shardcall
//!
//! This crate defines the foundational types shared by the routing engine:
//! - Error: `ProxyError`, `TransportError`, `CodecError`
//! - Stamp: staleness token for externally stored definitions
//! - Identity types: FunctionId, TypeId, CallId
//! - Value: host-side values; wire types for the transport edge
//! - Definitions: what the store, catalog and type provider hand back
//! - Traits: every external collaborator the engine consumes
//! - Limits: documented maximums enforced at load time

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod definition;
pub mod error;
pub mod limits;
pub mod stamp;
pub mod traits;
pub mod types;
pub mod value;
pub mod wire;

pub use definition::{
    ClusterDefinition, FunctionDefinition, LocalParam, QueryText, RecordColumn, RoutingRule,
    RunOnRule, TypeCategory, TypeDefinition,
};
pub use error::{CodecError, DefinitionKind, ErrorKind, ProxyError, ProxyResult, TransportError};
pub use limits::{LimitError, Limits};
pub use stamp::Stamp;
pub use traits::{
    CallContext, Clock, ClusterCatalog, DefinitionStore, LocalExecutor, RemoteSession,
    RemoteTransport, SystemClock, TypeCodec, TypeProvider,
};
pub use types::{CallId, CallKind, FunctionId, TypeId};
pub use value::Value;
pub use wire::{ColumnDesc, RawResult, WireFormat, WireParam, WireRow, WireValue};

// The cancellation token type appears in `CallContext`; re-export it so hosts
// do not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
