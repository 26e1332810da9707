//! Routing engine for shardcall
//!
//! This crate turns a call of a routed function into a call on one node of
//! a sharded cluster:
//! - Cluster registry: catalog definitions parsed into node lists
//! - Type codec cache: argument and result conversion
//! - Function compiler: routing descriptors, invalidated by definition stamps
//! - Node selector: hash, fixed node, argument node or any node
//! - Connection pool: one connection per node address, aged out
//! - Remote dispatcher: transaction forwarding and cancellable waits
//! - Result delivery: single values and resumable row streams
//!
//! [`ProxyRuntime`] owns all of the above and exposes the entry points a
//! host calls.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod function;
pub mod pool;
pub mod query;
pub mod result;
pub mod runtime;
pub mod selector;
pub mod testing;
pub mod transaction;

pub use cluster::{Cluster, ClusterDefaults, ClusterRegistry, IsolationLevel};
pub use codec::{CachedType, RecordField, TypeCodecCache};
pub use config::{ProxyConfig, CONFIG_FILE_NAME};
pub use dispatch::{RemoteCall, RemoteDispatcher};
pub use function::{FunctionCache, RemoteQuery, RoutingDescriptor, RunOn};
pub use pool::{Connection, ConnectionPool, Connector};
pub use result::{DeliveryState, PendingResult, ResultCache, RowStream};
pub use runtime::{CallOutput, Collaborators, ConnectionState, ProxyRuntime, RuntimeStats};
pub use selector::select_node;
