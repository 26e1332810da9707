//! In-memory collaborators for tests
//!
//! Everything the runtime consumes, backed by plain data structures:
//!
//! - **Definitions**: [`InMemoryDefinitionStore`], [`InMemoryCatalog`]
//! - **Types**: [`BuiltinTypes`] with int4, int8, text and record codecs
//! - **Transport**: [`ScriptedTransport`], replies chosen by a closure, every
//!   connect/statement/cancel/close recorded
//! - **Host**: [`FnExecutor`], [`TestCall`], [`ManualClock`]
//!
//! # Example
//!
//! ```ignore
//! use shardcall_engine::testing::*;
//!
//! let catalog = InMemoryCatalog::new();
//! catalog.insert(cluster_def("shard1", 4));
//!
//! let transport = ScriptedTransport::new();
//! transport.respond(|stmt| Reply::value(&stmt.address));
//! ```

mod definitions;
mod host;
mod transport;
mod types;

pub use definitions::{cluster_def, function_def, InMemoryCatalog, InMemoryDefinitionStore};
pub use host::{FnExecutor, ManualClock, TestCall};
pub use transport::{
    is_transaction_control, text_rows, Reply, ScriptedTransport, Statement, TransportEvent,
};
pub use types::BuiltinTypes;
