//! shardcall - transparent routing of SQL function calls to cluster nodes
//!
//! A routed function is declared locally with a routing rule: the cluster it
//! targets and how to pick a node (`hash`, a fixed node, a node taken from an
//! argument, or any node). Calling it runs the same-named function, or a
//! custom query, on the chosen node and returns that node's result as if the
//! call had been local. Remote transactions follow the caller's transaction
//! and subtransaction boundaries.
//!
//! # Quick Start
//!
//! ```ignore
//! use shardcall::{Collaborators, ProxyConfig, ProxyRuntime, CallOutput};
//!
//! let runtime = ProxyRuntime::new(ProxyConfig::default(), collaborators)?;
//! runtime.startup()?;
//!
//! match runtime.call_handler(&call)? {
//!     CallOutput::Value(v) => println!("{:?}", v),
//!     CallOutput::Row(v) => println!("row {:?}", v),
//!     CallOutput::EndOfSequence => {}
//! }
//!
//! // From the host's transaction callbacks
//! runtime.end_transaction(true)?;
//! ```
//!
//! # Architecture
//!
//! `shardcall-core` holds the data model and the traits a host implements
//! (definition store, cluster catalog, type provider, local executor, remote
//! transport). `shardcall-engine` holds the caches, the dispatcher and the
//! runtime.

pub use shardcall_core::*;
pub use shardcall_engine::*;
