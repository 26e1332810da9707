//! Routing integration suite: full calls through `ProxyRuntime` against a
//! scripted transport.

mod common;

mod cache_coherence;
mod calls;
mod pool_limits;
mod streaming;
mod transactions;
