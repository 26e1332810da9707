//! Size limits for clusters, functions and the connection pool
//!
//! Node lists, argument lists and the pool are dynamically sized, but each has
//! a documented maximum. Limits are checked when a definition is loaded or a
//! connection is created, and a violation is reported as an error rather than
//! truncated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configurable maximums
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum nodes per cluster (default: 100)
    pub max_nodes: usize,

    /// Maximum arguments per routed function (default: 100)
    pub max_args: usize,

    /// Maximum live connections in the pool (default: 128)
    pub max_connections: usize,

    /// Maximum node address length in bytes, credentials included (default: 1024)
    pub max_address_len: usize,

    /// Maximum isolation level string length (default: 42,
    /// `"repeatable read read write not deferrable"`)
    pub max_isolation_level_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_nodes: 100,
            max_args: 100,
            max_connections: 128,
            max_address_len: 1024,
            max_isolation_level_len: 42,
        }
    }
}

/// A limit was exceeded or misconfigured
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitError {
    /// A count exceeds its maximum
    #[error("{what} count {actual} exceeds maximum {max}")]
    TooMany {
        /// What was counted
        what: &'static str,
        /// Actual count
        actual: usize,
        /// Maximum allowed
        max: usize,
    },

    /// A string exceeds its maximum length
    #[error("{what} length {actual} exceeds maximum {max}")]
    TooLong {
        /// What was measured
        what: &'static str,
        /// Actual length
        actual: usize,
        /// Maximum allowed
        max: usize,
    },

    /// A configured limit is zero
    #[error("limit '{0}' must be greater than zero")]
    Zero(&'static str),
}

impl Limits {
    /// Create limits with small values for testing
    pub fn with_small_limits() -> Self {
        Limits {
            max_nodes: 4,
            max_args: 4,
            max_connections: 2,
            max_address_len: 64,
            max_isolation_level_len: 42,
        }
    }

    /// Reject zero limits
    pub fn validate(&self) -> Result<(), LimitError> {
        let fields = [
            ("max_nodes", self.max_nodes),
            ("max_args", self.max_args),
            ("max_connections", self.max_connections),
            ("max_address_len", self.max_address_len),
            ("max_isolation_level_len", self.max_isolation_level_len),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(LimitError::Zero(name));
            }
        }
        Ok(())
    }

    /// Validate a cluster's node count
    pub fn check_nodes(&self, count: usize) -> Result<(), LimitError> {
        check_count("node", count, self.max_nodes)
    }

    /// Validate a function's argument count
    pub fn check_args(&self, count: usize) -> Result<(), LimitError> {
        check_count("argument", count, self.max_args)
    }

    /// Validate a node address
    pub fn check_address(&self, address: &str) -> Result<(), LimitError> {
        check_len("node address", address.len(), self.max_address_len)
    }

    /// Validate an isolation level string
    pub fn check_isolation_level(&self, level: &str) -> Result<(), LimitError> {
        check_len("isolation level", level.len(), self.max_isolation_level_len)
    }
}

fn check_count(what: &'static str, actual: usize, max: usize) -> Result<(), LimitError> {
    if actual > max {
        return Err(LimitError::TooMany { what, actual, max });
    }
    Ok(())
}

fn check_len(what: &'static str, actual: usize, max: usize) -> Result<(), LimitError> {
    if actual > max {
        return Err(LimitError::TooLong { what, actual, max });
    }
    Ok(())
}
