//! Error types for shardcall
//!
//! This module defines every error a routed call can surface.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! All variants abort the current call immediately. Each carries enough context
//! (definition name, node index, remote error text) to diagnose the failure
//! without retrying it; nothing in this workspace retries a failed remote query.

use std::fmt;
use thiserror::Error;

/// Result type alias for shardcall operations
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Which kind of external definition an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    /// A routed function definition
    Function,
    /// A cluster definition from the catalog
    Cluster,
    /// A type definition from the codec provider
    Type,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionKind::Function => write!(f, "function"),
            DefinitionKind::Cluster => write!(f, "cluster"),
            DefinitionKind::Type => write!(f, "type"),
        }
    }
}

/// Fieldless discriminant of [`ProxyError`], convenient for matching in callers
/// and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ProxyError::DefinitionNotFound`]
    DefinitionNotFound,
    /// See [`ProxyError::DefinitionInvalid`]
    DefinitionInvalid,
    /// See [`ProxyError::UnknownArgument`]
    UnknownArgument,
    /// See [`ProxyError::ParseError`]
    ParseError,
    /// See [`ProxyError::OutOfRange`]
    OutOfRange,
    /// See [`ProxyError::UnroutableCall`]
    UnroutableCall,
    /// See [`ProxyError::PoolExhausted`]
    PoolExhausted,
    /// See [`ProxyError::RemoteQueryError`]
    RemoteQueryError,
    /// See [`ProxyError::Cancelled`]
    Cancelled,
    /// See [`ProxyError::UnsupportedContext`]
    UnsupportedContext,
    /// See [`ProxyError::Io`]
    Io,
}

/// Error type for routed calls
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The definition store, catalog or type provider has no such definition
    #[error("{kind} not found: {name}")]
    DefinitionNotFound {
        /// What was looked up
        kind: DefinitionKind,
        /// Name or id of the missing definition
        name: String,
    },

    /// A definition exists but cannot be used as written
    #[error("invalid {kind} definition '{name}': {reason}")]
    DefinitionInvalid {
        /// What kind of definition
        kind: DefinitionKind,
        /// Name of the offending definition
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A routing rule references an argument the function does not declare
    #[error("function '{function}' has no argument '{argument}'")]
    UnknownArgument {
        /// Function being compiled
        function: String,
        /// The unresolved reference
        argument: String,
    },

    /// Text could not be parsed (node labels, values handed to codecs)
    #[error("cannot parse '{input}': {reason}")]
    ParseError {
        /// The rejected input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// A node index falls outside its cluster
    #[error("{context}: node index {index} out of range (node count {node_count})")]
    OutOfRange {
        /// Where the index came from
        context: String,
        /// The rejected index
        index: i64,
        /// Number of nodes available
        node_count: usize,
    },

    /// No node could be chosen for a call
    #[error("function '{function}': cannot route call: {reason}")]
    UnroutableCall {
        /// Function being called
        function: String,
        /// Why routing failed
        reason: String,
    },

    /// The connection pool is at its configured maximum
    #[error("connection pool exhausted: all {max} connections are in use")]
    PoolExhausted {
        /// Configured maximum
        max: usize,
    },

    /// The remote node rejected the query or the transport failed
    #[error("function '{function}': node {node} of cluster '{cluster}' failed: {message}")]
    RemoteQueryError {
        /// Function being called
        function: String,
        /// Target cluster
        cluster: String,
        /// Target node index
        node: usize,
        /// Error text reported by the remote node or transport
        message: String,
    },

    /// The call was cancelled while waiting for the remote node
    #[error("function '{function}': cancelled while waiting for node {node} of cluster '{cluster}'")]
    Cancelled {
        /// Function being called
        function: String,
        /// Target cluster
        cluster: String,
        /// Target node index
        node: usize,
    },

    /// The entry point was invoked in a context it does not support
    #[error("unsupported call context: {0}")]
    UnsupportedContext(String),

    /// A local file could not be read or written
    #[error("{context}: {source}")]
    Io {
        /// What was being done, including the path
        context: String,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    /// Discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::DefinitionNotFound { .. } => ErrorKind::DefinitionNotFound,
            ProxyError::DefinitionInvalid { .. } => ErrorKind::DefinitionInvalid,
            ProxyError::UnknownArgument { .. } => ErrorKind::UnknownArgument,
            ProxyError::ParseError { .. } => ErrorKind::ParseError,
            ProxyError::OutOfRange { .. } => ErrorKind::OutOfRange,
            ProxyError::UnroutableCall { .. } => ErrorKind::UnroutableCall,
            ProxyError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ProxyError::RemoteQueryError { .. } => ErrorKind::RemoteQueryError,
            ProxyError::Cancelled { .. } => ErrorKind::Cancelled,
            ProxyError::UnsupportedContext(_) => ErrorKind::UnsupportedContext,
            ProxyError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Missing definition of the given kind
    pub fn not_found(kind: DefinitionKind, name: impl Into<String>) -> Self {
        ProxyError::DefinitionNotFound {
            kind,
            name: name.into(),
        }
    }

    /// Invalid definition of the given kind
    pub fn invalid(kind: DefinitionKind, name: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::DefinitionInvalid {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Unparseable input
    pub fn parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::ParseError {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Local file failure
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ProxyError::Io {
            context: context.into(),
            source,
        }
    }

    /// Call that cannot be routed
    pub fn unroutable(function: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::UnroutableCall {
            function: function.into(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by a remote transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The remote node executed the statement and reported an error.
    /// The session is still usable.
    #[error("{0}")]
    Remote(String),

    /// The session is gone (network failure, server shutdown).
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl TransportError {
    /// True when the session can no longer be used
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_))
    }
}

/// Failure reported by a type codec while converting a value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    /// Create a codec error from any message
    pub fn new(message: impl Into<String>) -> Self {
        CodecError(message.into())
    }
}
