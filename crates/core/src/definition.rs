//! Definitions handed to the core by its external collaborators
//!
//! - [`FunctionDefinition`]: a function signature plus the parser's structured
//!   output for its body ([`RoutingRule`])
//! - [`ClusterDefinition`]: raw cluster options from the catalog
//! - [`TypeDefinition`]: a codec handle from the type provider
//!
//! Every definition carries the [`Stamp`] of the version it was read from.

use crate::stamp::Stamp;
use crate::traits::TypeCodec;
use crate::types::{FunctionId, TypeId};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// SQL text with named parameter references.
///
/// `params[i]` names the function argument bound to placeholder `$i+1`. A
/// reference is either a declared argument name or a positional `$N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryText {
    /// Statement text using `$1..$n` placeholders
    pub sql: String,
    /// Argument reference for each placeholder, in order
    pub params: Vec<String>,
}

impl QueryText {
    /// Query text with its parameter references
    pub fn new(sql: impl Into<String>, params: Vec<String>) -> Self {
        QueryText {
            sql: sql.into(),
            params,
        }
    }
}

/// How the parser says a call picks its node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOnRule {
    /// Run the query locally; its single integer result is the node index
    Hash(QueryText),
    /// Fixed node index
    Node(i64),
    /// Node index taken from the named argument
    ArgNode(String),
    /// Any node, chosen per call
    Any,
    /// A mode keyword this version does not know
    Unrecognized(String),
}

/// Structured form of a function body, as produced by the body parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Cluster the call runs on
    pub cluster: String,
    /// Node selection rule
    pub run_on: RunOnRule,
    /// Statement to run on the node; `None` calls the same-named function there
    pub query: Option<QueryText>,
}

/// A routed function as stored in the definition store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    /// Identity
    pub id: FunctionId,
    /// Schema-qualified name
    pub name: String,
    /// Declared argument names; unnamed arguments are `None`
    pub arg_names: Vec<Option<String>>,
    /// Argument types, same length as `arg_names`
    pub arg_types: Vec<TypeId>,
    /// Return type (element type for set-returning functions)
    pub return_type: TypeId,
    /// Return type modifier, `-1` when absent
    pub return_typmod: i32,
    /// True for set-returning functions
    pub returns_set: bool,
    /// Parsed body
    pub rule: RoutingRule,
    /// Version of this definition
    pub stamp: Stamp,
}

/// A cluster as stored in the catalog: raw options, uninterpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDefinition {
    /// Catalog id
    pub id: u32,
    /// Cluster name
    pub name: String,
    /// Server options: `node_<N>`, `isolation_level`, `connection_lifetime`
    pub options: Vec<(String, String)>,
    /// Per-user options (credentials) appended to every node address
    pub user_options: Vec<(String, String)>,
    /// Version of this definition
    pub stamp: Stamp,
}

/// Broad category of a type, as far as routing cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    /// Integer of any width; usable as a node number
    Integer,
    /// Any other scalar
    Scalar,
    /// Composite with a fixed, known column list
    Composite,
    /// Anonymous record whose shape is given by each call
    UntypedRecord,
}

/// A type with its codec, as yielded by the type provider
#[derive(Clone)]
pub struct TypeDefinition {
    /// Identity
    pub id: TypeId,
    /// SQL name, used when deriving remote queries
    pub name: String,
    /// Marshal/unmarshal handle
    pub codec: Arc<dyn TypeCodec>,
    /// Side parameter passed to the decoder
    pub io_param: u32,
    /// Category
    pub category: TypeCategory,
    /// Version of this definition
    pub stamp: Stamp,
}

impl fmt::Debug for TypeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("io_param", &self.io_param)
            .field("category", &self.category)
            .field("stamp", &self.stamp)
            .finish_non_exhaustive()
    }
}

/// One column of the record shape a call expects back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordColumn {
    /// Column name
    pub name: String,
    /// Column type
    pub type_id: TypeId,
}

/// A parameter for a statement run on the local engine
#[derive(Debug, Clone, PartialEq)]
pub struct LocalParam {
    /// Declared type
    pub type_id: TypeId,
    /// Value
    pub value: Value,
}
