//! Bound queries
//!
//! A [`BoundQuery`] is SQL text whose `$1..$n` placeholders have been tied to
//! argument positions of the owning function. Binding happens once at compile
//! time; each call only gathers the argument values.

use crate::codec::{CachedType, RecordField};
use shardcall_core::{FunctionDefinition, LocalParam, ProxyError, ProxyResult, QueryText, Value};
use std::sync::Arc;

/// SQL text plus the argument position feeding each placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQuery {
    sql: String,
    arg_indexes: Vec<usize>,
}

impl BoundQuery {
    /// Query over already-resolved argument positions
    pub fn new(sql: impl Into<String>, arg_indexes: Vec<usize>) -> Self {
        BoundQuery {
            sql: sql.into(),
            arg_indexes,
        }
    }

    /// Resolve every parameter reference of `text` against `function`.
    ///
    /// # Errors
    ///
    /// `UnknownArgument` for the first reference that names no argument.
    pub fn bind(text: &QueryText, function: &FunctionDefinition) -> ProxyResult<Self> {
        let arg_indexes = text
            .params
            .iter()
            .map(|reference| resolve_argument(function, reference))
            .collect::<ProxyResult<Vec<_>>>()?;
        Ok(BoundQuery::new(text.sql.clone(), arg_indexes))
    }

    /// Statement text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Argument position for placeholder `$i+1`
    pub fn arg_indexes(&self) -> &[usize] {
        &self.arg_indexes
    }

    /// Parameters for running this query on the local engine
    pub fn local_params(&self, args: &[Value], arg_types: &[Arc<CachedType>]) -> Vec<LocalParam> {
        self.arg_indexes
            .iter()
            .map(|&i| LocalParam {
                type_id: arg_types[i].id(),
                value: args.get(i).cloned().unwrap_or(Value::Null),
            })
            .collect()
    }
}

/// Resolve an argument reference: a declared name, or `$N` (1-based).
pub fn resolve_argument(function: &FunctionDefinition, reference: &str) -> ProxyResult<usize> {
    let arg_count = function.arg_types.len();
    if let Some(position) = reference.strip_prefix('$') {
        if let Ok(n) = position.parse::<usize>() {
            if (1..=arg_count).contains(&n) {
                return Ok(n - 1);
            }
        }
    } else if let Some(i) = function
        .arg_names
        .iter()
        .position(|name| name.as_deref() == Some(reference))
    {
        return Ok(i);
    }
    Err(ProxyError::UnknownArgument {
        function: function.name.clone(),
        argument: reference.to_string(),
    })
}

/// `select name($1::t1, $2::t2)`
pub fn derive_call_sql(function: &str, arg_types: &[Arc<CachedType>]) -> String {
    format!("select {}({})", function, placeholder_list(arg_types))
}

/// `select * from name($1::t1)`, completed per call by [`with_column_list`]
pub fn derive_record_call_sql(function: &str, arg_types: &[Arc<CachedType>]) -> String {
    format!("select * from {}({})", function, placeholder_list(arg_types))
}

/// Append `as ("col" type, ...)` to a record-returning call
pub fn with_column_list(prefix: &str, fields: &[RecordField]) -> String {
    let columns: Vec<String> = fields
        .iter()
        .map(|f| format!("{} {}", quote_ident(&f.name), f.ty.name()))
        .collect();
    format!("{} as ({})", prefix, columns.join(", "))
}

fn placeholder_list(arg_types: &[Arc<CachedType>]) -> String {
    arg_types
        .iter()
        .enumerate()
        .map(|(i, ty)| format!("${}::{}", i + 1, ty.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
