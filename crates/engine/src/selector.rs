//! Node selection
//!
//! Resolves the node a call runs on. Hash mode runs the bound selector query
//! on the local engine; that query may itself call routed functions, so the
//! caller must not hold any cache lock here.

use crate::cluster::Cluster;
use crate::function::{RoutingDescriptor, RunOn};
use rand::Rng;
use shardcall_core::{LocalExecutor, ProxyError, ProxyResult, Value};

/// Pick the node for one call.
///
/// # Errors
///
/// - `UnroutableCall` if the hash query does not yield exactly one non-null
///   integer, or the node argument is NULL or not an integer
/// - `OutOfRange` if the resolved index is not a node of `cluster`
/// - any error from the local executor
pub fn select_node(
    descriptor: &RoutingDescriptor,
    cluster: &Cluster,
    args: &[Value],
    local: &dyn LocalExecutor,
) -> ProxyResult<usize> {
    match descriptor.run_on() {
        RunOn::Hash(query) => {
            let params = query.local_params(args, descriptor.arg_types());
            let rows = local.query(query.sql(), &params)?;
            let index = single_int(&rows).ok_or_else(|| {
                ProxyError::unroutable(
                    descriptor.name(),
                    "hash query must return exactly one non-null integer",
                )
            })?;
            cluster.check_node(index)
        }
        RunOn::Node(index) => cluster.check_node(*index as i64),
        RunOn::ArgNode(position) => match args.get(*position) {
            Some(Value::Int(index)) => cluster.check_node(*index),
            Some(Value::Null) | None => Err(ProxyError::unroutable(
                descriptor.name(),
                format!("node argument ${} is NULL", position + 1),
            )),
            Some(other) => Err(ProxyError::unroutable(
                descriptor.name(),
                format!(
                    "node argument ${} is {}, not an integer",
                    position + 1,
                    other.type_name()
                ),
            )),
        },
        RunOn::Any => Ok(rand::thread_rng().gen_range(0..cluster.node_count())),
    }
}

fn single_int(rows: &[Vec<Value>]) -> Option<i64> {
    match rows {
        [row] => match row.as_slice() {
            [Value::Int(n)] => Some(*n),
            _ => None,
        },
        _ => None,
    }
}
