//! Remote transaction forwarding
//!
//! A remote connection mirrors the caller's transaction nesting:
//!
//! | depth | remote state |
//! |---|---|
//! | 0 | no transaction |
//! | 1 | `begin` issued |
//! | n > 1 | savepoints `shardcall_sp_2` .. `shardcall_sp_n` open |
//!
//! This module only plans the statements that move a connection from one
//! depth to another; the dispatcher runs them and records the new depth after
//! each one succeeds.

use crate::cluster::IsolationLevel;

/// Name of the savepoint that opens nesting level `level`
pub fn savepoint_name(level: usize) -> String {
    format!("shardcall_sp_{}", level)
}

/// One statement and the depth the connection is at once it succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnStep {
    /// Statement text
    pub sql: String,
    /// Depth after the statement
    pub depth: usize,
}

impl TxnStep {
    fn new(sql: String, depth: usize) -> Self {
        TxnStep { sql, depth }
    }
}

/// Steps that bring a connection at `current` depth to the caller's
/// `nest_level` (treated as at least 1).
pub fn sync_steps(isolation: &IsolationLevel, current: usize, nest_level: usize) -> Vec<TxnStep> {
    let begin = match isolation.begin_statement() {
        Some(begin) => begin,
        None => return Vec::new(),
    };
    let target = nest_level.max(1);
    let mut steps = Vec::new();
    let mut depth = current;

    if depth > target {
        // Releasing a savepoint also releases every later one.
        depth = target;
        steps.push(TxnStep::new(
            format!("release savepoint {}", savepoint_name(target + 1)),
            depth,
        ));
    }
    if depth == 0 {
        depth = 1;
        steps.push(TxnStep::new(begin, depth));
    }
    while depth < target {
        depth += 1;
        steps.push(TxnStep::new(format!("savepoint {}", savepoint_name(depth)), depth));
    }
    steps
}

/// Steps that undo the innermost level after a failed statement
pub fn error_cleanup_steps(depth: usize) -> Vec<TxnStep> {
    match depth {
        0 => Vec::new(),
        1 => vec![TxnStep::new("rollback".to_string(), 0)],
        n => vec![
            TxnStep::new(format!("rollback to savepoint {}", savepoint_name(n)), n),
            TxnStep::new(format!("release savepoint {}", savepoint_name(n)), n - 1),
        ],
    }
}

/// Steps run on every open connection when the caller's top-level
/// transaction ends
pub fn end_transaction_steps(depth: usize, commit: bool) -> Vec<TxnStep> {
    if depth == 0 {
        return Vec::new();
    }
    let sql = if commit { "commit" } else { "rollback" };
    vec![TxnStep::new(sql.to_string(), 0)]
}

/// Steps run when the caller's subtransaction at `level` ends
pub fn end_subtransaction_steps(depth: usize, level: usize, commit: bool) -> Vec<TxnStep> {
    if level <= 1 {
        return end_transaction_steps(depth, commit);
    }
    if depth < level {
        return Vec::new();
    }
    let name = savepoint_name(level);
    if commit {
        vec![TxnStep::new(format!("release savepoint {}", name), level - 1)]
    } else {
        vec![
            TxnStep::new(format!("rollback to savepoint {}", name), level),
            TxnStep::new(format!("release savepoint {}", name), level - 1),
        ]
    }
}
