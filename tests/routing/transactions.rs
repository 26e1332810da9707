//! Remote transactions mirror the caller's transaction and subtransactions

use crate::common::*;
use shardcall::testing::{cluster_def, function_def, BuiltinTypes, Reply, TestCall};
use shardcall::{ErrorKind, FunctionId, RunOnRule};
use std::thread;
use std::time::Duration;

fn depths(h: &Harness) -> Vec<usize> {
    h.runtime
        .connection_states()
        .iter()
        .map(|c| c.depth)
        .collect()
}

#[test]
fn nested_call_opens_savepoints() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "f", BuiltinTypes::TEXT, 0));
    h.transport.respond(|_| Reply::value("v"));

    h.runtime
        .call_handler(&TestCall::new(id).with_nest_level(3))
        .unwrap();
    assert_eq!(
        h.transport.statements(),
        vec![
            "begin transaction isolation level read committed",
            "savepoint shardcall_sp_2",
            "savepoint shardcall_sp_3",
            "select f()",
        ]
    );
    assert_eq!(depths(&h), vec![3]);

    h.transport.clear_events();
    h.runtime.end_subtransaction(3, true).unwrap();
    h.runtime.end_subtransaction(2, false).unwrap();
    h.runtime.end_transaction(true).unwrap();
    assert_eq!(
        h.transport.statements(),
        vec![
            "release savepoint shardcall_sp_3",
            "rollback to savepoint shardcall_sp_2",
            "release savepoint shardcall_sp_2",
            "commit",
        ]
    );
    assert_eq!(depths(&h), vec![0]);
}

#[test]
fn shallower_call_releases_deeper_savepoints() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "f", BuiltinTypes::TEXT, 0));
    h.transport.respond(|_| Reply::value("v"));

    h.runtime
        .call_handler(&TestCall::new(id).with_nest_level(3))
        .unwrap();
    h.transport.clear_events();
    h.runtime.call_handler(&TestCall::new(id)).unwrap();

    assert_eq!(
        h.transport.statements(),
        vec!["release savepoint shardcall_sp_2", "select f()"]
    );
    assert_eq!(depths(&h), vec![1]);
}

#[test]
fn failed_nested_call_keeps_outer_transaction() {
    let h = Harness::new();
    let ok = h.define(fixed_node(1, "ok", BuiltinTypes::TEXT, 0));
    let bad = h.define(fixed_node(2, "bad", BuiltinTypes::TEXT, 0));
    h.transport.respond(|stmt| {
        if stmt.sql.starts_with("select bad") {
            Reply::Fail("constraint violated".into())
        } else {
            Reply::value("v")
        }
    });

    h.runtime.call_handler(&TestCall::new(ok)).unwrap();
    h.transport.clear_events();
    let err = h
        .runtime
        .call_handler(&TestCall::new(bad).with_nest_level(2))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
    assert_eq!(
        h.transport.statements(),
        vec![
            "savepoint shardcall_sp_2",
            "select bad()",
            "rollback to savepoint shardcall_sp_2",
            "release savepoint shardcall_sp_2",
        ]
    );
    assert_eq!(depths(&h), vec![1]);

    h.runtime.end_transaction(true).unwrap();
    assert_eq!(h.transport.statements().last().map(String::as_str), Some("commit"));
}

/// Loses the connection to node 2 while it carries an open remote
/// transaction; node 1 keeps its own.
fn lose_outer_transaction(h: &Harness) -> (FunctionId, FunctionId) {
    let first = h.define(fixed_node(1, "first", BuiltinTypes::TEXT, 1));
    let fast = h.define(fixed_node(2, "fast", BuiltinTypes::TEXT, 2));
    let slow = h.define(fixed_node(3, "slow", BuiltinTypes::TEXT, 2));
    h.transport.respond(|stmt| {
        if stmt.sql.starts_with("select slow") {
            Reply::Hang
        } else {
            Reply::value("v")
        }
    });

    h.runtime.call_handler(&TestCall::new(first)).unwrap();
    h.runtime.call_handler(&TestCall::new(fast)).unwrap();
    assert_eq!(depths(h), vec![1, 1]);

    h.transport.set_fail_cancel(true);
    let call = TestCall::new(slow).with_nest_level(2);
    let token = call.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        token.cancel();
    });
    let err = h.runtime.call_handler(&call).unwrap_err();
    canceller.join().unwrap();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(depths(h), vec![1]);
    (first, fast)
}

#[test]
fn commit_fails_after_outer_transaction_is_lost() {
    let h = Harness::new();
    let (first, _) = lose_outer_transaction(&h);
    h.transport.clear_events();

    let err = h.runtime.end_transaction(true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
    let message = err.to_string();
    assert!(message.contains("node 2"), "{}", message);
    assert!(message.contains("lost"), "{}", message);
    // The surviving connection is rolled back, not committed.
    assert_eq!(h.transport.statements(), vec!["rollback"]);
    assert_eq!(depths(&h), vec![0]);

    // The next transaction starts clean.
    h.transport.clear_events();
    h.runtime.call_handler(&TestCall::new(first)).unwrap();
    h.runtime.end_transaction(true).unwrap();
    assert_eq!(
        h.transport.statements(),
        vec![
            "begin transaction isolation level read committed",
            "select first()",
            "commit",
        ]
    );
}

#[test]
fn rollback_after_lost_transaction_succeeds() {
    let h = Harness::new();
    lose_outer_transaction(&h);
    h.transport.clear_events();

    h.runtime.end_transaction(false).unwrap();
    assert_eq!(h.transport.statements(), vec!["rollback"]);

    h.transport.clear_events();
    h.runtime.end_transaction(true).unwrap();
    assert!(h.transport.statements().is_empty());
}

#[test]
fn rollback_reaches_every_connection() {
    let h = Harness::new();
    let id = h.define(function_def(
        1,
        "f",
        &[(Some("n"), BuiltinTypes::INT4)],
        BuiltinTypes::TEXT,
        "shard1",
        RunOnRule::ArgNode("n".to_string()),
    ));
    h.transport.respond(|_| Reply::value("v"));
    for n in [0, 2, 3] {
        h.runtime
            .call_handler(&TestCall::new(id).with_args(vec![shardcall::Value::Int(n)]))
            .unwrap();
    }
    h.transport.clear_events();

    h.runtime.end_transaction(false).unwrap();
    assert_eq!(h.transport.statements(), vec!["rollback"; 3]);
    assert_eq!(depths(&h), vec![0, 0, 0]);

    // Nothing open: ending again sends nothing.
    h.transport.clear_events();
    h.runtime.end_transaction(true).unwrap();
    assert!(h.transport.statements().is_empty());
}

#[test]
fn failed_commit_discards_connection() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "transfer", BuiltinTypes::TEXT, 1));
    h.transport.respond(|_| Reply::value("v"));
    h.runtime.call_handler(&TestCall::new(id)).unwrap();
    h.transport.fail_control("commit");

    let err = h.runtime.end_transaction(true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
    let message = err.to_string();
    assert!(message.contains("transfer"), "{}", message);
    assert!(message.contains("node 1"), "{}", message);
    assert_eq!(h.runtime.stats().connections, 0);
}

#[test]
fn auto_commit_cluster_forwards_nothing() {
    let h = Harness::new();
    let mut def = cluster_def("batch", 2);
    def.options
        .push(("isolation_level".to_string(), "AUTO   COMMIT".to_string()));
    h.catalog.insert(def);
    let id = h.define(function_def(1, "f", &[], BuiltinTypes::TEXT, "batch", RunOnRule::Node(1)));
    h.transport.respond(|_| Reply::value("v"));

    h.runtime
        .call_handler(&TestCall::new(id).with_nest_level(2))
        .unwrap();
    h.runtime.end_subtransaction(2, false).unwrap();
    h.runtime.end_transaction(true).unwrap();
    assert_eq!(h.transport.statements(), vec!["select f()"]);
}

#[test]
fn cluster_isolation_level_is_forwarded() {
    let h = Harness::new();
    let mut def = cluster_def("reports", 1);
    def.options.push((
        "isolation_level".to_string(),
        "Serializable Read Only Deferrable".to_string(),
    ));
    h.catalog.insert(def);
    let id = h.define(function_def(1, "f", &[], BuiltinTypes::TEXT, "reports", RunOnRule::Any));
    h.transport.respond(|_| Reply::value("v"));

    h.runtime.call_handler(&TestCall::new(id)).unwrap();
    assert_eq!(
        h.transport.statements()[0],
        "begin transaction isolation level serializable read only deferrable"
    );
}
