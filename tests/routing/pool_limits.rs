//! Connection pool cap and aging under the runtime

use crate::common::*;
use shardcall::testing::{function_def, BuiltinTypes, Reply, TestCall, TransportEvent};
use shardcall::{ErrorKind, FunctionId, Limits, ProxyConfig, RunOnRule, Value};
use std::time::Duration;

fn capped(max_connections: usize) -> (Harness, FunctionId) {
    let h = Harness::with_config(ProxyConfig {
        limits: Limits {
            max_connections,
            ..Limits::default()
        },
        ..ProxyConfig::default()
    });
    let id = h.define(function_def(
        1,
        "on_node",
        &[(Some("n"), BuiltinTypes::INT4)],
        BuiltinTypes::TEXT,
        "shard1",
        RunOnRule::ArgNode("n".to_string()),
    ));
    h.transport.respond(|_| Reply::value("v"));
    (h, id)
}

fn call_node(h: &Harness, id: FunctionId, node: i64) -> shardcall::ProxyResult<()> {
    h.runtime
        .call_handler(&TestCall::new(id).with_args(vec![Value::Int(node)]))
        .map(|_| ())
}

#[test]
fn full_pool_rejects_new_node() {
    let (h, id) = capped(2);
    call_node(&h, id, 0).unwrap();
    call_node(&h, id, 1).unwrap();

    let err = call_node(&h, id, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(err.to_string().contains('2'));

    // Existing nodes still work at the cap.
    call_node(&h, id, 1).unwrap();
    assert_eq!(h.transport.connects(), 2);
}

#[test]
fn expired_connections_make_room() {
    let (h, id) = capped(2);
    call_node(&h, id, 0).unwrap();
    call_node(&h, id, 1).unwrap();
    h.transport.clear_events();
    h.runtime.end_transaction(true).unwrap();
    assert_eq!(h.transport.statements(), vec!["commit"; 2]);

    h.transport.clear_events();
    h.clock.advance(Duration::from_secs(61));
    call_node(&h, id, 2).unwrap();
    assert_eq!(h.runtime.stats().connections, 1);
    assert_eq!(h.transport.connects(), 3);

    let mut closed: Vec<u64> = h
        .transport
        .events()
        .iter()
        .filter_map(|e| match e {
            TransportEvent::Close { session } => Some(*session),
            _ => None,
        })
        .collect();
    closed.sort_unstable();
    assert_eq!(closed, vec![1, 2]);
    assert_eq!(
        h.transport.statements(),
        vec![
            "begin transaction isolation level read committed",
            "select on_node($1::int4)",
        ]
    );
}

#[test]
fn open_transactions_are_never_aged_out() {
    let (h, id) = capped(2);
    call_node(&h, id, 0).unwrap();
    call_node(&h, id, 1).unwrap();

    h.clock.advance(Duration::from_secs(120));
    let err = call_node(&h, id, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);

    // The old connection keeps serving its node inside the transaction.
    call_node(&h, id, 0).unwrap();
    assert_eq!(h.transport.connects(), 2);
}

#[test]
fn failed_connect_leaves_pool_empty() {
    let (h, id) = capped(2);
    h.transport.set_fail_connect(true);
    let err = call_node(&h, id, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
    assert_eq!(h.runtime.stats().connections, 0);

    h.transport.set_fail_connect(false);
    call_node(&h, id, 0).unwrap();
}

#[test]
fn close_connections_empties_pool() {
    let (h, id) = capped(4);
    call_node(&h, id, 0).unwrap();
    call_node(&h, id, 3).unwrap();
    h.runtime.close_connections();
    assert_eq!(h.runtime.stats().connections, 0);
}
