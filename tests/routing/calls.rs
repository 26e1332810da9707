//! Single-valued calls end to end

use crate::common::*;
use shardcall::testing::{function_def, BuiltinTypes, Reply, TestCall, TransportEvent};
use shardcall::{
    CallOutput, ErrorKind, FunctionId, QueryText, RecordColumn, RoutingRule, RunOnRule, Value,
    WireFormat, WireValue,
};
use std::time::Duration;

// ============================================================================
// Hash routing and connection reuse
// ============================================================================

#[test]
fn hashed_call_reuses_connection_until_it_ages_out() {
    let h = Harness::new();
    let id = h.define(hashed_lookup(1));
    h.transport.respond(|stmt| {
        if stmt.sql.starts_with("select get_user") {
            Reply::value(&format!("user@{}", node_of(stmt.address)))
        } else {
            Reply::empty()
        }
    });
    let call = TestCall::new(id).with_args(vec![Value::Int(42)]);

    let out = h.runtime.call_handler(&call).unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("user@2")));
    h.runtime.end_transaction(true).unwrap();
    assert_eq!(h.transport.connects(), 1);
    assert_eq!(h.transport.session_address(1).as_deref(), Some("host=shard1-2"));

    h.clock.advance(Duration::from_secs(10));
    let out = h.runtime.call_handler(&call).unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("user@2")));
    h.runtime.end_transaction(true).unwrap();
    assert_eq!(h.transport.connects(), 1);

    h.clock.advance(Duration::from_secs(60));
    let out = h.runtime.call_handler(&call).unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("user@2")));
    assert_eq!(h.transport.connects(), 2);
    assert_eq!(h.transport.session_address(2).as_deref(), Some("host=shard1-2"));
    assert!(h
        .transport
        .events()
        .contains(&TransportEvent::Close { session: 1 }));
    assert_eq!(h.runtime.stats().connections, 1);
}

#[test]
fn hashed_call_sends_argument_and_opens_transaction() {
    let h = Harness::new();
    let id = h.define(hashed_lookup(1));
    h.transport.respond(|_| Reply::value("alice"));

    h.runtime
        .call_handler(&TestCall::new(id).with_args(vec![Value::Int(42)]))
        .unwrap();

    assert_eq!(
        h.transport.statements(),
        vec![
            "begin transaction isolation level read committed",
            "select get_user($1::int4)",
        ]
    );
    let (params, format) = h
        .transport
        .events()
        .into_iter()
        .find_map(|e| match e {
            TransportEvent::Execute { sql, params, format, .. } if sql.starts_with("select") => {
                Some((params, format))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(format, WireFormat::Text);
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].value, Some(WireValue::Text("42".into())));
    assert_eq!(h.local.calls(), 1);
}

#[test]
fn null_argument_is_sent_as_null() {
    let h = Harness::new();
    let id = h.define(function_def(
        1,
        "echo",
        &[(Some("shard"), BuiltinTypes::INT4), (Some("note"), BuiltinTypes::TEXT)],
        BuiltinTypes::TEXT,
        "shard1",
        RunOnRule::ArgNode("shard".to_string()),
    ));
    h.transport.respond(|stmt| {
        assert_eq!(stmt.params[1].value, None);
        Reply::value("ok")
    });

    let out = h
        .runtime
        .call_handler(&TestCall::new(id).with_args(vec![Value::Int(3), Value::Null]))
        .unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("ok")));
    assert_eq!(h.transport.session_address(1).as_deref(), Some("host=shard1-3"));
}

#[test]
fn binary_format_when_every_type_supports_it() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "counter", BuiltinTypes::INT4, 1));
    h.transport.respond(|stmt| {
        assert_eq!(stmt.format, WireFormat::Binary);
        Reply::Rows(shardcall::RawResult::new(
            vec![],
            vec![vec![Some(WireValue::Binary(vec![0, 0, 1, 0]))]],
        ))
    });

    let out = h.runtime.call_handler(&TestCall::new(id)).unwrap();
    assert_eq!(out, CallOutput::Value(Value::Int(256)));
}

#[test]
fn custom_remote_query_binds_named_arguments() {
    let h = Harness::new();
    let mut def = function_def(
        1,
        "balance",
        &[(Some("account"), BuiltinTypes::INT8), (None, BuiltinTypes::INT4)],
        BuiltinTypes::TEXT,
        "shard1",
        RunOnRule::ArgNode("$2".to_string()),
    );
    def.rule = RoutingRule {
        query: Some(QueryText::new(
            "select amount from accounts where id = $1",
            vec!["account".to_string()],
        )),
        ..def.rule.clone()
    };
    let id = h.define(def);
    h.transport.respond(|stmt| {
        assert_eq!(stmt.sql, "select amount from accounts where id = $1");
        assert_eq!(stmt.params.len(), 1);
        Reply::value("12.50")
    });

    let out = h
        .runtime
        .call_handler(&TestCall::new(id).with_args(vec![Value::Int(7), Value::Int(0)]))
        .unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("12.50")));
}

// ============================================================================
// Anonymous records
// ============================================================================

#[test]
fn record_call_uses_column_definition_list() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "user_row", BuiltinTypes::RECORD, 0));
    h.transport.respond(|stmt| {
        if stmt.sql.starts_with("select * from user_row") {
            Reply::Rows(shardcall::RawResult::new(
                vec![],
                vec![vec![
                    Some(WireValue::Text("5".into())),
                    Some(WireValue::Text("bob".into())),
                ]],
            ))
        } else {
            Reply::empty()
        }
    });
    let columns = vec![
        RecordColumn {
            name: "id".to_string(),
            type_id: BuiltinTypes::INT4,
        },
        RecordColumn {
            name: "name".to_string(),
            type_id: BuiltinTypes::TEXT,
        },
    ];

    let out = h
        .runtime
        .call_handler(&TestCall::new(id).with_record_columns(columns))
        .unwrap();
    assert_eq!(
        out,
        CallOutput::Value(Value::Record(vec![Value::Int(5), Value::from("bob")]))
    );
    assert!(h
        .transport
        .statements()
        .contains(&r#"select * from user_row() as ("id" int4, "name" text)"#.to_string()));
}

#[test]
fn record_call_without_columns_is_rejected() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "user_row", BuiltinTypes::RECORD, 0));
    let err = h.runtime.call_handler(&TestCall::new(id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedContext);
    assert_eq!(h.transport.connects(), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn trigger_invocation_is_rejected() {
    let h = Harness::new();
    let id = h.define(hashed_lookup(1));
    let err = h
        .runtime
        .call_handler(&TestCall::new(id).as_trigger())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedContext);
    assert!(h.transport.events().is_empty());
}

#[test]
fn remote_error_rolls_back_and_keeps_connection() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "explode", BuiltinTypes::TEXT, 1));
    h.transport.respond(|_| Reply::Fail("division by zero".into()));

    let err = h.runtime.call_handler(&TestCall::new(id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
    assert!(err.to_string().contains("division by zero"));
    assert!(err.to_string().contains("shard1"));
    assert_eq!(h.transport.statements().last().map(String::as_str), Some("rollback"));

    let states = h.runtime.connection_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].depth, 0);
}

#[test]
fn lost_connection_is_discarded_and_replaced() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "flaky", BuiltinTypes::TEXT, 0));
    h.transport.respond(|stmt| {
        if stmt.session == 1 {
            Reply::Lost("server closed the connection unexpectedly".into())
        } else {
            Reply::value("ok")
        }
    });

    let err = h.runtime.call_handler(&TestCall::new(id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
    assert_eq!(h.runtime.stats().connections, 0);

    let out = h.runtime.call_handler(&TestCall::new(id)).unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("ok")));
    assert_eq!(h.transport.connects(), 2);
}

#[test]
fn wrong_row_count_for_single_value() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "many", BuiltinTypes::TEXT, 0));
    h.transport.respond(|_| Reply::rows(&["a", "b"]));
    let err = h.runtime.call_handler(&TestCall::new(id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
}

#[test]
fn node_argument_out_of_range_or_null() {
    let h = Harness::new();
    let id = h.define(function_def(
        1,
        "bad_node",
        &[(Some("n"), BuiltinTypes::INT4)],
        BuiltinTypes::TEXT,
        "shard1",
        RunOnRule::ArgNode("n".to_string()),
    ));
    let err = h
        .runtime
        .call_handler(&TestCall::new(id).with_args(vec![Value::Int(9)]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    let err = h
        .runtime
        .call_handler(&TestCall::new(id).with_args(vec![Value::Null]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnroutableCall);
    assert_eq!(h.transport.connects(), 0);
}

#[test]
fn unknown_function_is_not_found() {
    let h = Harness::new();
    let err = h
        .runtime
        .call_handler(&TestCall::new(FunctionId(99)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
}
