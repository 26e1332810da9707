//! Set-returning calls: one row per resumption, then end-of-sequence

use crate::common::*;
use shardcall::testing::{BuiltinTypes, Reply, TestCall};
use shardcall::{CallId, CallOutput, ErrorKind, FunctionId, TypeId, Value};

fn set_returning(h: &Harness, id: u32, return_type: TypeId) -> FunctionId {
    let mut def = fixed_node(id, "list_items", return_type, 3);
    def.returns_set = true;
    h.define(def)
}

#[test]
fn rows_then_repeated_end_of_sequence() {
    let h = Harness::new();
    let id = set_returning(&h, 1, BuiltinTypes::TEXT);
    h.transport.respond(|_| Reply::rows(&["a", "b", "c"]));
    let first = TestCall::new(id).set_returning().with_call_id(10);
    let next = first.resumed();

    assert_eq!(
        h.runtime.call_handler(&first).unwrap(),
        CallOutput::Row(Value::from("a"))
    );
    assert_eq!(h.runtime.stats().streams, 1);
    assert_eq!(
        h.runtime.call_handler(&next).unwrap(),
        CallOutput::Row(Value::from("b"))
    );
    assert_eq!(
        h.runtime.call_handler(&next).unwrap(),
        CallOutput::Row(Value::from("c"))
    );
    for _ in 0..3 {
        assert_eq!(h.runtime.call_handler(&next).unwrap(), CallOutput::EndOfSequence);
    }
    assert_eq!(h.runtime.stats().streams, 0);

    // One remote query for the whole sequence.
    let queries = h
        .transport
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("select"))
        .count();
    assert_eq!(queries, 1);
}

#[test]
fn empty_set_ends_immediately() {
    let h = Harness::new();
    let id = set_returning(&h, 1, BuiltinTypes::TEXT);
    let first = TestCall::new(id).set_returning();

    assert_eq!(h.runtime.call_handler(&first).unwrap(), CallOutput::EndOfSequence);
    assert_eq!(
        h.runtime.call_handler(&first.resumed()).unwrap(),
        CallOutput::EndOfSequence
    );
    assert_eq!(h.runtime.stats().streams, 0);
}

#[test]
fn concurrent_streams_are_independent() {
    let h = Harness::new();
    let id = set_returning(&h, 1, BuiltinTypes::TEXT);
    h.transport.respond(|_| Reply::rows(&["x", "y"]));
    let a = TestCall::new(id).set_returning().with_call_id(1);
    let b = TestCall::new(id).set_returning().with_call_id(2);

    assert_eq!(h.runtime.call_handler(&a).unwrap(), CallOutput::Row(Value::from("x")));
    assert_eq!(h.runtime.call_handler(&b).unwrap(), CallOutput::Row(Value::from("x")));
    assert_eq!(
        h.runtime.call_handler(&a.resumed()).unwrap(),
        CallOutput::Row(Value::from("y"))
    );
    assert_eq!(h.runtime.call_handler(&a.resumed()).unwrap(), CallOutput::EndOfSequence);
    assert_eq!(
        h.runtime.call_handler(&b.resumed()).unwrap(),
        CallOutput::Row(Value::from("y"))
    );
}

#[test]
fn abandoned_stream_is_released() {
    let h = Harness::new();
    let id = set_returning(&h, 1, BuiltinTypes::TEXT);
    h.transport.respond(|_| Reply::rows(&["a", "b", "c"]));
    let first = TestCall::new(id).set_returning().with_call_id(5);

    h.runtime.call_handler(&first).unwrap();
    assert!(h.runtime.abandon_call(CallId(5)));
    assert!(!h.runtime.abandon_call(CallId(5)));
    assert_eq!(h.runtime.stats().streams, 0);
}

#[test]
fn undecodable_row_ends_stream_with_error() {
    let h = Harness::new();
    let id = set_returning(&h, 1, BuiltinTypes::INT8);
    h.transport.respond(|_| Reply::rows(&["1", "two", "3"]));
    let first = TestCall::new(id).set_returning();

    assert_eq!(h.runtime.call_handler(&first).unwrap(), CallOutput::Row(Value::Int(1)));
    let err = h.runtime.call_handler(&first.resumed()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteQueryError);
    assert_eq!(
        h.runtime.call_handler(&first.resumed()).unwrap(),
        CallOutput::EndOfSequence
    );
}

