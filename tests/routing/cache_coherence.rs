//! Descriptors, codecs and clusters follow edits to their definitions

use crate::common::*;
use shardcall::testing::{cluster_def, function_def, BuiltinTypes, Reply, TestCall};
use shardcall::{CallKind, CallOutput, ErrorKind, QueryText, RunOnRule, Value};
use std::sync::Arc;

#[test]
fn validate_reports_unknown_hash_argument_without_caching() {
    let h = Harness::new();
    let id = h.define(function_def(
        1,
        "get_user",
        &[(Some("username"), BuiltinTypes::INT4)],
        BuiltinTypes::TEXT,
        "shard1",
        RunOnRule::Hash(QueryText::new(
            "select shard_of($1)",
            vec!["user_name".to_string()],
        )),
    ));

    let err = h.runtime.validate(id, CallKind::Function).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    assert!(err.to_string().contains("user_name"));
    assert!(h.runtime.cached_descriptor(id).is_none());
    assert!(h.transport.events().is_empty());
}

#[test]
fn validate_success_leaves_cache_untouched() {
    let h = Harness::new();
    let id = h.define(hashed_lookup(1));
    h.runtime.validate(id, CallKind::Function).unwrap();
    assert!(h.runtime.cached_descriptor(id).is_none());
    assert_eq!(h.runtime.stats().functions, 0);
}

#[test]
fn unknown_cluster_is_not_found() {
    let h = Harness::new();
    let id = h.define(function_def(1, "f", &[], BuiltinTypes::TEXT, "nowhere", RunOnRule::Any));
    let err = h.runtime.validate(id, CallKind::Function).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
}

#[test]
fn edited_definition_is_recompiled() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "where_am_i", BuiltinTypes::TEXT, 0));
    h.transport
        .respond(|stmt| Reply::value(&format!("node{}", node_of(stmt.address))));

    let out = h.runtime.call_handler(&TestCall::new(id)).unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("node0")));
    h.runtime.end_transaction(true).unwrap();
    let before = h.runtime.cached_descriptor(id).unwrap();
    assert_eq!(h.store.load_count(), 1);

    // Unchanged definition: served from cache.
    h.runtime.call_handler(&TestCall::new(id)).unwrap();
    h.runtime.end_transaction(true).unwrap();
    assert_eq!(h.store.load_count(), 1);

    h.store.update(fixed_node(1, "where_am_i", BuiltinTypes::TEXT, 3));
    let out = h.runtime.call_handler(&TestCall::new(id)).unwrap();
    assert_eq!(out, CallOutput::Value(Value::from("node3")));
    assert_eq!(h.store.load_count(), 2);

    let after = h.runtime.cached_descriptor(id).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    // The superseded descriptor stays usable by whoever still holds it.
    assert_eq!(before.name(), "where_am_i");
    assert_ne!(before.stamp(), after.stamp());
}

#[test]
fn type_change_forces_recompile() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "f", BuiltinTypes::TEXT, 0));
    h.transport.respond(|_| Reply::value("v"));

    h.runtime.call_handler(&TestCall::new(id)).unwrap();
    let loads = h.types.load_count();
    h.types.touch(BuiltinTypes::TEXT);
    h.runtime.call_handler(&TestCall::new(id)).unwrap();

    assert_eq!(h.store.load_count(), 2);
    assert!(h.types.load_count() > loads);
}

#[test]
fn dropped_definition_is_not_found() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "f", BuiltinTypes::TEXT, 0));
    h.transport.respond(|_| Reply::value("v"));
    h.runtime.call_handler(&TestCall::new(id)).unwrap();

    h.store.remove(id);
    let err = h.runtime.call_handler(&TestCall::new(id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
}

#[test]
fn cluster_edits_apply_after_explicit_eviction() {
    let h = Harness::new();
    let id = h.define(fixed_node(1, "f", BuiltinTypes::TEXT, 3));
    h.transport.respond(|_| Reply::value("v"));
    h.runtime.call_handler(&TestCall::new(id)).unwrap();
    h.runtime.end_transaction(true).unwrap();

    h.catalog.update(cluster_def("shard1", 2));
    // Cached cluster stays in effect until evicted.
    assert!(h.runtime.call_handler(&TestCall::new(id)).is_ok());
    h.runtime.end_transaction(true).unwrap();

    assert_eq!(h.runtime.evict_stale_clusters().unwrap(), 1);
    assert_eq!(h.runtime.evict_stale_clusters().unwrap(), 0);
    let err = h.runtime.call_handler(&TestCall::new(id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
}

#[test]
fn clear_caches_reloads_everything() {
    let h = Harness::new();
    let id = h.define(hashed_lookup(1));
    h.transport.respond(|_| Reply::value("v"));
    let call = TestCall::new(id).with_args(vec![Value::Int(1)]);
    h.runtime.call_handler(&call).unwrap();
    h.runtime.end_transaction(true).unwrap();
    let cluster_loads = h.catalog.load_count();

    h.runtime.clear_caches();
    let stats = h.runtime.stats();
    assert_eq!((stats.clusters, stats.functions, stats.types), (0, 0, 0));
    assert_eq!(stats.connections, 1);

    h.runtime.call_handler(&call).unwrap();
    assert_eq!(h.store.load_count(), 2);
    assert_eq!(h.catalog.load_count(), cluster_loads + 1);
    assert_eq!(h.transport.connects(), 1);
}
