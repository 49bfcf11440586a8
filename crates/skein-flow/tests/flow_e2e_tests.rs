//! End-to-end runs through the Manager against in-memory and disk
//! stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tempfile::tempdir;
use uuid::Uuid;

use skein_core::{FileStore, JobStore, MemoryStore};
use skein_flow::{
    Flow, FlowError, FunctionRegistry, FunctionToken, Job, JobState, Manager, Response, RunLogger,
};

fn add_token() -> FunctionToken {
    FunctionToken::new("math", "add")
}

/// Registry with the arithmetic helpers the scenarios share.
fn test_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("math", "add", |inv| {
        let total: i64 = inv.args.iter().filter_map(Value::as_i64).sum();
        Ok(json!(total).into())
    });
    registry.register("math", "sq", |inv| {
        let x = inv.args[0].as_i64().unwrap_or(0);
        Ok(json!(x * x).into())
    });
    registry.register("math", "make_dict", |_| Ok(json!({"x": 4, "y": 5}).into()));
    registry.register("math", "make_list", |inv| {
        let n = inv.args[0].as_i64().unwrap_or(0);
        Ok(json!([n, n, n]).into())
    });
    registry.register("math", "sum", |inv| {
        fn total(value: &Value) -> i64 {
            match value {
                Value::Number(n) => n.as_i64().unwrap_or(0),
                Value::Array(items) => items.iter().map(total).sum(),
                _ => 0,
            }
        }
        Ok(json!(inv.args.iter().map(total).sum::<i64>()).into())
    });
    registry
}

fn add_job(args: Vec<Value>) -> Job {
    Job::new(add_token(), args, Map::new())
}

fn memory_manager(registry: FunctionRegistry) -> Manager {
    Manager::new(JobStore::new(Box::new(MemoryStore::new())), registry)
}

fn latest_output(manager: &Manager, uuid: Uuid) -> Option<(u32, Value)> {
    manager
        .store()
        .get_output_doc(uuid, true)
        .unwrap()
        .map(|doc| (doc.index, doc.output))
}

#[test]
fn test_two_step_addition() {
    let j1 = add_job(vec![json!(1), json!(2)]);
    let j2 = add_job(vec![j1.output().to_value(), json!(3)]);
    let (u1, u2) = (j1.uuid, j2.uuid);
    let flow = Flow::new("two-step", vec![j1.into(), j2.into()]).unwrap();

    let mut manager = memory_manager(test_registry());
    let outcome = manager.run(flow).unwrap();

    assert!(outcome.is_success());
    assert_eq!(latest_output(&manager, u1), Some((1, json!(3))));
    assert_eq!(latest_output(&manager, u2), Some((1, json!(6))));
}

#[test]
fn test_output_selector_narrows_the_upstream_value() {
    let j1 = Job::new(FunctionToken::new("math", "make_dict"), vec![], Map::new());
    let j2 = Job::new(
        FunctionToken::new("math", "sq"),
        vec![j1.output().attr("x").to_value()],
        Map::new(),
    );
    let u2 = j2.uuid;
    let flow = Flow::new("selector", vec![j1.into(), j2.into()]).unwrap();

    let mut manager = memory_manager(test_registry());
    let outcome = manager.run(flow).unwrap();

    assert!(outcome.is_success());
    assert_eq!(latest_output(&manager, u2), Some((1, json!(16))));
}

#[test]
fn test_replace_grafts_a_flow_over_the_job() {
    let mut registry = test_registry();
    registry.register("math", "expand", |inv| {
        let items = inv.args[0].as_array().cloned().unwrap_or_default();
        let members = items
            .into_iter()
            .map(|item| add_job(vec![item, json!(1)]).into())
            .collect();
        let replacement = Flow::new("expanded", members)?;
        Ok(Response::replace(replacement).into())
    });

    let j = Job::new(
        FunctionToken::new("math", "make_list"),
        vec![json!(2)],
        Map::new(),
    );
    let k = Job::new(
        FunctionToken::new("math", "expand"),
        vec![j.output().to_value()],
        Map::new(),
    );
    let (ju, ku) = (j.uuid, k.uuid);
    let flow = Flow::new("replace", vec![j.into(), k.into()]).unwrap();

    let mut manager = memory_manager(registry);
    let outcome = manager.run(flow).unwrap();
    assert!(outcome.is_success());

    // The original list output is untouched.
    assert_eq!(latest_output(&manager, ju), Some((1, json!([2, 2, 2]))));
    // The replaced job's uuid is now rooted in the graft's leaf; its own
    // document is shadowed, not deleted.
    assert_eq!(latest_output(&manager, ku), Some((2, json!(3))));
    let shadowed = manager
        .store()
        .get_output_doc_at(ku, 1, true)
        .unwrap()
        .unwrap();
    assert_eq!(shadowed.output, Value::Null);
    // All three grafted additions ran and produced 3.
    let graft_outputs: Vec<&Value> = outcome
        .responses
        .values()
        .flat_map(|by_index| by_index.values())
        .filter_map(|response| response.output.as_ref())
        .filter(|output| **output == json!(3))
        .collect();
    assert_eq!(graft_outputs.len(), 3);
}

#[test]
fn test_detour_runs_before_dependents() {
    let mut registry = test_registry();
    registry.register("math", "inspect", |_| {
        Ok(Response::detour(add_job(vec![json!(3), json!(4)])).into())
    });

    let j1 = add_job(vec![json!(1), json!(2)]);
    let j2 = Job::new(
        FunctionToken::new("math", "inspect"),
        vec![j1.output().to_value()],
        Map::new(),
    );
    let j3 = add_job(vec![j2.output().to_value()]);
    let (u1, u2, u3) = (j1.uuid, j2.uuid, j3.uuid);
    let flow = Flow::new("detour", vec![j1.into(), j2.into(), j3.into()]).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut manager = memory_manager(registry).with_updates(tx);
    let outcome = manager.run(flow).unwrap();
    assert!(outcome.is_success());

    // The dependent observed the detour's output in place of j2's.
    assert_eq!(latest_output(&manager, u2), Some((2, json!(7))));
    assert_eq!(latest_output(&manager, u3), Some((1, json!(7))));

    let completions: Vec<(Uuid, u32)> = rx
        .try_iter()
        .filter(|update| matches!(update.state, JobState::Completed))
        .map(|update| (update.uuid, update.index))
        .collect();
    assert_eq!(completions, vec![(u1, 1), (u2, 1), (u2, 2), (u3, 1)]);
}

#[test]
fn test_stop_children_skips_dependents() {
    let mut registry = test_registry();
    registry.register("math", "stopper", |_| {
        Ok(Response::from_value(json!(0)).with_stop_children().into())
    });

    let j1 = add_job(vec![json!(1)]);
    let j2 = Job::new(
        FunctionToken::new("math", "stopper"),
        vec![j1.output().to_value()],
        Map::new(),
    );
    let j3 = add_job(vec![j2.output().to_value()]);
    let (u1, u3) = (j1.uuid, j3.uuid);
    let flow = Flow::new("stop-children", vec![j1.into(), j2.into(), j3.into()]).unwrap();

    let mut manager = memory_manager(registry);
    let outcome = manager.run(flow).unwrap();

    assert!(outcome.is_success());
    assert!(latest_output(&manager, u1).is_some());
    assert_eq!(latest_output(&manager, u3), None);
    assert!(outcome.skipped.contains(&u3));
    assert!(!outcome.responses.contains_key(&u3));
}

#[test]
fn test_stop_jobflow_ends_the_run() {
    let mut registry = test_registry();
    registry.register("math", "halt", |_| {
        Ok(Response::from_value(json!("stopping")).with_stop_jobflow().into())
    });

    let j1 = Job::new(FunctionToken::new("math", "halt"), vec![], Map::new());
    let j2 = add_job(vec![json!(1)]);
    let u2 = j2.uuid;
    let flow = Flow::new("halt", vec![j1.into(), j2.into()]).unwrap();

    let mut manager = memory_manager(registry);
    let outcome = manager.run(flow).unwrap();

    assert!(outcome.is_success());
    // Even independent work stays unexecuted after the stop.
    assert_eq!(latest_output(&manager, u2), None);
}

#[test]
fn test_auxiliary_store_splits_and_reconstructs() {
    let mut registry = test_registry();
    registry.register("math", "payload", |_| {
        Ok(json!({"small": 1, "data": {"rows": [1, 2, 3, 4, 5, 6, 7, 8]}}).into())
    });

    let job = Job::new(FunctionToken::new("math", "payload"), vec![], Map::new());
    let uuid = job.uuid;
    let flow = Flow::new("split", vec![job.into()]).unwrap();

    let store = JobStore::new(Box::new(MemoryStore::new())).with_additional(
        "data",
        "aux",
        Box::new(MemoryStore::new()),
    );
    let mut manager = Manager::new(store, registry);
    let outcome = manager.run(flow).unwrap();
    assert!(outcome.is_success());

    let stubbed = manager.store().get_output_doc(uuid, false).unwrap().unwrap();
    assert_eq!(stubbed.output["small"], 1);
    assert_eq!(stubbed.output["data"]["store"], "aux");
    assert!(stubbed.output["data"]["blob_uuid"].is_string());

    let loaded = manager.store().get_output_doc(uuid, true).unwrap().unwrap();
    assert_eq!(
        loaded.output,
        json!({"small": 1, "data": {"rows": [1, 2, 3, 4, 5, 6, 7, 8]}})
    );
}

#[test]
fn test_failure_skips_dependents_and_surfaces_partial_success() {
    let mut registry = test_registry();
    registry.register("math", "boom", |_| {
        anyhow::bail!("deliberate failure")
    });

    let j1 = Job::new(FunctionToken::new("math", "boom"), vec![], Map::new());
    let j2 = add_job(vec![j1.output().to_value()]);
    let j3 = add_job(vec![json!(20), json!(22)]);
    let (u1, u2, u3) = (j1.uuid, j2.uuid, j3.uuid);
    let flow = Flow::new("partial", vec![j1.into(), j2.into(), j3.into()]).unwrap();

    let mut manager = memory_manager(registry);
    let outcome = manager.run(flow).unwrap();

    assert!(matches!(
        outcome.error,
        Some(FlowError::Execution { uuid, .. }) if uuid == u1
    ));
    assert!(outcome.skipped.contains(&u2));
    // Independent work still completed.
    assert_eq!(latest_output(&manager, u3), Some((1, json!(42))));
}

#[test]
fn test_each_job_runs_at_most_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let mut registry = test_registry();
    registry.register("math", "count", move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(json!(1).into())
    });

    let a = Job::new(FunctionToken::new("math", "count"), vec![], Map::new());
    let b = Job::new(
        FunctionToken::new("math", "count"),
        vec![a.output().to_value()],
        Map::new(),
    );
    let c = Job::new(
        FunctionToken::new("math", "count"),
        vec![a.output().to_value(), b.output().to_value()],
        Map::new(),
    );
    let flow = Flow::new("diamond", vec![a.into(), b.into(), c.into()]).unwrap();

    let mut manager = memory_manager(registry);
    let outcome = manager.run(flow).unwrap();

    assert!(outcome.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    for by_index in outcome.responses.values() {
        assert_eq!(by_index.len(), 1);
    }
}

#[test]
fn test_runs_against_a_disk_store() {
    let dir = tempdir().unwrap();
    let j1 = add_job(vec![json!(5), json!(6)]);
    let j2 = add_job(vec![j1.output().to_value(), json!(100)]);
    let u2 = j2.uuid;
    let flow = Flow::new("disk", vec![j1.into(), j2.into()]).unwrap();

    let store = JobStore::new(Box::new(FileStore::new(dir.path())));
    let mut manager = Manager::new(store, test_registry())
        .with_logger(RunLogger::new(dir.path()).unwrap());
    let outcome = manager.run(flow).unwrap();
    assert!(outcome.is_success());

    // A fresh store handle over the same directory sees the outputs.
    let reopened = JobStore::new(Box::new(FileStore::new(dir.path())));
    let doc = reopened.get_output_doc(u2, true).unwrap().unwrap();
    assert_eq!(doc.output, json!(111));

    // The run left a log behind.
    let log_entries: Vec<_> = std::fs::read_dir(dir.path().join("logs")).unwrap().collect();
    assert_eq!(log_entries.len(), 1);
}

#[test]
fn test_flow_outputs_compose_into_downstream_flows() {
    // A flow's output expression, embedded into a later job's args, wires
    // the member references straight through.
    let a = add_job(vec![json!(1), json!(1)]);
    let b = add_job(vec![json!(2), json!(2)]);
    let pair_output = json!([a.output().to_value(), b.output().to_value()]);
    let pair = Flow::new("pair", vec![a.into(), b.into()])
        .unwrap()
        .with_output(pair_output.clone());

    let combine = Job::new(FunctionToken::new("math", "sum"), vec![pair_output], Map::new());
    let cu = combine.uuid;
    let mut outer = Flow::new("outer", vec![pair.into()]).unwrap();
    outer.add(combine).unwrap();

    let mut manager = memory_manager(test_registry());
    let outcome = manager.run(outer).unwrap();
    assert!(outcome.is_success());
    assert_eq!(latest_output(&manager, cu), Some((1, json!(6))));
}

#[test]
fn test_references_resolvable_from_the_store_may_point_outside_the_flow() {
    let mut manager = memory_manager(test_registry());

    // First run produces an output a later flow consumes.
    let seed = add_job(vec![json!(10), json!(11)]);
    let seed_ref = seed.output();
    let first = Flow::new("seed", vec![seed.into()]).unwrap();
    assert!(manager.run(first).unwrap().is_success());

    let consumer = add_job(vec![seed_ref.to_value(), json!(1)]);
    let cu = consumer.uuid;
    let second = Flow::new("consumer", vec![consumer.into()]).unwrap();
    let outcome = manager.run(second).unwrap();

    assert!(outcome.is_success());
    assert_eq!(latest_output(&manager, cu), Some((1, json!(22))));
}
