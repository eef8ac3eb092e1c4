//! Integration tests for evolve cycles over JSON component trees.
//! No I/O: collectors and sinks record in memory.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use treeflow_engine::{
    CollectorEvent, ComponentUid, Container, EngineConfig, EngineError, EvolveConsumer, EvolveResult,
    EvolverRegistry, EvolverSpec, JsonContainerParser, Path, Reason, RecordingCollector, RecordingSink,
};

// ---------------------------------------------------------------------------
// Evolvers
// ---------------------------------------------------------------------------

/// Takes the payload of an input on `channel`; keeps its value otherwise.
/// A `"boom"` payload fails.
fn take_payload(channel: &str) -> EvolverSpec {
    EvolverSpec::new(|view| match view.reason() {
        Some(Reason::Input(event)) if event.payload == json!("boom") => Err(anyhow!("refusing boom")),
        Some(Reason::Input(event)) => Ok(event.payload.clone()),
        _ => Ok(view.current().cloned().unwrap_or(Value::Null)),
    })
    .interested_in(channel)
}

fn plus_one(property: &'static str) -> EvolverSpec {
    EvolverSpec::new(move |view| {
        let base = view.own(property).and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(base + 1))
    })
    .depends_on(&["this", property])
}

fn registry() -> EvolverRegistry {
    EvolverRegistry::new()
        .with("from-host", take_payload("host"))
        .with("edit-children", take_payload("edit"))
        .with("reorder", take_payload("reorder"))
        .with("x-plus-one", plus_one("x"))
        .with("shadow-plus-one", plus_one("shadow"))
        .with(
            "sum-v",
            EvolverSpec::new(|view| {
                let total: i64 = view
                    .values_at(&["this", "*", "v"])
                    .into_iter()
                    .filter_map(Value::as_i64)
                    .sum();
                Ok(json!(total))
            })
            .depends_on(&["this", "*", "v"]),
        )
        .with(
            "cause",
            EvolverSpec::new(|view| {
                let cause = view.reason().and_then(Reason::cause).map(|c| c.to_string());
                Ok(json!(cause))
            })
            .depends_on(&["this", "*", "v"]),
        )
        .with(
            "a-v-plus-one",
            EvolverSpec::new(|view| {
                let base = view.value_at(&["a", "v"]).and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(base + 1))
            })
            .depends_on(&["a", "v"]),
        )
        .with(
            "echo",
            EvolverSpec::new(|view| Ok(view.reason().and_then(Reason::payload).cloned().unwrap_or(Value::Null))),
        )
}

fn parser() -> JsonContainerParser {
    JsonContainerParser::new(registry())
        .with_child_order("order")
        .with_channel("edit")
        .with_channel("reorder")
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

fn xy_tree() -> Value {
    json!({
        "id": "root",
        "x": 1,
        "y": 0,
        "evolvers": {"x": "from-host", "y": "x-plus-one"}
    })
}

fn child(id: &str, v: i64) -> Value {
    json!({"id": id, "v": v, "evolvers": {"v": "from-host"}})
}

fn panel_tree() -> Value {
    json!({
        "id": "root",
        "children": {
            "panel": {
                "id": "panel",
                "total": 0,
                "cause": null,
                "order": ["a", "b"],
                "children": {"a": child("a", 1), "b": child("b", 2)},
                "evolvers": {
                    "total": "sum-v",
                    "cause": "cause",
                    "children": "edit-children",
                    "order": "reorder"
                }
            }
        }
    })
}

/// `s.y` depends on its sibling `a` by name; root's children are editable.
fn sibling_tree() -> Value {
    json!({
        "id": "root",
        "children": {
            "a": child("a", 1),
            "s": {"id": "s", "y": 0, "evolvers": {"y": "a-v-plus-one"}}
        },
        "evolvers": {"children": "edit-children"}
    })
}

fn sibling_children(a: Option<i64>) -> Value {
    let s = json!({"id": "s", "y": 0, "evolvers": {"y": "a-v-plus-one"}});
    match a {
        Some(v) => json!({"a": child("a", v), "s": s}),
        None => json!({"s": s}),
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    container: Container,
    collector: Arc<RecordingCollector>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(def: Value) -> Self {
        Self::with_config(def, EngineConfig::default())
    }

    fn with_config(def: Value, config: EngineConfig) -> Self {
        init_logging();
        let collector = Arc::new(RecordingCollector::new());
        let sink = Arc::new(RecordingSink::new());
        let container = Container::builder("test", parser())
            .with_config(config)
            .with_collector(collector.clone())
            .with_sink(sink.clone())
            .build(&def)
            .expect("tree should build");
        Self {
            container,
            collector,
            sink,
        }
    }

    fn value(&self, component: &str, property: &str) -> Value {
        self.container
            .property(&Path::parse(component), property)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn uid(&self, component: &str) -> ComponentUid {
        self.container
            .component_uid(&Path::parse(component))
            .unwrap_or_else(|| panic!("{component} should exist"))
    }

    fn evolve(&mut self, component: &str, channel: &str, payload: Value) -> treeflow_engine::EngineResult<treeflow_engine::CycleReport> {
        self.container
            .evolve_path(&Path::parse(component), Reason::input(channel, payload))
    }

    fn watch(&mut self, component: &str, properties: &[&str]) -> treeflow_engine::ConsumerId {
        self.container
            .add_evolve_consumer(&Path::parse(component), properties, Arc::new(NullConsumer))
    }
}

/// `RUST_LOG=treeflow_engine=trace cargo test` shows every evaluation.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct NullConsumer;

#[async_trait]
impl EvolveConsumer for NullConsumer {
    async fn accept_evolve_result(&self, _result: &EvolveResult) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ChannelConsumer(mpsc::UnboundedSender<EvolveResult>);

#[async_trait]
impl EvolveConsumer for ChannelConsumer {
    async fn accept_evolve_result(&self, result: &EvolveResult) -> anyhow::Result<()> {
        self.0.send(result.clone()).map_err(|e| anyhow!("receiver gone: {e}"))
    }
}

struct FailingConsumer;

#[async_trait]
impl EvolveConsumer for FailingConsumer {
    async fn accept_evolve_result(&self, _result: &EvolveResult) -> anyhow::Result<()> {
        Err(anyhow!("consumer exploded"))
    }
}

fn assert_edges_symmetric(container: &Container) {
    for path in container.all_node_paths() {
        let index = container.index_of_path(&path).expect("listed path resolves");
        for dependency in container.dependencies_of(index) {
            assert!(
                container.dependents_of(dependency).contains(&index),
                "{path} depends on {dependency} without a back edge"
            );
        }
        for dependent in container.dependents_of(index) {
            assert!(
                container.dependencies_of(dependent).contains(&index),
                "{dependent} is a dependent of {path} without a forward edge"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

#[test]
fn initialization_evaluates_every_evolver() {
    let h = Harness::new(xy_tree());

    assert_eq!(h.value("root", "x"), json!(1));
    assert_eq!(h.value("root", "y"), json!(2));
    assert_eq!(h.container.initialization_report().initialized, vec![h.uid("root")]);
}

#[test]
fn input_change_reaches_dependents_with_one_notification() {
    let mut h = Harness::new(xy_tree());
    let consumer = h.watch("root", &["x", "y"]);

    let report = h.evolve("root", "host", json!(5)).unwrap();

    assert_eq!(h.value("root", "x"), json!(5));
    assert_eq!(h.value("root", "y"), json!(6));
    assert_eq!(report.changed, 2);

    let results = h.sink.results_for(consumer);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].properties.get("x"), Some(&json!(5)));
    assert_eq!(results[0].properties.get("y"), Some(&json!(6)));
    assert_eq!(results[0].container_id, "test");
}

#[test]
fn repeating_an_input_changes_nothing() {
    let mut h = Harness::new(xy_tree());
    h.watch("root", &["x", "y"]);

    h.evolve("root", "host", json!(5)).unwrap();
    let before = h.container.values();
    let report = h.evolve("root", "host", json!(5)).unwrap();

    assert_eq!(report.changed, 0);
    assert_eq!(report.notified, 0);
    assert_eq!(h.container.values(), before);
    assert_eq!(h.sink.results().len(), 1);
}

#[test]
fn known_channels_only_reach_interested_nodes() {
    let mut h = Harness::new(json!({
        "id": "root",
        "x": 1,
        "echo": null,
        "evolvers": {"x": "from-host", "echo": "echo"}
    }));

    let report = h.evolve("root", "mouse", json!({"button": 1})).unwrap();
    // Only the passive `id` node runs, as a no-op.
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.changed, 0);
    assert!(!h.container.is_interested_in(h.uid("root"), &Reason::input("mouse", Value::Null)));

    // Unknown channels pass through to every evolver.
    h.evolve("root", "telemetry", json!(7)).unwrap();
    assert_eq!(h.value("root", "echo"), json!(7));
    assert_eq!(h.value("root", "x"), json!(7));
}

#[test]
fn dependency_edges_are_symmetric() {
    let h = Harness::new(panel_tree());
    assert_edges_symmetric(&h.container);

    let total = h.container.index_of_path(&Path::parse("root/panel/total")).unwrap();
    let a_v = h.container.index_of_path(&Path::parse("root/panel/a/v")).unwrap();
    let b_v = h.container.index_of_path(&Path::parse("root/panel/b/v")).unwrap();
    assert_eq!(h.container.dependencies_of(total), vec![a_v, b_v]);
}

#[test]
fn dependents_see_the_concrete_cause() {
    let mut h = Harness::new(panel_tree());
    assert_eq!(h.value("root/panel", "total"), json!(3));

    h.evolve("root/panel/b", "host", json!(7)).unwrap();

    assert_eq!(h.value("root/panel", "total"), json!(8));
    assert_eq!(h.value("root/panel", "cause"), json!("[this b]"));
}

#[test]
fn failed_cycle_leaves_tree_usable() {
    let mut h = Harness::new(xy_tree());
    let consumer = h.watch("root", &["y"]);

    let err = h.evolve("root", "host", json!("boom")).unwrap_err();
    assert!(matches!(err, EngineError::Evolver { ref property, .. } if property == "x"));
    assert!(!err.is_invariant_violation());
    assert_eq!(h.value("root", "x"), json!(1));
    assert!(h.sink.results().is_empty());

    h.evolve("root", "host", json!(5)).unwrap();
    assert_eq!(h.value("root", "y"), json!(6));
    assert_eq!(h.sink.results_for(consumer).len(), 1);
}

#[test]
fn unknown_targets_are_rejected() {
    let mut h = Harness::new(xy_tree());

    let err = h
        .container
        .evolve(ComponentUid(999), Reason::input("host", json!(1)))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownComponent { .. }));

    let err = h.evolve("root/nope", "host", json!(1)).unwrap_err();
    assert!(matches!(err, EngineError::UnknownComponent { path } if path == "root/nope"));
}

// ---------------------------------------------------------------------------
// Structure
// ---------------------------------------------------------------------------

#[test]
fn new_children_join_wildcard_dependencies() {
    let mut h = Harness::new(panel_tree());
    let panel = h.uid("root/panel");
    let consumer = h.watch("root/panel", &["total"]);

    let report = h
        .evolve(
            "root/panel",
            "edit",
            json!({"a": child("a", 1), "b": child("b", 2), "c": child("c", 10)}),
        )
        .unwrap();

    let c = h.uid("root/panel/c");
    assert_eq!(report.added, vec![c]);
    assert!(report.initialized.contains(&c));
    assert_eq!(h.value("root/panel", "total"), json!(13));

    let total = h.container.index_of_path(&Path::parse("root/panel/total")).unwrap();
    let c_v = h.container.index_of_path(&Path::parse("root/panel/c/v")).unwrap();
    assert!(h.container.dependents_of(c_v).contains(&total));
    assert_eq!(h.container.component(c).unwrap().parent(), Some(panel));

    let totals: Vec<Value> = h
        .sink
        .results_for(consumer)
        .into_iter()
        .filter_map(|r| r.properties.get("total").cloned())
        .collect();
    assert_eq!(totals.last(), Some(&json!(13)));

    h.evolve("root/panel/c", "host", json!(40)).unwrap();
    assert_eq!(h.value("root/panel", "total"), json!(43));
    assert_edges_symmetric(&h.container);
}

#[test]
fn children_swap_removes_and_adds() {
    let mut h = Harness::new(panel_tree());
    let panel = h.uid("root/panel");
    let a = h.uid("root/panel/a");
    let b = h.uid("root/panel/b");
    h.collector.clear();

    let report = h
        .evolve("root/panel", "edit", json!({"b": child("b", 2), "c": child("c", 3)}))
        .unwrap();

    assert!(h.container.component_uid(&Path::parse("root/panel/a")).is_none());
    assert_eq!(h.uid("root/panel/b"), b);
    let c = h.uid("root/panel/c");
    assert_eq!(report.removed, vec![a]);
    assert_eq!(report.added, vec![c]);

    let events = h.collector.events();
    assert!(events.contains(&CollectorEvent::Removed { uid: a }));
    assert!(events.contains(&CollectorEvent::Added {
        parent: Some(panel),
        uid: c
    }));
    assert!(events.contains(&CollectorEvent::Initialized { uid: c }));

    assert_eq!(h.value("root/panel", "total"), json!(5));
    assert!(!h
        .container
        .all_node_paths()
        .iter()
        .any(|p| p.to_string().starts_with("root/panel/a/")));
    assert_eq!(h.container.component(panel).unwrap().children(), &[b, c]);
    assert_edges_symmetric(&h.container);
}

#[test]
fn changed_child_definition_is_rebuilt() {
    let mut h = Harness::new(panel_tree());

    h.evolve("root/panel", "edit", json!({"a": child("a", 1), "b": child("b", 20)}))
        .unwrap();

    assert_eq!(h.value("root/panel/b", "v"), json!(20));
    assert_eq!(h.value("root/panel", "total"), json!(21));
    assert_edges_symmetric(&h.container);
}

#[test]
fn redefined_sibling_reconnects_named_dependents() {
    let mut h = Harness::new(sibling_tree());
    assert_eq!(h.value("root/s", "y"), json!(2));
    let old_a = h.uid("root/a");

    let report = h.evolve("root", "edit", sibling_children(Some(5))).unwrap();
    assert_eq!(report.removed, vec![old_a]);
    assert_eq!(h.value("root/s", "y"), json!(6));

    h.evolve("root/a", "host", json!(7)).unwrap();
    assert_eq!(h.value("root/s", "y"), json!(8));

    let y = h.container.index_of_path(&Path::parse("root/s/y")).unwrap();
    let a_v = h.container.index_of_path(&Path::parse("root/a/v")).unwrap();
    assert!(h.container.dependents_of(a_v).contains(&y));
    assert_edges_symmetric(&h.container);
}

#[test]
fn removed_sibling_reconnects_when_added_back() {
    let mut h = Harness::new(sibling_tree());
    let s = h.uid("root/s");

    h.evolve("root", "edit", sibling_children(None)).unwrap();
    assert!(h.container.component_uid(&Path::parse("root/a")).is_none());
    assert_eq!(h.uid("root/s"), s);
    assert_eq!(h.value("root/s", "y"), json!(2));

    h.evolve("root", "edit", sibling_children(Some(3))).unwrap();
    assert_eq!(h.uid("root/s"), s);
    assert_eq!(h.value("root/s", "y"), json!(4));

    h.evolve("root/a", "host", json!(9)).unwrap();
    assert_eq!(h.value("root/s", "y"), json!(10));
    assert_edges_symmetric(&h.container);
}

#[test]
fn child_order_must_be_a_permutation() {
    let mut h = Harness::new(panel_tree());
    let panel = h.uid("root/panel");
    let a = h.uid("root/panel/a");
    let b = h.uid("root/panel/b");

    let err = h.evolve("root/panel", "reorder", json!(["a", "z"])).unwrap_err();
    assert!(matches!(err, EngineError::ChildOrderMismatch { .. }));
    assert!(err.is_invariant_violation());

    h.evolve("root/panel", "reorder", json!(["b", "a"])).unwrap();
    assert_eq!(h.container.component(panel).unwrap().children(), &[b, a]);
}

#[test]
fn unverified_child_order_keeps_every_child() {
    let config = EngineConfig {
        verify_child_order: false,
        ..EngineConfig::default()
    };
    let mut h = Harness::with_config(panel_tree(), config);
    let panel = h.uid("root/panel");
    let a = h.uid("root/panel/a");
    let b = h.uid("root/panel/b");

    h.evolve("root/panel", "reorder", json!(["b", "z"])).unwrap();
    assert_eq!(h.container.component(panel).unwrap().children(), &[b, a]);
}

#[test]
fn transient_children_never_become_components() {
    let h = Harness::new(json!({
        "id": "root",
        "children": {
            "a": child("a", 1),
            "_flexible-childset-added": {"id": "_flexible-childset-added", "v": 0}
        }
    }));

    assert!(h
        .container
        .component_uid(&Path::parse("root/_flexible-childset-added"))
        .is_none());
    let children = h.value("root", "children");
    let ids: Vec<&String> = children.as_object().unwrap().keys().collect();
    assert_eq!(ids, vec!["a"]);
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

#[test]
fn collector_sees_initialization_in_tree_order() {
    let h = Harness::new(panel_tree());
    let events = h.collector.events();

    assert_eq!(
        events.first(),
        Some(&CollectorEvent::Added {
            parent: None,
            uid: h.uid("root")
        })
    );
    let initialized: Vec<ComponentUid> = events
        .iter()
        .filter_map(|e| match e {
            CollectorEvent::Initialized { uid } => Some(*uid),
            _ => None,
        })
        .collect();
    assert_eq!(
        initialized,
        vec![
            h.uid("root"),
            h.uid("root/panel"),
            h.uid("root/panel/a"),
            h.uid("root/panel/b")
        ]
    );
}

#[test]
fn post_process_writes_land_without_propagation() {
    let mut h = Harness::new(json!({
        "id": "root",
        "x": 1,
        "shadow": 0,
        "z": 0,
        "evolvers": {"x": "from-host", "z": "shadow-plus-one"}
    }));
    assert_eq!(h.value("root", "z"), json!(1));
    let consumer = h.watch("root", &["shadow"]);

    h.collector.write_on_post_process(|accessor| {
        let root = accessor.component(accessor.root()?)?;
        let x = root.property("x")?.as_i64()?;
        Some((root.property_index("shadow")?, json!(x * 10)))
    });
    h.evolve("root", "host", json!(5)).unwrap();

    assert_eq!(h.value("root", "shadow"), json!(50));
    assert_eq!(h.value("root", "z"), json!(1));
    let results = h.sink.results_for(consumer);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].properties.get("shadow"), Some(&json!(50)));
    assert!(h.collector.events().contains(&CollectorEvent::PostProcess));
}

#[tokio::test]
async fn inline_sink_delivers_and_isolates_consumer_failures() {
    let mut container = Container::builder("inline", parser()).build(&xy_tree()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    container.add_evolve_consumer(&Path::parse("root"), &["y"], Arc::new(FailingConsumer));
    container.add_evolve_consumer(&Path::parse("root"), &["y"], Arc::new(ChannelConsumer(tx)));

    let report = container
        .evolve_path(&Path::parse("root"), Reason::input("host", json!(5)))
        .unwrap();
    assert_eq!(report.notified, 2);

    let result = rx.recv().await.expect("consumer should receive a result");
    assert_eq!(result.properties.get("y"), Some(&json!(6)));
    assert_eq!(result.reason, Some(Reason::input("host", json!(5))));
}

#[test]
fn consumers_on_missing_properties_watch_what_exists() {
    let mut h = Harness::new(xy_tree());
    let consumer = h.watch("root", &["y", "nope"]);

    h.evolve("root", "host", json!(2)).unwrap();

    let results = h.sink.results_for(consumer);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].properties.len(), 1);
    assert!(h.container.remove_evolve_consumer(consumer));
    assert_eq!(h.container.consumer_count(), 0);
}
