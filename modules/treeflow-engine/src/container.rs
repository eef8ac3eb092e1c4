//! The container: one indexed component tree plus everything needed to
//! evolve it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::arena::Arena;
use crate::collector::{NoopCollector, ResultCollector};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notify::{ConsumerId, ConsumerRegistry, EvolveConsumer, InlineSink, NotificationSink};
use crate::parser::ContainerParser;
use crate::propagation::CycleReport;
use crate::resolver;
use crate::types::{key, ComponentUid, Key, NodeIndex, Path, Reason};
use crate::view::{ComponentRef, ContainerAccessor};
use crate::worklist::Worklist;

/// Nodes and components that have been through their first evaluation
/// during the current initialization sweep.
#[derive(Debug, Default)]
pub(crate) struct InitState {
    pub(crate) nodes: HashSet<NodeIndex>,
    pub(crate) components: HashSet<ComponentUid>,
}

pub struct Container {
    pub(crate) id: String,
    pub(crate) config: EngineConfig,
    pub(crate) parser: Box<dyn ContainerParser>,
    pub(crate) collector: Box<dyn ResultCollector>,
    pub(crate) sink: Box<dyn NotificationSink>,
    pub(crate) arena: Arena,
    pub(crate) consumers: ConsumerRegistry,
    pub(crate) worklist: Worklist,
    /// `Some` only while an initialization sweep runs.
    pub(crate) init: Option<InitState>,
    root: ComponentUid,
    init_report: CycleReport,
}

/// Assembles a [`Container`]; [`ContainerBuilder::build`] indexes and
/// initializes the tree.
pub struct ContainerBuilder {
    id: String,
    config: EngineConfig,
    parser: Box<dyn ContainerParser>,
    collector: Box<dyn ResultCollector>,
    sink: Box<dyn NotificationSink>,
}

impl ContainerBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_collector(mut self, collector: impl ResultCollector + 'static) -> Self {
        self.collector = Box::new(collector);
        self
    }

    pub fn with_sink(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Index `root_def`, resolve every dependency and run the initial
    /// evaluation of each component.
    pub fn build(self, root_def: &Value) -> EngineResult<Container> {
        let root_id = self
            .parser
            .component_id(root_def)
            .ok_or_else(|| EngineError::MalformedDefinition {
                path: Path::new(),
                reason: "root definition has no id".to_string(),
            })?;
        let capacity = self
            .config
            .initial_worklist_capacity
            .max(self.parser.total_node_count(root_def));

        let mut container = Container {
            id: self.id,
            config: self.config,
            parser: self.parser,
            collector: self.collector,
            sink: self.sink,
            arena: Arena::new(),
            consumers: ConsumerRegistry::default(),
            worklist: Worklist::with_capacity(capacity),
            init: None,
            root: ComponentUid(0),
            init_report: CycleReport::default(),
        };

        let mut added = Vec::new();
        container.root = container.index_subtree(None, Path::root(root_id), root_def, &mut added)?;
        info!(
            container = %container.id,
            components = container.arena.component_count(),
            nodes = container.arena.node_count(),
            "Container indexed"
        );

        container.link_components(&added);
        let mut report = CycleReport::new(container.root);
        container.initialize_components(added, &mut report)?;
        debug!(
            container = %container.id,
            evaluated = report.evaluated,
            initialized = report.initialized.len(),
            "Container initialized"
        );
        container.init_report = report;
        Ok(container)
    }
}

impl Container {
    pub fn builder(id: impl Into<String>, parser: impl ContainerParser + 'static) -> ContainerBuilder {
        ContainerBuilder {
            id: id.into(),
            config: EngineConfig::default(),
            parser: Box::new(parser),
            collector: Box::new(NoopCollector),
            sink: Box::new(InlineSink),
        }
    }

    // -----------------------------------------------------------------------
    // Indexing
    // -----------------------------------------------------------------------

    /// Index a raw definition and its descendants. Every new component is
    /// appended to `added`, parents before children.
    pub(crate) fn index_subtree(
        &mut self,
        parent: Option<ComponentUid>,
        path: Path,
        raw: &Value,
        added: &mut Vec<ComponentUid>,
    ) -> EngineResult<ComponentUid> {
        let uid = self.arena.add_component(parent, path.clone());
        added.push(uid);
        self.collector.component_added(parent, uid);

        for mut descriptor in self.parser.process_component(&path, raw)? {
            if descriptor.children {
                descriptor.initial = filter_children(&self.config, &path, descriptor.initial)?;
            }
            self.arena.add_node(uid, descriptor)?;
        }

        let children = self
            .parser
            .children_property()
            .and_then(|property| raw.get(property))
            .and_then(Value::as_object);
        if let Some(children) = children {
            for (child_key, child_raw) in children {
                if self.config.is_transient_child(child_key) {
                    continue;
                }
                let id = self.parser.component_id(child_raw).unwrap_or_else(|| key(child_key));
                let child = self.index_subtree(Some(uid), path.child(id.clone()), child_raw, added)?;
                self.arena.attach_child(uid, id, child);
            }
        }
        Ok(uid)
    }

    /// Resolve dependencies of every node in `added`, then give ambiguous and
    /// dangling nodes elsewhere a chance to reach the new nodes.
    pub(crate) fn link_components(&mut self, added: &[ComponentUid]) {
        let nodes: Vec<NodeIndex> = added.iter().flat_map(|&uid| self.arena.nodes_of(uid)).collect();
        let linked = resolver::link_nodes(&mut self.arena, &nodes);
        let relinked = resolver::rewalk(&mut self.arena);
        debug!(
            container = %self.id,
            components = added.len(),
            linked,
            relinked,
            "Linked components"
        );
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn root(&self) -> ComponentUid {
        self.root
    }

    pub fn component_uid(&self, path: &[Key]) -> Option<ComponentUid> {
        self.arena.component_uid(path)
    }

    pub fn component(&self, uid: ComponentUid) -> Option<ComponentRef<'_>> {
        ContainerAccessor::component(&self.arena, uid)
    }

    /// Node index for a full node path (component path plus property id).
    pub fn index_of_path(&self, node_path: &[Key]) -> Option<NodeIndex> {
        self.arena.node_index(node_path)
    }

    pub fn property_value(&self, index: NodeIndex) -> Option<&Value> {
        self.arena.value(index)
    }

    pub fn property(&self, component_path: &[Key], property: &str) -> Option<&Value> {
        let uid = self.arena.component_uid(component_path)?;
        self.component(uid)?.property(property)
    }

    /// Every live node path, sorted.
    pub fn all_node_paths(&self) -> Vec<Path> {
        let mut paths: Vec<Path> = self.arena.node_paths().map(|(path, _)| path.clone()).collect();
        paths.sort();
        paths
    }

    /// Every live value keyed by node path.
    pub fn values(&self) -> BTreeMap<Path, Value> {
        self.arena
            .node_paths()
            .filter_map(|(path, &index)| self.arena.value(index).map(|v| (path.clone(), v.clone())))
            .collect()
    }

    pub fn dependencies_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.arena
            .node(index)
            .map(|n| n.dependencies.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.arena
            .node(index)
            .map(|n| n.dependents.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether some evolving node of the component would be seeded for `reason`.
    pub fn is_interested_in(&self, uid: ComponentUid, reason: &Reason) -> bool {
        self.arena.nodes_of(uid).into_iter().any(|index| {
            self.arena
                .node(index)
                .is_some_and(|n| n.evolver.is_some() && self.parser.is_interested_in(&n.interests, reason))
        })
    }

    pub fn component_count(&self) -> usize {
        self.arena.component_count()
    }

    pub fn node_count(&self) -> usize {
        self.arena.node_count()
    }

    /// Largest worklist any cycle has needed so far.
    pub fn worklist_high_water(&self) -> usize {
        self.worklist.high_water()
    }

    /// Report of the initialization run by [`ContainerBuilder::build`].
    pub fn initialization_report(&self) -> &CycleReport {
        &self.init_report
    }

    // -----------------------------------------------------------------------
    // Consumers
    // -----------------------------------------------------------------------

    /// Watch `properties` of the component at `component_path`. Properties
    /// are resolved once, now.
    pub fn add_evolve_consumer(
        &mut self,
        component_path: &Path,
        properties: &[&str],
        consumer: Arc<dyn EvolveConsumer>,
    ) -> ConsumerId {
        let id = self.consumers.register(&self.arena, component_path, properties, consumer);
        debug!(container = %self.id, consumer = %id, component = %component_path, "Evolve consumer added");
        id
    }

    pub fn remove_evolve_consumer(&mut self, id: ConsumerId) -> bool {
        self.consumers.unregister(id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

impl ContainerAccessor for Container {
    fn root(&self) -> Option<ComponentUid> {
        self.arena.root()
    }

    fn component(&self, uid: ComponentUid) -> Option<ComponentRef<'_>> {
        Container::component(self, uid)
    }

    fn component_uid(&self, path: &[Key]) -> Option<ComponentUid> {
        self.arena.component_uid(path)
    }

    fn value(&self, index: NodeIndex) -> Option<&Value> {
        self.arena.value(index)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("components", &self.arena.component_count())
            .field("nodes", &self.arena.node_count())
            .finish()
    }
}

/// Children values are maps; transient entries never become components.
pub(crate) fn filter_children(config: &EngineConfig, path: &Path, value: Value) -> EngineResult<Value> {
    match value {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(mut children) => {
            children.retain(|id, _| !config.is_transient_child(id));
            Ok(Value::Object(children))
        }
        other => Err(EngineError::MalformedDefinition {
            path: path.clone(),
            reason: format!("children must be a map, got {other}"),
        }),
    }
}
