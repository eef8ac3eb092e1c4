//! The evolve cycle: seed, drain, settle.
//!
//! A cycle seeds the target component's interested nodes, then drains the
//! worklist in FIFO order. A node whose value changes enqueues each of its
//! dependents with a reason naming the changed component as the dependent
//! sees it. Children changes restructure the tree mid-cycle; pending work
//! for removed nodes is neutralized. Once drained, the collector's post-cycle
//! hook runs and each consumer with a changed watched property gets one
//! snapshot. Components added during the cycle are then linked and
//! initialized, each in its own cycle.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::container::{filter_children, Container, InitState};
use crate::error::{EngineError, EngineResult};
use crate::parser::ContainerParser;
use crate::types::{key, preview, reason_label, ComponentUid, Key, NodeIndex, Path, Reason};
use crate::view::{ComponentView, PendingWrites};
use crate::worklist::WorkItem;

/// What one call to [`Container::evolve`] did, initialization sub-cycles included.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub target: Option<ComponentUid>,
    /// Evolver calls plus evaluations of evolver-less seeds.
    pub evaluated: usize,
    pub changed: usize,
    /// Worklist entries neutralized by structural removal.
    pub skipped: usize,
    /// Consumer notifications dispatched.
    pub notified: usize,
    pub added: Vec<ComponentUid>,
    pub removed: Vec<ComponentUid>,
    pub initialized: Vec<ComponentUid>,
    pub worklist_high_water: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn new(target: ComponentUid) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }
}

/// Children entries to drop and to index, keyed by child component id.
struct ChildrenDiff {
    remove: Vec<Key>,
    add: Vec<(Key, Value)>,
}

impl ChildrenDiff {
    /// Removed and changed entries are removed; added and changed entries
    /// are indexed fresh.
    fn between(parser: &dyn ContainerParser, old: Option<&Value>, new: &Value) -> Self {
        let empty = serde_json::Map::new();
        let old = old.and_then(Value::as_object).unwrap_or(&empty);
        let new = new.as_object().unwrap_or(&empty);
        let id_of = |child_key: &str, raw: &Value| parser.component_id(raw).unwrap_or_else(|| key(child_key));

        let mut diff = ChildrenDiff {
            remove: Vec::new(),
            add: Vec::new(),
        };
        for (child_key, old_raw) in old {
            match new.get(child_key) {
                None => diff.remove.push(id_of(child_key, old_raw)),
                Some(new_raw) if new_raw != old_raw => {
                    diff.remove.push(id_of(child_key, old_raw));
                    diff.add.push((key(child_key), new_raw.clone()));
                }
                Some(_) => {}
            }
        }
        for (child_key, new_raw) in new {
            if !old.contains_key(child_key) {
                diff.add.push((key(child_key), new_raw.clone()));
            }
        }
        diff
    }

    fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Outcome of evaluating one node, detached from the arena borrow.
struct Evaluated {
    index: NodeIndex,
    component: ComponentUid,
    parent: Option<ComponentUid>,
    component_path: Path,
    property: Key,
    child_order: bool,
    value: Value,
    children: Option<ChildrenDiff>,
}

impl Container {
    /// Run one cycle for `reason` against the component `target`.
    ///
    /// A failed cycle leaves the tree structurally consistent but possibly
    /// partially evolved; no consumer is notified.
    pub fn evolve(&mut self, target: ComponentUid, reason: Reason) -> EngineResult<CycleReport> {
        let Some(path) = self.arena.component(target).map(|c| c.path.clone()) else {
            return Err(EngineError::UnknownComponent {
                path: target.to_string(),
            });
        };

        let started = Instant::now();
        let mut report = CycleReport::new(target);
        debug!(container = %self.id, target = %path, reason = %reason, "Evolve cycle started");

        let outcome = self.evolve_cycle(target, reason, &mut report);
        report.elapsed = started.elapsed();
        report.worklist_high_water = self.worklist.high_water();

        match outcome {
            Ok(()) => {
                debug!(
                    container = %self.id,
                    target = %path,
                    evaluated = report.evaluated,
                    changed = report.changed,
                    added = report.added.len(),
                    removed = report.removed.len(),
                    notified = report.notified,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Evolve cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(container = %self.id, target = %path, error = %e, "Evolve cycle failed");
                Err(e)
            }
        }
    }

    pub fn evolve_path(&mut self, component_path: &[Key], reason: Reason) -> EngineResult<CycleReport> {
        let uid = self
            .arena
            .component_uid(component_path)
            .ok_or_else(|| EngineError::UnknownComponent {
                path: Path::from(component_path.to_vec()).to_string(),
            })?;
        self.evolve(uid, reason)
    }

    fn evolve_cycle(&mut self, target: ComponentUid, reason: Reason, report: &mut CycleReport) -> EngineResult<()> {
        let added = self.run_cycle(target, Some(reason), report)?;
        if !added.is_empty() {
            self.link_components(&added);
            self.initialize_components(added, report)?;
        }
        Ok(())
    }

    /// Initialize components in order. Components added while one of them
    /// initializes are initialized before the next in line.
    pub(crate) fn initialize_components(
        &mut self,
        components: Vec<ComponentUid>,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let outermost = self.init.is_none();
        if outermost {
            self.init = Some(InitState::default());
        }
        let outcome = self.initialize_sweep(components, report);
        if outermost {
            self.init = None;
        }
        outcome
    }

    fn initialize_sweep(&mut self, components: Vec<ComponentUid>, report: &mut CycleReport) -> EngineResult<()> {
        let mut stack: Vec<VecDeque<ComponentUid>> = vec![components.into()];

        while let Some(queue) = stack.last_mut() {
            let Some(uid) = queue.pop_front() else {
                stack.pop();
                continue;
            };
            let pending = self.arena.component(uid).is_some()
                && self.init.as_ref().is_some_and(|init| !init.components.contains(&uid));
            if !pending {
                continue;
            }

            let added = self.run_cycle(uid, None, report)?;
            if let Some(init) = self.init.as_mut() {
                init.components.insert(uid);
            }
            report.initialized.push(uid);
            self.collector.component_initialized(uid);

            if !added.is_empty() {
                self.link_components(&added);
                stack.push(added.into());
            }
        }
        Ok(())
    }

    /// Seed, drain and settle. Returns the components added while draining.
    fn run_cycle(
        &mut self,
        target: ComponentUid,
        reason: Option<Reason>,
        report: &mut CycleReport,
    ) -> EngineResult<Vec<ComponentUid>> {
        self.worklist.reset();
        let high_water = self.worklist.high_water();
        self.seed(target, reason.as_ref())?;

        let mut added = Vec::new();
        let drained = self.drain(&mut added, report);
        if self.worklist.high_water() > high_water {
            debug!(
                container = %self.id,
                high_water = self.worklist.high_water(),
                "Worklist grew"
            );
        }
        if let Err(e) = drained {
            // Subtrees indexed before the failure stay, fully linked.
            if !added.is_empty() {
                self.link_components(&added);
            }
            self.consumers.discard_pending();
            return Err(e);
        }

        self.settle(reason.as_ref(), report);
        report.added.extend(added.iter().copied());
        Ok(added)
    }

    fn seed(&mut self, target: ComponentUid, reason: Option<&Reason>) -> EngineResult<()> {
        let slot = self
            .arena
            .component(target)
            .ok_or(EngineError::ComponentOutOfRange { uid: target })?;

        for &index in slot.properties.values() {
            let Some(node) = self.arena.node(index) else {
                continue;
            };
            let seeded = match reason {
                None => true,
                // Evolver-less nodes are seeded and evaluate to their stored value.
                Some(reason) => node.evolver.is_none() || self.parser.is_interested_in(&node.interests, reason),
            };
            if seeded {
                self.worklist.push(index, reason.cloned());
            }
        }
        trace!(target = %slot.path, seeded = self.worklist.len(), "Worklist seeded");
        Ok(())
    }

    fn drain(&mut self, added: &mut Vec<ComponentUid>, report: &mut CycleReport) -> EngineResult<()> {
        while let Some(item) = self.worklist.next_live(&mut report.skipped) {
            let Some(evaluated) = self.evaluate(&item, report)? else {
                continue;
            };
            self.commit(evaluated, added, report)?;
        }
        Ok(())
    }

    /// Compute a node's next value. `None` when the node is unchanged or
    /// not due for evaluation.
    fn evaluate(&mut self, item: &WorkItem, report: &mut CycleReport) -> EngineResult<Option<Evaluated>> {
        let first_time = self.init.as_ref().is_some_and(|init| !init.nodes.contains(&item.node));
        if item.reason.is_none() && !first_time {
            return Ok(None);
        }
        let Some(node) = self.arena.node(item.node) else {
            return Ok(None);
        };
        let Some(slot) = self.arena.component(node.component) else {
            return Ok(None);
        };
        let old = self.arena.value(item.node);

        let computed = match &node.evolver {
            Some(evolver) => {
                let view = ComponentView::new(&self.arena, slot, &node.property, item.reason.as_ref());
                evolver.call(&view).map_err(|source| EngineError::Evolver {
                    path: slot.path.clone(),
                    property: node.property.to_string(),
                    reason: reason_label(item.reason.as_ref()),
                    source,
                })?
            }
            None => old.cloned().unwrap_or(Value::Null),
        };
        report.evaluated += 1;
        trace!(
            node = %node.path,
            reason = %reason_label(item.reason.as_ref()),
            old = %preview(old, self.config.value_preview_len),
            new = %preview(Some(&computed), self.config.value_preview_len),
            "Evaluated node"
        );

        let (value, children, changed) = if node.children {
            let value = filter_children(&self.config, &slot.path, computed)?;
            let diff = ChildrenDiff::between(self.parser.as_ref(), old, &value);
            let changed = first_time || !diff.is_empty();
            (value, Some(diff), changed)
        } else {
            let changed = first_time || old != Some(&computed);
            (computed, None, changed)
        };

        let index = item.node;
        let evaluated = changed.then(|| Evaluated {
            index,
            component: node.component,
            parent: node.parent_component,
            component_path: slot.path.clone(),
            property: node.property.clone(),
            child_order: node.child_order,
            value,
            children,
        });

        if let Some(init) = self.init.as_mut() {
            init.nodes.insert(index);
        }
        Ok(evaluated)
    }

    /// Store a changed value, apply its structural effect, report it and
    /// enqueue dependents.
    fn commit(&mut self, evaluated: Evaluated, added: &mut Vec<ComponentUid>, report: &mut CycleReport) -> EngineResult<()> {
        let Evaluated {
            index,
            component,
            parent,
            component_path,
            property,
            child_order,
            value,
            children,
        } = evaluated;

        report.changed += 1;
        self.arena.set_value(index, value.clone());
        self.consumers.node_changed(index);

        if let Some(diff) = children {
            self.apply_children(component, &component_path, diff, added, report)?;
        }
        if child_order {
            self.apply_child_order(component, &component_path, &value)?;
        }

        self.collector
            .append_result(parent, &component_path, index, &property, &value);

        let dependents: Vec<_> = self
            .arena
            .node(index)
            .map(|n| n.dependents.iter().map(|(&d, via)| (d, via.without_last())).collect())
            .unwrap_or_default();
        for (dependent, via) in dependents {
            self.worklist.push(dependent, Some(Reason::Dependency(via)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Structural changes
    // -----------------------------------------------------------------------

    fn apply_children(
        &mut self,
        uid: ComponentUid,
        component_path: &Path,
        diff: ChildrenDiff,
        added: &mut Vec<ComponentUid>,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        if diff.is_empty() {
            return Ok(());
        }

        let mut removed_nodes = HashSet::new();
        let mut removed_children = HashSet::new();
        let mut orphaned = 0;
        for id in &diff.remove {
            let child = self.arena.component(uid).and_then(|c| c.child_ids.get(id).copied());
            let Some(child) = child else {
                warn!(component = %component_path, child = %id, "Removed child was never indexed");
                continue;
            };

            let removed = self.arena.remove_component(child)?;
            for &gone in &removed.components {
                self.collector.component_removed(gone);
                added.retain(|a| *a != gone);
                if let Some(init) = self.init.as_mut() {
                    init.components.remove(&gone);
                }
            }
            report.removed.extend(removed.components.iter().copied());
            removed_children.insert(child);
            removed_nodes.extend(removed.nodes);
            orphaned += self.arena.mark_dangling(&removed.orphaned_dependents);
        }

        if !removed_nodes.is_empty() {
            let neutralized = self.worklist.neutralize(&removed_nodes);
            self.consumers.forget_nodes(&removed_nodes);
            if let Some(init) = self.init.as_mut() {
                init.nodes.retain(|n| !removed_nodes.contains(n));
            }
            debug!(
                component = %component_path,
                children = removed_children.len(),
                nodes = removed_nodes.len(),
                neutralized,
                orphaned,
                "Removed children"
            );
        }
        self.arena.detach_children(uid, &diff.remove, &removed_children);

        let before = added.len();
        for (child_key, raw) in diff.add {
            let id = self.parser.component_id(&raw).unwrap_or(child_key);
            let child = self.index_subtree(Some(uid), component_path.child(id.clone()), &raw, added)?;
            self.arena.attach_child(uid, id, child);
        }
        if added.len() > before {
            debug!(
                component = %component_path,
                components = added.len() - before,
                worklist = self.worklist.len(),
                "Added children"
            );
        }
        Ok(())
    }

    fn apply_child_order(&mut self, uid: ComponentUid, component_path: &Path, value: &Value) -> EngineResult<()> {
        let entries = match value {
            Value::Null => return Ok(()),
            Value::Array(entries) => entries,
            other => {
                return Err(EngineError::MalformedDefinition {
                    path: component_path.clone(),
                    reason: format!("child order must be a list of ids, got {other}"),
                })
            }
        };
        let ids: Vec<&str> = entries
            .iter()
            .map(Value::as_str)
            .collect::<Option<_>>()
            .ok_or_else(|| EngineError::MalformedDefinition {
                path: component_path.clone(),
                reason: "child order entries must be ids".to_string(),
            })?;

        let Some(slot) = self.arena.component(uid) else {
            return Err(EngineError::ComponentOutOfRange { uid });
        };
        let mut order: Vec<ComponentUid> = ids.iter().filter_map(|id| slot.child_ids.get(*id).copied()).collect();

        let mut current = slot.children.clone();
        current.sort();
        let mut proposed = order.clone();
        proposed.sort();
        let permutation = order.len() == ids.len() && current == proposed;

        if !permutation {
            if self.config.verify_child_order {
                let expected = slot
                    .children
                    .iter()
                    .filter_map(|&c| self.arena.component(c)?.path.last().map(|k| k.to_string()))
                    .collect();
                return Err(EngineError::ChildOrderMismatch {
                    path: component_path.clone(),
                    expected,
                    actual: ids.iter().map(|s| s.to_string()).collect(),
                });
            }
            // Keep every child; unknown ids are dropped, unlisted children go last.
            let mut seen = HashSet::new();
            order.retain(|child| seen.insert(*child));
            for &child in &slot.children {
                if !order.contains(&child) {
                    order.push(child);
                }
            }
        }

        if let Some(slot) = self.arena.component_mut(uid) {
            slot.children = order;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settling
    // -----------------------------------------------------------------------

    fn settle(&mut self, reason: Option<&Reason>, report: &mut CycleReport) {
        let mut writes = PendingWrites::default();
        self.collector
            .post_process_after_evolve_cycle(&self.arena, &mut writes);
        if !writes.is_empty() {
            for index in writes.apply(&mut self.arena) {
                self.consumers.node_changed(index);
            }
        }

        let batch = self.consumers.drain(&self.arena, &self.id, reason);
        if !batch.is_empty() {
            report.notified += batch.len();
            self.sink.dispatch(batch);
        }
    }
}
