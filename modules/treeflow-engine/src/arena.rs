//! Indexed storage for components, property nodes and their values.
//!
//! Components and nodes live in slot vectors addressed by [`ComponentUid`]
//! and [`NodeIndex`]. Freed slots go to a LIFO pool and are handed out again
//! before the vectors grow, so removing a subtree never moves a live index.
//! Values sit in a flat array parallel to node indices.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::parser::{Evolver, PropertyDescriptor};
use crate::resolver::Dependency;
use crate::types::{ComponentUid, Key, NodeIndex, Path, RelativePath};

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ComponentSlot {
    pub(crate) uid: ComponentUid,
    pub(crate) parent: Option<ComponentUid>,
    pub(crate) path: Path,
    pub(crate) properties: BTreeMap<Key, NodeIndex>,
    /// Display order.
    pub(crate) children: Vec<ComponentUid>,
    pub(crate) child_ids: HashMap<Key, ComponentUid>,
    pub(crate) custom_data: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct PropertyNode {
    pub(crate) index: NodeIndex,
    pub(crate) component: ComponentUid,
    pub(crate) parent_component: Option<ComponentUid>,
    /// Component path plus the property id.
    pub(crate) path: Path,
    pub(crate) property: Key,
    pub(crate) children: bool,
    pub(crate) child_order: bool,
    pub(crate) evolver: Option<Evolver>,
    pub(crate) interests: Vec<Key>,
    pub(crate) declared: Vec<Dependency>,
    pub(crate) ambiguous: bool,
    /// Resolved dependency -> the declared path it was reached through.
    pub(crate) dependencies: BTreeMap<NodeIndex, RelativePath>,
    /// Dependent -> the concrete path under which it references this node.
    pub(crate) dependents: BTreeMap<NodeIndex, RelativePath>,
}

/// Everything dropped by one [`Arena::remove_component`] call.
#[derive(Debug, Default)]
pub(crate) struct RemovedSubtree {
    /// Pre-order: a component precedes its descendants.
    pub(crate) components: Vec<ComponentUid>,
    pub(crate) nodes: HashSet<NodeIndex>,
    /// Surviving nodes that lost a resolved dependency.
    pub(crate) orphaned_dependents: BTreeSet<NodeIndex>,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Arena {
    pub(crate) components: Vec<Option<ComponentSlot>>,
    pub(crate) nodes: Vec<Option<PropertyNode>>,
    pub(crate) values: Vec<Option<Value>>,
    free_components: Vec<ComponentUid>,
    free_nodes: Vec<NodeIndex>,
    component_paths: HashMap<Path, ComponentUid>,
    node_paths: HashMap<Path, NodeIndex>,
    root: Option<ComponentUid>,
    /// Nodes with a wildcard in any declared dependency.
    pub(crate) ambiguous: BTreeSet<NodeIndex>,
    /// Nodes with a named dependency that currently resolves to nothing.
    pub(crate) dangling: BTreeSet<NodeIndex>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a component slot and register its path.
    pub(crate) fn add_component(&mut self, parent: Option<ComponentUid>, path: Path) -> ComponentUid {
        let uid = match self.free_components.pop() {
            Some(uid) => uid,
            None => {
                self.components.push(None);
                ComponentUid(self.components.len() - 1)
            }
        };

        self.component_paths.insert(path.clone(), uid);
        self.components[uid.index()] = Some(ComponentSlot {
            uid,
            parent,
            path,
            properties: BTreeMap::new(),
            children: Vec::new(),
            child_ids: HashMap::new(),
            custom_data: None,
        });
        if parent.is_none() {
            self.root = Some(uid);
        }
        uid
    }

    /// Allocate a node slot for `descriptor` on `component` and store its initial value.
    pub(crate) fn add_node(&mut self, component: ComponentUid, descriptor: PropertyDescriptor) -> EngineResult<NodeIndex> {
        let (component_path, parent_component) = {
            let slot = self
                .component(component)
                .ok_or(EngineError::ComponentOutOfRange { uid: component })?;
            (slot.path.clone(), slot.parent)
        };

        let index = match self.free_nodes.pop() {
            Some(index) => index,
            None => {
                self.nodes.push(None);
                self.values.push(None);
                NodeIndex(self.nodes.len() - 1)
            }
        };

        let declared: Vec<Dependency> = descriptor
            .dependencies
            .iter()
            .map(|rel| Dependency::new(&component_path, rel))
            .collect();
        let ambiguous = declared.iter().any(|d| d.is_ambiguous());
        let path = component_path.child(descriptor.property.clone());

        self.node_paths.insert(path.clone(), index);
        self.nodes[index.index()] = Some(PropertyNode {
            index,
            component,
            parent_component,
            path,
            property: descriptor.property.clone(),
            children: descriptor.children,
            child_order: descriptor.child_order,
            evolver: descriptor.evolver,
            interests: descriptor.interests,
            declared,
            ambiguous,
            dependencies: BTreeMap::new(),
            dependents: BTreeMap::new(),
        });
        self.values[index.index()] = Some(descriptor.initial);
        if ambiguous {
            self.ambiguous.insert(index);
        }

        if let Some(slot) = self.component_mut(component) {
            slot.properties.insert(descriptor.property, index);
        }
        Ok(index)
    }

    /// Remove a component, all its descendants and every node they own.
    ///
    /// Dependency edges touching removed nodes are unlinked on both sides.
    /// The caller detaches the component from its parent's child lists.
    pub(crate) fn remove_component(&mut self, uid: ComponentUid) -> EngineResult<RemovedSubtree> {
        let mut removed = RemovedSubtree::default();
        self.remove_component_into(uid, &mut removed)?;
        removed
            .orphaned_dependents
            .retain(|n| !removed.nodes.contains(n));
        Ok(removed)
    }

    fn remove_component_into(&mut self, uid: ComponentUid, removed: &mut RemovedSubtree) -> EngineResult<()> {
        if uid.index() >= self.components.len() {
            return Err(EngineError::ComponentOutOfRange { uid });
        }
        let slot = self.components[uid.index()]
            .take()
            .ok_or(EngineError::ComponentAlreadyRemoved { uid })?;

        for &node_index in slot.properties.values() {
            self.remove_node(node_index, removed);
        }

        self.component_paths.remove(&slot.path);
        self.free_components.push(uid);
        if self.root == Some(uid) {
            self.root = None;
        }
        removed.components.push(uid);

        for child in slot.children {
            self.remove_component_into(child, removed)?;
        }
        Ok(())
    }

    fn remove_node(&mut self, index: NodeIndex, removed: &mut RemovedSubtree) {
        let Some(node) = self.nodes[index.index()].take() else {
            return;
        };
        self.values[index.index()] = None;
        self.node_paths.remove(&node.path);
        self.ambiguous.remove(&index);
        self.dangling.remove(&index);

        for dependency in node.dependencies.keys() {
            if let Some(target) = self.node_mut(*dependency) {
                target.dependents.remove(&index);
            }
        }
        for dependent in node.dependents.keys() {
            if let Some(source) = self.node_mut(*dependent) {
                source.dependencies.remove(&index);
                removed.orphaned_dependents.insert(*dependent);
            }
        }

        self.free_nodes.push(index);
        removed.nodes.insert(index);
    }

    /// Track surviving nodes that lost a named dependency so the next
    /// re-walk can reconnect them. Returns how many were marked.
    pub(crate) fn mark_dangling(&mut self, orphans: &BTreeSet<NodeIndex>) -> usize {
        let mut marked = 0;
        for &index in orphans {
            let named = self
                .node(index)
                .is_some_and(|n| n.declared.iter().any(|d| !d.is_ambiguous()));
            if named && self.dangling.insert(index) {
                marked += 1;
            }
        }
        marked
    }

    pub(crate) fn attach_child(&mut self, parent: ComponentUid, id: Key, child: ComponentUid) {
        if let Some(slot) = self.component_mut(parent) {
            slot.children.push(child);
            slot.child_ids.insert(id, child);
        }
    }

    pub(crate) fn detach_children(&mut self, parent: ComponentUid, ids: &[Key], uids: &HashSet<ComponentUid>) {
        if let Some(slot) = self.component_mut(parent) {
            slot.children.retain(|c| !uids.contains(c));
            for id in ids {
                slot.child_ids.remove(id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn root(&self) -> Option<ComponentUid> {
        self.root
    }

    pub(crate) fn component(&self, uid: ComponentUid) -> Option<&ComponentSlot> {
        self.components.get(uid.index())?.as_ref()
    }

    pub(crate) fn component_mut(&mut self, uid: ComponentUid) -> Option<&mut ComponentSlot> {
        self.components.get_mut(uid.index())?.as_mut()
    }

    pub(crate) fn node(&self, index: NodeIndex) -> Option<&PropertyNode> {
        self.nodes.get(index.index())?.as_ref()
    }

    pub(crate) fn node_mut(&mut self, index: NodeIndex) -> Option<&mut PropertyNode> {
        self.nodes.get_mut(index.index())?.as_mut()
    }

    pub fn value(&self, index: NodeIndex) -> Option<&Value> {
        self.values.get(index.index())?.as_ref()
    }

    /// Overwrite a live node's value. Writes to freed slots are ignored.
    pub(crate) fn set_value(&mut self, index: NodeIndex, value: Value) {
        if let Some(slot) = self.values.get_mut(index.index()) {
            if slot.is_some() {
                *slot = Some(value);
            }
        }
    }

    pub fn component_uid(&self, path: &[Key]) -> Option<ComponentUid> {
        self.component_paths.get(path).copied()
    }

    pub fn node_index(&self, node_path: &[Key]) -> Option<NodeIndex> {
        self.node_paths.get(node_path).copied()
    }

    pub(crate) fn node_paths(&self) -> impl Iterator<Item = (&Path, &NodeIndex)> {
        self.node_paths.iter()
    }

    pub(crate) fn nodes_of(&self, uid: ComponentUid) -> Vec<NodeIndex> {
        self.component(uid)
            .map(|c| c.properties.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn component_count(&self) -> usize {
        self.components.iter().filter(|c| c.is_some()).count()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Slots ever allocated, live or free.
    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }
}
