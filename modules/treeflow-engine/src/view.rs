//! Read access for evolvers and collectors, and the deferred write surface
//! handed to the post-cycle hook.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::arena::{Arena, ComponentSlot};
use crate::resolver::resolve_path;
use crate::types::{ComponentUid, Key, NodeIndex, Path, Reason, RelativePath};

// ---------------------------------------------------------------------------
// ComponentRef
// ---------------------------------------------------------------------------

/// Borrowed view of one live component.
#[derive(Clone, Copy)]
pub struct ComponentRef<'a> {
    arena: &'a Arena,
    slot: &'a ComponentSlot,
}

impl<'a> ComponentRef<'a> {
    pub(crate) fn new(arena: &'a Arena, slot: &'a ComponentSlot) -> Self {
        Self { arena, slot }
    }

    pub fn uid(&self) -> ComponentUid {
        self.slot.uid
    }

    pub fn path(&self) -> &'a Path {
        &self.slot.path
    }

    pub fn id(&self) -> Option<&'a Key> {
        self.slot.path.last()
    }

    pub fn parent(&self) -> Option<ComponentUid> {
        self.slot.parent
    }

    /// Children in display order.
    pub fn children(&self) -> &'a [ComponentUid] {
        &self.slot.children
    }

    pub fn child(&self, id: &str) -> Option<ComponentUid> {
        self.slot.child_ids.get(id).copied()
    }

    pub fn property_index(&self, property: &str) -> Option<NodeIndex> {
        self.slot.properties.get(property).copied()
    }

    pub fn property(&self, property: &str) -> Option<&'a Value> {
        self.property_index(property).and_then(|i| self.arena.value(i))
    }

    pub fn property_ids(&self) -> impl Iterator<Item = &'a Key> + 'a {
        self.slot.properties.keys()
    }

    pub fn custom_data(&self) -> Option<&'a Value> {
        self.slot.custom_data.as_ref()
    }

    /// Current value of every property.
    pub fn properties(&self) -> BTreeMap<Key, Value> {
        self.slot
            .properties
            .iter()
            .filter_map(|(id, &index)| self.arena.value(index).map(|v| (id.clone(), v.clone())))
            .collect()
    }
}

impl std::fmt::Debug for ComponentRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRef")
            .field("uid", &self.slot.uid)
            .field("path", &self.slot.path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentView
// ---------------------------------------------------------------------------

/// What an evolver sees: its owning component, the tree around it, and the
/// reason it is being called.
pub struct ComponentView<'a> {
    arena: &'a Arena,
    slot: &'a ComponentSlot,
    property: &'a Key,
    reason: Option<&'a Reason>,
}

impl<'a> ComponentView<'a> {
    pub(crate) fn new(
        arena: &'a Arena,
        slot: &'a ComponentSlot,
        property: &'a Key,
        reason: Option<&'a Reason>,
    ) -> Self {
        Self {
            arena,
            slot,
            property,
            reason,
        }
    }

    /// The property being evolved.
    pub fn property(&self) -> &'a Key {
        self.property
    }

    /// Value of the property being evolved, before this evaluation.
    pub fn current(&self) -> Option<&'a Value> {
        self.own(self.property)
    }

    /// `None` while the component is being initialized.
    pub fn reason(&self) -> Option<&'a Reason> {
        self.reason
    }

    pub fn is_initializing(&self) -> bool {
        self.reason.is_none()
    }

    pub fn component(&self) -> ComponentRef<'a> {
        ComponentRef::new(self.arena, self.slot)
    }

    pub fn path(&self) -> &'a Path {
        &self.slot.path
    }

    /// A property of the owning component, including the one being evolved.
    pub fn own(&self, property: &str) -> Option<&'a Value> {
        self.component().property(property)
    }

    /// Value at an absolute node path.
    pub fn get(&self, node_path: &[Key]) -> Option<&'a Value> {
        self.arena.node_index(node_path).and_then(|i| self.arena.value(i))
    }

    pub fn get_at(&self, component_path: &[Key], property: &str) -> Option<&'a Value> {
        let uid = self.arena.component_uid(component_path)?;
        let slot = self.arena.component(uid)?;
        ComponentRef::new(self.arena, slot).property(property)
    }

    /// Every value a relative path reaches from this component, resolved the
    /// same way declared dependencies are.
    pub fn values_at(&self, rel: &[&str]) -> Vec<&'a Value> {
        resolve_path(self.arena, &self.slot.path, &RelativePath::parse(rel))
            .into_iter()
            .filter_map(|(index, _)| self.arena.value(index))
            .collect()
    }

    pub fn value_at(&self, rel: &[&str]) -> Option<&'a Value> {
        self.values_at(rel).into_iter().next()
    }

    /// Child ids in display order.
    pub fn child_ids(&self) -> Vec<Key> {
        self.slot
            .children
            .iter()
            .filter_map(|&uid| self.arena.component(uid)?.path.last().cloned())
            .collect()
    }

    pub fn child(&self, id: &str, property: &str) -> Option<&'a Value> {
        let uid = self.slot.child_ids.get(id)?;
        let slot = self.arena.component(*uid)?;
        ComponentRef::new(self.arena, slot).property(property)
    }

    pub fn parent(&self, property: &str) -> Option<&'a Value> {
        let slot = self.arena.component(self.slot.parent?)?;
        ComponentRef::new(self.arena, slot).property(property)
    }
}

// ---------------------------------------------------------------------------
// Accessor / mutator
// ---------------------------------------------------------------------------

/// Read-only access to the whole container.
pub trait ContainerAccessor {
    fn root(&self) -> Option<ComponentUid>;

    fn component(&self, uid: ComponentUid) -> Option<ComponentRef<'_>>;

    fn component_uid(&self, path: &[Key]) -> Option<ComponentUid>;

    fn value(&self, index: NodeIndex) -> Option<&Value>;
}

impl ContainerAccessor for Arena {
    fn root(&self) -> Option<ComponentUid> {
        Arena::root(self)
    }

    fn component(&self, uid: ComponentUid) -> Option<ComponentRef<'_>> {
        Arena::component(self, uid).map(|slot| ComponentRef::new(self, slot))
    }

    fn component_uid(&self, path: &[Key]) -> Option<ComponentUid> {
        Arena::component_uid(self, path)
    }

    fn value(&self, index: NodeIndex) -> Option<&Value> {
        Arena::value(self, index)
    }
}

/// Writes issued from the post-cycle hook. They land after the hook
/// returns and never trigger propagation.
pub trait ContainerMutator {
    fn set_value(&mut self, index: NodeIndex, value: Value);

    fn set_custom_data(&mut self, uid: ComponentUid, data: Value);
}

#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    values: Vec<(NodeIndex, Value)>,
    custom_data: Vec<(ComponentUid, Value)>,
}

impl PendingWrites {
    pub(crate) fn is_empty(&self) -> bool {
        self.values.is_empty() && self.custom_data.is_empty()
    }

    /// Returns the nodes whose values were written.
    pub(crate) fn apply(self, arena: &mut Arena) -> Vec<NodeIndex> {
        for (uid, data) in self.custom_data {
            if let Some(slot) = arena.component_mut(uid) {
                slot.custom_data = Some(data);
            }
        }
        let mut written = Vec::with_capacity(self.values.len());
        for (index, value) in self.values {
            if arena.value(index).is_some() {
                arena.set_value(index, value);
                written.push(index);
            }
        }
        written
    }
}

impl ContainerMutator for PendingWrites {
    fn set_value(&mut self, index: NodeIndex, value: Value) {
        self.values.push((index, value));
    }

    fn set_custom_data(&mut self, uid: ComponentUid, data: Value) {
        self.custom_data.push((uid, data));
    }
}
