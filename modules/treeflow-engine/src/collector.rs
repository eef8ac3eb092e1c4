//! ResultCollector: the synchronous observer of a container's evolution.
//!
//! The engine reports structural changes and every changed value as they
//! happen inside a cycle, then hands the collector a read view and a write
//! surface once the worklist has drained.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::types::{ComponentUid, Key, NodeIndex, Path};
use crate::view::{ContainerAccessor, ContainerMutator};

pub trait ResultCollector: Send {
    fn component_added(&mut self, parent: Option<ComponentUid>, uid: ComponentUid);

    fn component_removed(&mut self, uid: ComponentUid);

    /// The component's init cycle finished.
    fn component_initialized(&mut self, uid: ComponentUid);

    fn append_result(
        &mut self,
        parent: Option<ComponentUid>,
        component_path: &Path,
        node: NodeIndex,
        property: &Key,
        new_value: &Value,
    );

    /// Runs once per cycle after the worklist drains. Writes made through
    /// `mutator` are applied afterwards without propagation.
    fn post_process_after_evolve_cycle(
        &mut self,
        accessor: &dyn ContainerAccessor,
        mutator: &mut dyn ContainerMutator,
    );
}

impl<C: ResultCollector + ?Sized> ResultCollector for Box<C> {
    fn component_added(&mut self, parent: Option<ComponentUid>, uid: ComponentUid) {
        (**self).component_added(parent, uid)
    }

    fn component_removed(&mut self, uid: ComponentUid) {
        (**self).component_removed(uid)
    }

    fn component_initialized(&mut self, uid: ComponentUid) {
        (**self).component_initialized(uid)
    }

    fn append_result(
        &mut self,
        parent: Option<ComponentUid>,
        component_path: &Path,
        node: NodeIndex,
        property: &Key,
        new_value: &Value,
    ) {
        (**self).append_result(parent, component_path, node, property, new_value)
    }

    fn post_process_after_evolve_cycle(
        &mut self,
        accessor: &dyn ContainerAccessor,
        mutator: &mut dyn ContainerMutator,
    ) {
        (**self).post_process_after_evolve_cycle(accessor, mutator)
    }
}

// ---------------------------------------------------------------------------
// NoopCollector
// ---------------------------------------------------------------------------

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl ResultCollector for NoopCollector {
    fn component_added(&mut self, _parent: Option<ComponentUid>, _uid: ComponentUid) {}

    fn component_removed(&mut self, _uid: ComponentUid) {}

    fn component_initialized(&mut self, _uid: ComponentUid) {}

    fn append_result(
        &mut self,
        _parent: Option<ComponentUid>,
        _component_path: &Path,
        _node: NodeIndex,
        _property: &Key,
        _new_value: &Value,
    ) {
    }

    fn post_process_after_evolve_cycle(
        &mut self,
        _accessor: &dyn ContainerAccessor,
        _mutator: &mut dyn ContainerMutator,
    ) {
    }
}

// ---------------------------------------------------------------------------
// RecordingCollector (tests, keeps every callback in order)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectorEvent {
    Added {
        parent: Option<ComponentUid>,
        uid: ComponentUid,
    },
    Removed {
        uid: ComponentUid,
    },
    Initialized {
        uid: ComponentUid,
    },
    Result {
        component: Path,
        node: NodeIndex,
        property: Key,
        value: Value,
    },
    PostProcess,
}

/// Computes a node write from the settled container.
type HookWrite = Box<dyn Fn(&dyn ContainerAccessor) -> Option<(NodeIndex, Value)> + Send>;

/// In-memory collector for assertions. The engine drives it through an
/// `Arc` so a test can keep a handle.
#[derive(Default)]
pub struct RecordingCollector {
    events: Mutex<Vec<CollectorEvent>>,
    hook_writes: Mutex<Vec<HookWrite>>,
}

impl RecordingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CollectorEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Changed values reported so far, as `(component path, property, value)`.
    pub fn results(&self) -> Vec<(Path, Key, Value)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CollectorEvent::Result {
                    component,
                    property,
                    value,
                    ..
                } => Some((component, property, value)),
                _ => None,
            })
            .collect()
    }

    /// Register a write the post-cycle hook issues on every cycle.
    pub fn write_on_post_process<F>(&self, write: F)
    where
        F: Fn(&dyn ContainerAccessor) -> Option<(NodeIndex, Value)> + Send + 'static,
    {
        self.hook_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(write));
    }

    fn record(&self, event: CollectorEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

impl ResultCollector for Arc<RecordingCollector> {
    fn component_added(&mut self, parent: Option<ComponentUid>, uid: ComponentUid) {
        self.record(CollectorEvent::Added { parent, uid });
    }

    fn component_removed(&mut self, uid: ComponentUid) {
        self.record(CollectorEvent::Removed { uid });
    }

    fn component_initialized(&mut self, uid: ComponentUid) {
        self.record(CollectorEvent::Initialized { uid });
    }

    fn append_result(
        &mut self,
        _parent: Option<ComponentUid>,
        component_path: &Path,
        node: NodeIndex,
        property: &Key,
        new_value: &Value,
    ) {
        self.record(CollectorEvent::Result {
            component: component_path.clone(),
            node,
            property: property.clone(),
            value: new_value.clone(),
        });
    }

    fn post_process_after_evolve_cycle(
        &mut self,
        accessor: &dyn ContainerAccessor,
        mutator: &mut dyn ContainerMutator,
    ) {
        self.record(CollectorEvent::PostProcess);
        let writes = self.hook_writes.lock().unwrap_or_else(PoisonError::into_inner);
        for write in writes.iter() {
            if let Some((node, value)) = write(accessor) {
                mutator.set_value(node, value);
            }
        }
    }
}
