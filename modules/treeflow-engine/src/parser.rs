//! The boundary between raw component definitions and the engine.
//!
//! A [`ContainerParser`] turns one raw definition into property descriptors,
//! names the reserved properties that carry structure, and decides which
//! nodes care about which reasons. The engine never reads raw definitions
//! any other way.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::EngineResult;
use crate::types::{Key, Path, Reason, RelativePath, Segment, THIS_MARKER, UP_MARKER};
use crate::view::ComponentView;

type EvolverFn = dyn Fn(&ComponentView<'_>) -> anyhow::Result<Value> + Send + Sync;

/// Computes a property's next value from the owning component and the reason.
///
/// The reason is `None` during initialization.
#[derive(Clone)]
pub struct Evolver(Arc<EvolverFn>);

impl Evolver {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ComponentView<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, view: &ComponentView<'_>) -> anyhow::Result<Value> {
        (self.0)(view)
    }
}

impl fmt::Debug for Evolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Evolver(..)")
    }
}

/// Everything the engine needs to know about one property of a component.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub property: Key,
    /// Value is a map of child id to raw child definition.
    pub children: bool,
    /// Value is an ordered list of child ids.
    pub child_order: bool,
    pub evolver: Option<Evolver>,
    pub dependencies: Vec<RelativePath>,
    /// Input channels this node reacts to.
    pub interests: Vec<Key>,
    pub initial: Value,
}

impl PropertyDescriptor {
    /// A property with no evolver: it only ever holds its initial value.
    pub fn passive(property: Key, initial: Value) -> Self {
        Self {
            property,
            children: false,
            child_order: false,
            evolver: None,
            dependencies: Vec::new(),
            interests: Vec::new(),
            initial,
        }
    }

    pub fn evolving(property: Key, initial: Value, evolver: Evolver) -> Self {
        Self {
            evolver: Some(evolver),
            ..Self::passive(property, initial)
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<RelativePath>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_interests(mut self, interests: Vec<Key>) -> Self {
        self.interests = interests;
        self
    }

    pub fn as_children(mut self) -> Self {
        self.children = true;
        self
    }

    pub fn as_child_order(mut self) -> Self {
        self.child_order = true;
        self
    }
}

/// Reads raw component definitions for the engine.
pub trait ContainerParser: Send {
    /// The id of a raw definition, if it carries one.
    fn component_id(&self, raw: &Value) -> Option<Key>;

    /// Reserved property holding the child map.
    fn children_property(&self) -> Option<&str>;

    /// Reserved property holding the child display order.
    fn child_order_property(&self) -> Option<&str>;

    /// Describe every property of the component at `path`.
    fn process_component(&self, path: &Path, raw: &Value) -> EngineResult<Vec<PropertyDescriptor>>;

    /// Whether a node with these interests should be seeded for `reason`.
    fn is_interested_in(&self, interests: &[Key], reason: &Reason) -> bool;

    fn is_wildcard_segment(&self, segment: &str) -> bool;

    /// Read one segment of a declared dependency path.
    fn parse_segment(&self, segment: &str) -> Segment {
        match segment {
            THIS_MARKER => Segment::This,
            UP_MARKER => Segment::Up,
            s if self.is_wildcard_segment(s) => Segment::Wildcard,
            s => Segment::named(s),
        }
    }

    /// Total number of property nodes in a raw tree, used to size buffers.
    fn total_node_count(&self, raw: &Value) -> usize;
}

impl<P: ContainerParser + Sync + ?Sized> ContainerParser for Arc<P> {
    fn component_id(&self, raw: &Value) -> Option<Key> {
        (**self).component_id(raw)
    }

    fn children_property(&self) -> Option<&str> {
        (**self).children_property()
    }

    fn child_order_property(&self) -> Option<&str> {
        (**self).child_order_property()
    }

    fn process_component(&self, path: &Path, raw: &Value) -> EngineResult<Vec<PropertyDescriptor>> {
        (**self).process_component(path, raw)
    }

    fn is_interested_in(&self, interests: &[Key], reason: &Reason) -> bool {
        (**self).is_interested_in(interests, reason)
    }

    fn is_wildcard_segment(&self, segment: &str) -> bool {
        (**self).is_wildcard_segment(segment)
    }

    fn parse_segment(&self, segment: &str) -> Segment {
        (**self).parse_segment(segment)
    }

    fn total_node_count(&self, raw: &Value) -> usize {
        (**self).total_node_count(raw)
    }
}
