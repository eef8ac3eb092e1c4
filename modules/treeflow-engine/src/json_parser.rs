//! Reference [`ContainerParser`] for JSON component definitions.
//!
//! A definition is an object. `id` names the component, `children` maps
//! child ids to child definitions, and `evolvers` maps property ids to the
//! name of a registered [`EvolverSpec`]. Every other key is a property with
//! that initial value.
//!
//! ```json
//! { "id": "root", "x": 1, "y": 0, "evolvers": { "y": "x-plus-one" } }
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::parser::{ContainerParser, Evolver, PropertyDescriptor};
use crate::types::{key, Key, Path, Reason, RelativePath, WILDCARD_MARKER};
use crate::view::ComponentView;

pub const ID_PROPERTY: &str = "id";
pub const CHILDREN_PROPERTY: &str = "children";
pub const EVOLVERS_PROPERTY: &str = "evolvers";

/// Channels every parser recognises out of the box.
pub const DEFAULT_CHANNELS: &[&str] = &["mouse", "mousewheel", "keyboard", "clipboard", "timer", "host"];

/// An evolver together with what it reads and which inputs it reacts to.
#[derive(Debug, Clone)]
pub struct EvolverSpec {
    evolver: Evolver,
    /// Raw segments; markers are read by the parser.
    dependencies: Vec<Vec<String>>,
    interests: Vec<Key>,
}

impl EvolverSpec {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ComponentView<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            evolver: Evolver::new(f),
            dependencies: Vec::new(),
            interests: Vec::new(),
        }
    }

    /// `depends_on(&["this", "*", "x"])`
    pub fn depends_on(mut self, path: &[&str]) -> Self {
        self.dependencies.push(path.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn interested_in(mut self, channel: &str) -> Self {
        self.interests.push(key(channel));
        self
    }
}

/// Named evolvers that definitions refer to.
#[derive(Debug, Clone, Default)]
pub struct EvolverRegistry {
    specs: HashMap<String, EvolverSpec>,
}

impl EvolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, spec: EvolverSpec) -> &mut Self {
        self.specs.insert(name.into(), spec);
        self
    }

    pub fn with(mut self, name: impl Into<String>, spec: EvolverSpec) -> Self {
        self.register(name, spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EvolverSpec> {
        self.specs.get(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct JsonContainerParser {
    registry: Arc<EvolverRegistry>,
    child_order_property: Option<String>,
    wildcard_marker: String,
    known_channels: HashSet<Key>,
}

impl JsonContainerParser {
    pub fn new(registry: EvolverRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            child_order_property: None,
            wildcard_marker: WILDCARD_MARKER.to_string(),
            known_channels: DEFAULT_CHANNELS.iter().map(|c| key(c)).collect(),
        }
    }

    /// Treat `property` as the child display order.
    pub fn with_child_order(mut self, property: &str) -> Self {
        self.child_order_property = Some(property.to_string());
        self
    }

    pub fn with_wildcard_marker(mut self, marker: &str) -> Self {
        self.wildcard_marker = marker.to_string();
        self
    }

    pub fn with_channel(mut self, channel: &str) -> Self {
        self.known_channels.insert(key(channel));
        self
    }

    pub fn registry(&self) -> &EvolverRegistry {
        &self.registry
    }

    fn evolver_names<'a>(&self, path: &Path, raw: &'a serde_json::Map<String, Value>) -> EngineResult<Vec<(&'a str, &'a str)>> {
        let Some(evolvers) = raw.get(EVOLVERS_PROPERTY) else {
            return Ok(Vec::new());
        };
        let Some(evolvers) = evolvers.as_object() else {
            return Err(EngineError::MalformedDefinition {
                path: path.clone(),
                reason: format!("`{EVOLVERS_PROPERTY}` must map properties to evolver names"),
            });
        };

        evolvers
            .iter()
            .filter(|(_, name)| !name.is_null())
            .map(|(property, name)| {
                name.as_str()
                    .map(|name| (property.as_str(), name))
                    .ok_or_else(|| EngineError::MalformedDefinition {
                        path: path.clone(),
                        reason: format!("evolver name for `{property}` must be a string"),
                    })
            })
            .collect()
    }
}

impl ContainerParser for JsonContainerParser {
    fn component_id(&self, raw: &Value) -> Option<Key> {
        raw.get(ID_PROPERTY)?.as_str().map(key)
    }

    fn children_property(&self) -> Option<&str> {
        Some(CHILDREN_PROPERTY)
    }

    fn child_order_property(&self) -> Option<&str> {
        self.child_order_property.as_deref()
    }

    fn process_component(&self, path: &Path, raw: &Value) -> EngineResult<Vec<PropertyDescriptor>> {
        let Some(object) = raw.as_object() else {
            return Err(EngineError::MalformedDefinition {
                path: path.clone(),
                reason: "component definition must be an object".to_string(),
            });
        };
        let evolvers: HashMap<&str, &str> = self.evolver_names(path, object)?.into_iter().collect();

        let properties: BTreeSet<&str> = object
            .keys()
            .map(String::as_str)
            .filter(|p| *p != EVOLVERS_PROPERTY)
            .chain(evolvers.keys().copied())
            .collect();

        let at_root = path.len() == 1;
        let mut descriptors = Vec::with_capacity(properties.len());
        for property in properties {
            let initial = object.get(property).cloned().unwrap_or(Value::Null);
            let mut descriptor = match evolvers.get(property) {
                Some(name) => {
                    let spec = self.registry.get(name).ok_or_else(|| EngineError::UnknownEvolver {
                        name: name.to_string(),
                    })?;
                    // Root-level dependencies of length one or less name nothing.
                    let dependencies = spec
                        .dependencies
                        .iter()
                        .filter(|raw| !(at_root && raw.len() <= 1))
                        .map(|raw| raw.iter().map(|s| self.parse_segment(s)).collect::<RelativePath>())
                        .collect();
                    PropertyDescriptor::evolving(key(property), initial, spec.evolver.clone())
                        .with_dependencies(dependencies)
                        .with_interests(spec.interests.clone())
                }
                None => PropertyDescriptor::passive(key(property), initial),
            };
            if property == CHILDREN_PROPERTY {
                descriptor = descriptor.as_children();
            }
            if self.child_order_property.as_deref() == Some(property) {
                descriptor = descriptor.as_child_order();
            }
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    /// Unknown channels reach every node; known ones only nodes that declared them.
    fn is_interested_in(&self, interests: &[Key], reason: &Reason) -> bool {
        match reason {
            Reason::Input(event) if self.known_channels.contains(&event.channel) => {
                interests.contains(&event.channel)
            }
            Reason::Input(_) | Reason::Dependency(_) => true,
        }
    }

    fn is_wildcard_segment(&self, segment: &str) -> bool {
        segment == self.wildcard_marker
    }

    fn total_node_count(&self, raw: &Value) -> usize {
        let Some(object) = raw.as_object() else {
            return 0;
        };
        let own = object.keys().filter(|k| k.as_str() != EVOLVERS_PROPERTY).count();
        let children = object
            .get(CHILDREN_PROPERTY)
            .and_then(Value::as_object)
            .map(|children| children.values().map(|c| self.total_node_count(c)).sum())
            .unwrap_or(0);
        own + children
    }
}
