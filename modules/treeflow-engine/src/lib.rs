//! Reactive evaluation of component trees.
//!
//! A [`Container`] indexes a tree of components into an arena of property
//! nodes. Each node may carry an evolver, a function of the owning component
//! and a [`Reason`], plus declared dependencies on other nodes by relative
//! path. Evolving a component with a reason recomputes every node that
//! cares about it and pushes changes through the dependency graph until the
//! tree settles. Children properties restructure the tree as they change.
//!
//! Observers come in two kinds: a synchronous [`ResultCollector`] that sees
//! every change inside a cycle, and asynchronous [`EvolveConsumer`]s that get
//! one snapshot of their watched properties per cycle.

pub mod arena;
pub mod collector;
pub mod config;
pub mod container;
pub mod error;
pub mod json_parser;
pub mod notify;
pub mod parser;
pub mod propagation;
mod resolver;
pub mod types;
pub mod view;
mod worklist;

pub use arena::Arena;
pub use collector::{CollectorEvent, NoopCollector, RecordingCollector, ResultCollector};
pub use config::EngineConfig;
pub use container::{Container, ContainerBuilder};
pub use error::{EngineError, EngineResult};
pub use json_parser::{EvolverRegistry, EvolverSpec, JsonContainerParser};
pub use notify::{
    ConsumerId, EvolveConsumer, EvolveResult, InlineSink, Notification, NotificationSink, RecordingSink,
};
pub use parser::{ContainerParser, Evolver, PropertyDescriptor};
pub use propagation::CycleReport;
pub use types::{key, ComponentUid, InputEvent, Key, NodeIndex, Path, Reason, RelativePath, Segment, Value};
pub use view::{ComponentRef, ComponentView, ContainerAccessor, ContainerMutator};
