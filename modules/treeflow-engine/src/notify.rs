//! Evolve consumers: asynchronous observers of selected properties.
//!
//! A consumer registers interest in some properties of one component. When
//! any of them changes during a cycle, the consumer receives one snapshot of
//! all of them after the cycle settles. Delivery goes through a
//! [`NotificationSink`] so the engine itself never blocks on a consumer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::arena::Arena;
use crate::types::{Key, NodeIndex, Path, Reason};

/// Receives property snapshots after cycles that changed them.
#[async_trait]
pub trait EvolveConsumer: Send + Sync {
    async fn accept_evolve_result(&self, result: &EvolveResult) -> anyhow::Result<()>;
}

/// One consumer's view of a settled cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvolveResult {
    pub container_id: String,
    pub component: Path,
    pub properties: BTreeMap<Key, Value>,
    /// The cycle's driving reason; `None` for initialization.
    pub reason: Option<Reason>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

pub struct Notification {
    pub consumer_id: ConsumerId,
    pub consumer: Arc<dyn EvolveConsumer>,
    pub result: EvolveResult,
}

impl Notification {
    /// Deliver to the consumer, logging instead of propagating a failure.
    pub async fn deliver(self) {
        if let Err(e) = self.consumer.accept_evolve_result(&self.result).await {
            warn!(
                error = %e,
                consumer = %self.consumer_id,
                component = %self.result.component,
                "Evolve consumer failed"
            );
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("consumer_id", &self.consumer_id)
            .field("result", &self.result)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Hands a settled cycle's notifications to whatever runs consumers.
pub trait NotificationSink: Send {
    fn dispatch(&self, batch: Vec<Notification>);
}

/// Runs each consumer to completion on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineSink;

impl NotificationSink for InlineSink {
    fn dispatch(&self, batch: Vec<Notification>) {
        for notification in batch {
            futures::executor::block_on(notification.deliver());
        }
    }
}

/// Keeps every dispatched result without running consumers.
#[derive(Debug, Default)]
pub struct RecordingSink {
    results: Mutex<Vec<(ConsumerId, EvolveResult)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<(ConsumerId, EvolveResult)> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn results_for(&self, consumer: ConsumerId) -> Vec<EvolveResult> {
        self.results()
            .into_iter()
            .filter(|(id, _)| *id == consumer)
            .map(|(_, result)| result)
            .collect()
    }

    pub fn clear(&self) {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl NotificationSink for RecordingSink {
    fn dispatch(&self, batch: Vec<Notification>) {
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        results.extend(batch.into_iter().map(|n| (n.consumer_id, n.result)));
    }
}

impl<S: NotificationSink + Sync + ?Sized> NotificationSink for Arc<S> {
    fn dispatch(&self, batch: Vec<Notification>) {
        (**self).dispatch(batch)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Registration {
    component: Path,
    nodes: BTreeMap<NodeIndex, Key>,
    consumer: Arc<dyn EvolveConsumer>,
}

#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    next_id: u64,
    registrations: BTreeMap<ConsumerId, Registration>,
    by_node: HashMap<NodeIndex, BTreeSet<ConsumerId>>,
    pending: BTreeSet<ConsumerId>,
}

impl ConsumerRegistry {
    /// Resolve `properties` of the component at `component` now. Missing
    /// properties are logged and skipped.
    pub(crate) fn register(
        &mut self,
        arena: &Arena,
        component: &Path,
        properties: &[&str],
        consumer: Arc<dyn EvolveConsumer>,
    ) -> ConsumerId {
        let id = ConsumerId(self.next_id);
        self.next_id += 1;

        let mut nodes = BTreeMap::new();
        for property in properties {
            match arena.node_index(&component.child(*property)) {
                Some(index) => {
                    nodes.insert(index, Key::from(*property));
                    self.by_node.entry(index).or_default().insert(id);
                }
                None => warn!(
                    component = %component,
                    property = %property,
                    consumer = %id,
                    "Consumer registered for a property that does not exist"
                ),
            }
        }

        self.registrations.insert(
            id,
            Registration {
                component: component.clone(),
                nodes,
                consumer,
            },
        );
        id
    }

    pub(crate) fn unregister(&mut self, id: ConsumerId) -> bool {
        let Some(registration) = self.registrations.remove(&id) else {
            return false;
        };
        for index in registration.nodes.keys() {
            if let Some(ids) = self.by_node.get_mut(index) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_node.remove(index);
                }
            }
        }
        self.pending.remove(&id);
        true
    }

    pub(crate) fn node_changed(&mut self, index: NodeIndex) {
        if let Some(ids) = self.by_node.get(&index) {
            self.pending.extend(ids.iter().copied());
        }
    }

    /// Drop watches on nodes that no longer exist; their slots may be reused.
    pub(crate) fn forget_nodes(&mut self, removed: &HashSet<NodeIndex>) {
        for index in removed {
            let Some(ids) = self.by_node.remove(index) else {
                continue;
            };
            for id in ids {
                if let Some(registration) = self.registrations.get_mut(&id) {
                    registration.nodes.remove(index);
                }
            }
        }
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// One snapshot per consumer with a changed watched property.
    pub(crate) fn drain(&mut self, arena: &Arena, container_id: &str, reason: Option<&Reason>) -> Vec<Notification> {
        let finished_at = Utc::now();
        let pending = std::mem::take(&mut self.pending);

        pending
            .into_iter()
            .filter_map(|id| {
                let registration = self.registrations.get(&id)?;
                if registration.nodes.is_empty() {
                    return None;
                }
                let properties = registration
                    .nodes
                    .iter()
                    .filter_map(|(&index, property)| arena.value(index).map(|v| (property.clone(), v.clone())))
                    .collect();
                Some(Notification {
                    consumer_id: id,
                    consumer: registration.consumer.clone(),
                    result: EvolveResult {
                        container_id: container_id.to_string(),
                        component: registration.component.clone(),
                        properties,
                        reason: reason.cloned(),
                        finished_at,
                    },
                })
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.registrations.len()
    }
}
