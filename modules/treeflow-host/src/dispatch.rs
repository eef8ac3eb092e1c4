//! Consumer notification off the evolver worker.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use treeflow_engine::{Notification, NotificationSink};

/// Forwards each settled cycle's notifications to a tokio task, which
/// delivers them one at a time in cycle order. The worker never waits on
/// a consumer.
pub struct TokioNotificationSink {
    batches: mpsc::UnboundedSender<Vec<Notification>>,
}

impl TokioNotificationSink {
    /// Start the delivery task on `handle`. It ends once the sink is dropped
    /// and every queued batch is delivered.
    pub fn spawn(handle: &Handle, container_id: String) -> Self {
        let (batches, mut rx) = mpsc::unbounded_channel::<Vec<Notification>>();
        handle.spawn(async move {
            while let Some(batch) = rx.recv().await {
                for notification in batch {
                    notification.deliver().await;
                }
            }
            debug!(container = %container_id, "Notification dispatcher stopped");
        });
        Self { batches }
    }
}

impl NotificationSink for TokioNotificationSink {
    fn dispatch(&self, batch: Vec<Notification>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.batches.send(batch) {
            warn!(dropped = e.0.len(), "Notification dispatcher is gone");
        }
    }
}
