//! Reason routing: which components an untargeted reason is evolved against.

use std::collections::HashMap;

use treeflow_engine::{ComponentUid, Container, Key, Path, Reason};

/// Maps a reason with no explicit target to the cycles it should drive.
///
/// Each pair runs as its own cycle, in order. A router may rewrite the
/// reason per target.
pub trait ReasonRouter: Send {
    fn route(&self, container: &Container, reason: &Reason) -> anyhow::Result<Vec<(ComponentUid, Reason)>>;
}

/// Sends every reason to the root component.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootRouter;

impl ReasonRouter for RootRouter {
    fn route(&self, container: &Container, reason: &Reason) -> anyhow::Result<Vec<(ComponentUid, Reason)>> {
        Ok(vec![(container.root(), reason.clone())])
    }
}

/// Routes input reasons by channel to a fixed component; anything else
/// goes to the root.
#[derive(Debug, Default, Clone)]
pub struct ChannelRouter {
    targets: HashMap<Key, Path>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_channel(mut self, channel: &str, component_path: Path) -> Self {
        self.targets.insert(Key::from(channel), component_path);
        self
    }
}

impl ReasonRouter for ChannelRouter {
    fn route(&self, container: &Container, reason: &Reason) -> anyhow::Result<Vec<(ComponentUid, Reason)>> {
        let Some(path) = reason.channel().and_then(|channel| self.targets.get(channel)) else {
            return RootRouter.route(container, reason);
        };
        let uid = container
            .component_uid(path)
            .ok_or_else(|| anyhow::anyhow!("no component at {path} for channel routing"))?;
        Ok(vec![(uid, reason.clone())])
    }
}

impl<R: ReasonRouter + Sync + ?Sized> ReasonRouter for std::sync::Arc<R> {
    fn route(&self, container: &Container, reason: &Reason) -> anyhow::Result<Vec<(ComponentUid, Reason)>> {
        (**self).route(container, reason)
    }
}
