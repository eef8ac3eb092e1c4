//! A hosted engine instance.
//!
//! Each [`Session`] owns a dedicated OS thread that builds the container
//! and is the only code that ever touches it. Commands arrive over a
//! bounded channel and run strictly in submission order; results come back
//! through [`EvolveHandle`]s. Consumer notifications leave the worker
//! through a [`TokioNotificationSink`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use treeflow_engine::{
    ComponentUid, ConsumerId, Container, ContainerParser, CycleReport, EngineError, EvolveConsumer, NodeIndex,
    NoopCollector, Path, Reason, ResultCollector,
};

use crate::config::HostConfig;
use crate::dispatch::TokioNotificationSink;
use crate::error::{HostError, HostResult};
use crate::router::{ReasonRouter, RootRouter};

/// State owned by the worker thread.
struct Worker {
    container: Container,
    router: Box<dyn ReasonRouter>,
}

impl Worker {
    /// Evolve every target the router picks. Stops at the first failed cycle.
    fn evolve_routed(&mut self, reason: Reason) -> HostResult<Vec<CycleReport>> {
        let routed = self.router.route(&self.container, &reason).map_err(|source| {
            warn!(error = %source, reason = %reason, "Reason routing failed");
            HostError::Routing {
                reason: reason.to_string(),
                source,
            }
        })?;

        let mut reports = Vec::with_capacity(routed.len());
        for (target, reason) in routed {
            reports.push(self.container.evolve(target, reason)?);
        }
        Ok(reports)
    }
}

/// Holds the session's active flag up for as long as the worker runs,
/// including when it unwinds from a panicking job.
struct ActiveGuard(Arc<AtomicBool>);

impl ActiveGuard {
    fn raise(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

enum Command {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// EvolveHandle
// ---------------------------------------------------------------------------

/// Resolves once the submitted command has run on the worker.
#[must_use = "an EvolveHandle does nothing unless awaited"]
pub struct EvolveHandle<T> {
    rx: oneshot::Receiver<HostResult<T>>,
}

impl<T> Future for EvolveHandle<T> {
    type Output = HostResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(HostError::WorkerGone)))
    }
}

// ---------------------------------------------------------------------------
// SessionBuilder
// ---------------------------------------------------------------------------

pub struct SessionBuilder<P> {
    config: HostConfig,
    parser: P,
    collector: Box<dyn ResultCollector>,
    router: Box<dyn ReasonRouter>,
}

impl<P: ContainerParser + 'static> SessionBuilder<P> {
    pub fn with_collector(mut self, collector: impl ResultCollector + 'static) -> Self {
        self.collector = Box::new(collector);
        self
    }

    pub fn with_router(mut self, router: impl ReasonRouter + 'static) -> Self {
        self.router = Box::new(router);
        self
    }

    /// Start the worker, build and initialize the container on it, and
    /// return once initialization has finished.
    ///
    /// Must be called from within a tokio runtime; consumer notifications
    /// are delivered on that runtime.
    pub async fn spawn(self, root_def: Value) -> HostResult<Session> {
        let SessionBuilder {
            config,
            parser,
            collector,
            router,
        } = self;
        config.validate()?;

        let container_id: Arc<str> = Arc::from(config.container_id.as_str());
        let (commands, rx) = mpsc::channel::<Command>(config.command_buffer);
        let (ready_tx, ready_rx) = oneshot::channel::<HostResult<CycleReport>>();
        let active = Arc::new(AtomicBool::new(false));
        let sink = TokioNotificationSink::spawn(&Handle::current(), config.container_id.clone());

        let worker_active = active.clone();
        let worker_name = config.worker_name();
        std::thread::Builder::new()
            .name(worker_name.clone())
            .spawn(move || {
                let built = Container::builder(config.container_id.clone(), parser)
                    .with_config(config.engine)
                    .with_collector(collector)
                    .with_sink(sink)
                    .build(&root_def);
                let container = match built {
                    Ok(container) => container,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };

                let _active = ActiveGuard::raise(worker_active);
                let _ = ready_tx.send(Ok(container.initialization_report().clone()));
                run_worker(Worker { container, router }, rx);
                debug!(container = %config.container_id, "Evolver worker stopped");
            })
            .map_err(HostError::WorkerSpawn)?;

        let report = ready_rx.await.map_err(|_| HostError::WorkerGone)??;
        info!(
            container = %container_id,
            worker = %worker_name,
            components = report.initialized.len(),
            evaluated = report.evaluated,
            "Session started"
        );

        Ok(Session {
            container_id,
            commands,
            active,
            initialization: Arc::new(report),
        })
    }
}

fn run_worker(mut worker: Worker, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Run(job) => job(&mut worker),
            Command::Shutdown(done) => {
                // Anything queued behind the shutdown is dropped with the
                // receiver; those callers see WorkerGone.
                let _ = done.send(());
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Handle to a running engine instance. Clones share the same worker.
#[derive(Clone)]
pub struct Session {
    container_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    active: Arc<AtomicBool>,
    initialization: Arc<CycleReport>,
}

impl Session {
    pub fn builder<P: ContainerParser + 'static>(config: HostConfig, parser: P) -> SessionBuilder<P> {
        SessionBuilder {
            config,
            parser,
            collector: Box::new(NoopCollector),
            router: Box::new(RootRouter),
        }
    }

    /// Spawn with the no-op collector and the root router.
    pub async fn spawn<P: ContainerParser + 'static>(
        config: HostConfig,
        parser: P,
        root_def: Value,
    ) -> HostResult<Session> {
        Self::builder(config, parser).spawn(root_def).await
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Report of the initialization run at spawn.
    pub fn initialization_report(&self) -> &CycleReport {
        &self.initialization
    }

    /// Queue `job` on the worker. Waits only for room in the command channel.
    pub async fn submit<T, F>(&self, job: F) -> HostResult<EvolveHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Container) -> HostResult<T> + Send + 'static,
    {
        self.submit_worker(move |worker| job(&mut worker.container)).await
    }

    async fn submit_worker<T, F>(&self, job: F) -> HostResult<EvolveHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> HostResult<T> + Send + 'static,
    {
        if !self.is_active() {
            return Err(HostError::WorkerGone);
        }
        let (reply, rx) = oneshot::channel();
        let job: Job = Box::new(move |worker| {
            let _ = reply.send(job(worker));
        });
        self.commands
            .send(Command::Run(job))
            .await
            .map_err(|_| HostError::WorkerGone)?;
        Ok(EvolveHandle { rx })
    }

    /// Run a read against the container and wait for the answer.
    pub async fn query<T, F>(&self, read: F) -> HostResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Container) -> T + Send + 'static,
    {
        self.submit(move |container| Ok(read(container))).await?.await
    }

    // -----------------------------------------------------------------------
    // Evolve
    // -----------------------------------------------------------------------

    /// Evolve against whatever the session's router picks for `reason`.
    pub async fn evolve(&self, reason: Reason) -> HostResult<EvolveHandle<Vec<CycleReport>>> {
        self.submit_worker(move |worker| worker.evolve_routed(reason)).await
    }

    pub async fn evolve_path(&self, component_path: Path, reason: Reason) -> HostResult<EvolveHandle<CycleReport>> {
        self.submit(move |container| Ok(container.evolve_path(&component_path, reason)?))
            .await
    }

    pub async fn evolve_uid(&self, uid: ComponentUid, reason: Reason) -> HostResult<EvolveHandle<CycleReport>> {
        self.submit(move |container| Ok(container.evolve(uid, reason)?)).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_property_value(&self, index: NodeIndex) -> HostResult<Option<Value>> {
        self.query(move |container| container.property_value(index).cloned())
            .await
    }

    /// A property of the component at `component_path`. Unknown components
    /// are an error; unknown properties are `None`.
    pub async fn get_property(&self, component_path: Path, property: &str) -> HostResult<Option<Value>> {
        let property = property.to_string();
        self.submit(move |container| {
            if container.component_uid(&component_path).is_none() {
                return Err(EngineError::UnknownComponent {
                    path: component_path.to_string(),
                }
                .into());
            }
            Ok(container.property(&component_path, &property).cloned())
        })
        .await?
        .await
    }

    pub async fn component_uid(&self, component_path: Path) -> HostResult<Option<ComponentUid>> {
        self.query(move |container| container.component_uid(&component_path))
            .await
    }

    pub async fn index_of_path(&self, node_path: Path) -> HostResult<Option<NodeIndex>> {
        self.query(move |container| container.index_of_path(&node_path))
            .await
    }

    pub async fn is_interested_in(&self, uid: ComponentUid, reason: Reason) -> HostResult<bool> {
        self.query(move |container| container.is_interested_in(uid, &reason))
            .await
    }

    pub async fn values(&self) -> HostResult<BTreeMap<Path, Value>> {
        self.query(|container| container.values()).await
    }

    // -----------------------------------------------------------------------
    // Consumers
    // -----------------------------------------------------------------------

    pub async fn add_evolve_consumer(
        &self,
        component_path: Path,
        properties: Vec<String>,
        consumer: Arc<dyn EvolveConsumer>,
    ) -> HostResult<ConsumerId> {
        self.submit(move |container| {
            let properties: Vec<&str> = properties.iter().map(String::as_str).collect();
            Ok(container.add_evolve_consumer(&component_path, &properties, consumer))
        })
        .await?
        .await
    }

    pub async fn remove_evolve_consumer(&self, id: ConsumerId) -> HostResult<bool> {
        self.submit(move |container| Ok(container.remove_evolve_consumer(id)))
            .await?
            .await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop the worker once every command already queued has run. Calling
    /// it again, or from another clone, is a no-op.
    pub async fn shutdown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).await.is_err() {
            return;
        }
        let _ = finished.await;
        info!(container = %self.container_id, "Session shut down");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("container_id", &self.container_id)
            .field("active", &self.is_active())
            .finish()
    }
}
