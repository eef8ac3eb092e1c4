use thiserror::Error;
use treeflow_engine::EngineError;

#[derive(Debug, Error)]
pub enum HostError {
    /// The engine rejected a command or a cycle failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The session's router could not place a reason; no cycle ran.
    #[error("failed to route {reason}: {source}")]
    Routing {
        reason: String,
        #[source]
        source: anyhow::Error,
    },

    /// The session's worker has stopped; nothing can be submitted to it.
    #[error("evolver worker is gone")]
    WorkerGone,

    #[error("failed to spawn evolver worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("invalid host configuration: {0}")]
    Config(String),
}

pub type HostResult<T> = Result<T, HostError>;
