//! Runs treeflow containers as sessions.
//!
//! A [`Session`] gives one container its own worker thread. Every command
//! submitted to it runs on that thread in order, so the engine itself stays
//! single-threaded. Consumer notifications are delivered on the tokio runtime
//! the session was spawned from.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod file_config;
pub mod router;
pub mod session;
pub mod telemetry;

pub use config::HostConfig;
pub use dispatch::TokioNotificationSink;
pub use error::{HostError, HostResult};
pub use file_config::load_config;
pub use router::{ChannelRouter, ReasonRouter, RootRouter};
pub use session::{EvolveHandle, Session, SessionBuilder};
pub use telemetry::init_tracing;
