use std::str::FromStr;

use serde::Deserialize;
use treeflow_engine::EngineConfig;

use crate::error::{HostError, HostResult};

/// Settings for one hosted session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Names the container in logs and evolve results.
    pub container_id: String,
    pub engine: EngineConfig,
    /// The worker thread is named `{prefix}-{container_id}`.
    pub worker_name_prefix: String,
    /// Capacity of the bounded command channel.
    pub command_buffer: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            container_id: uuid::Uuid::new_v4().to_string(),
            engine: EngineConfig::default(),
            worker_name_prefix: "treeflow-evolver".to_string(),
            command_buffer: 256,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> HostResult<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let mut engine = defaults.engine;
        engine.initial_worklist_capacity =
            parse_var("TREEFLOW_WORKLIST_CAPACITY", engine.initial_worklist_capacity)?;
        engine.value_preview_len = parse_var("TREEFLOW_VALUE_PREVIEW_LEN", engine.value_preview_len)?;
        if let Ok(marker) = std::env::var("TREEFLOW_TRANSIENT_CHILD_MARKER") {
            engine.transient_child_marker = marker;
        }

        let config = Self {
            container_id: std::env::var("TREEFLOW_CONTAINER_ID").unwrap_or(defaults.container_id),
            engine,
            worker_name_prefix: defaults.worker_name_prefix,
            command_buffer: parse_var("TREEFLOW_COMMAND_BUFFER", defaults.command_buffer)?,
        };
        config.validate()?;
        config.log_summary();
        Ok(config)
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.command_buffer == 0 {
            return Err(HostError::Config("command_buffer must be at least 1".to_string()));
        }
        if self.container_id.is_empty() {
            return Err(HostError::Config("container_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn worker_name(&self) -> String {
        format!("{}-{}", self.worker_name_prefix, self.container_id)
    }

    pub fn log_summary(&self) {
        tracing::info!("Host config loaded:");
        tracing::info!("  TREEFLOW_CONTAINER_ID: {}", self.container_id);
        tracing::info!("  TREEFLOW_WORKLIST_CAPACITY: {}", self.engine.initial_worklist_capacity);
        tracing::info!("  TREEFLOW_VALUE_PREVIEW_LEN: {}", self.engine.value_preview_len);
        tracing::info!("  TREEFLOW_TRANSIENT_CHILD_MARKER: {}", self.engine.transient_child_marker);
        tracing::info!("  TREEFLOW_COMMAND_BUFFER: {}", self.command_buffer);
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> HostResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| HostError::Config(format!("{name} is not a valid number: {raw}"))),
        Err(_) => Ok(default),
    }
}
