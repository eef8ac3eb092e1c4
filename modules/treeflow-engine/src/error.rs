//! Typed errors for indexing and evolve cycles.
//!
//! Lookup misses (a path or index that does not currently exist) are not
//! errors; accessors return `Option`. Everything here either aborts the
//! current cycle or reports a broken invariant.

use thiserror::Error;

use crate::types::{ComponentUid, Path};

#[derive(Debug, Error)]
pub enum EngineError {
    /// A driver targeted a component that is not live.
    #[error("component not found: {path}")]
    UnknownComponent { path: String },

    /// The parser could not read a raw component definition.
    #[error("malformed component definition at {path}: {reason}")]
    MalformedDefinition { path: Path, reason: String },

    /// A definition referenced an evolver the parser does not know.
    #[error("unknown evolver: {name}")]
    UnknownEvolver { name: String },

    /// An evolver failed. Fatal to the current cycle.
    #[error("evolver failed for {path} {property} (reason: {reason}): {source}")]
    Evolver {
        path: Path,
        property: String,
        reason: String,
        #[source]
        source: anyhow::Error,
    },

    /// A child-order value is not a permutation of the current children.
    #[error("child order of {path} does not match children: expected {expected:?}, got {actual:?}")]
    ChildOrderMismatch {
        path: Path,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("component already removed: {uid}")]
    ComponentAlreadyRemoved { uid: ComponentUid },

    #[error("component does not exist: {uid}")]
    ComponentOutOfRange { uid: ComponentUid },
}

impl EngineError {
    /// Invariant violations are programming errors rather than runtime conditions.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            EngineError::ChildOrderMismatch { .. }
                | EngineError::ComponentAlreadyRemoved { .. }
                | EngineError::ComponentOutOfRange { .. }
        )
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
