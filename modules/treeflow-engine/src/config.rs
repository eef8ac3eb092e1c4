use serde::Deserialize;

/// Tuning knobs for a single engine instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Slots reserved in the worklist buffer up front.
    pub initial_worklist_capacity: usize,
    /// Characters of a value rendered in trace output.
    pub value_preview_len: usize,
    /// Children entries whose id contains this marker are diagnostic-only
    /// and never become components.
    pub transient_child_marker: String,
    /// Reject child-order values that are not a permutation of the children.
    pub verify_child_order: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_worklist_capacity: 1024,
            value_preview_len: 100,
            transient_child_marker: "_flex".to_string(),
            verify_child_order: true,
        }
    }
}

impl EngineConfig {
    pub fn is_transient_child(&self, child_id: &str) -> bool {
        !self.transient_child_marker.is_empty() && child_id.contains(&self.transient_child_marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"value_preview_len": 12}"#).unwrap();
        assert_eq!(config.value_preview_len, 12);
        assert_eq!(config.initial_worklist_capacity, 1024);
        assert!(config.verify_child_order);
    }

    #[test]
    fn transient_marker_matches_substring() {
        let config = EngineConfig::default();
        assert!(config.is_transient_child("_flexible-childset-added"));
        assert!(config.is_transient_child("_flex-target-id-paths-added"));
        assert!(!config.is_transient_child("button"));
    }

    #[test]
    fn empty_marker_disables_filtering() {
        let config = EngineConfig {
            transient_child_marker: String::new(),
            ..EngineConfig::default()
        };
        assert!(!config.is_transient_child("_flex"));
    }
}
