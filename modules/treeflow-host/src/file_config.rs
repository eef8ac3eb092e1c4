use anyhow::{Context, Result};
use std::path::Path;

use crate::config::HostConfig;

/// Load a host config from TOML. Missing fields take their defaults.
///
/// ```toml
/// container_id = "editor"
/// command_buffer = 64
///
/// [engine]
/// value_preview_len = 40
/// ```
pub fn load_config(path: &Path) -> Result<HostConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<HostConfig> {
    let config: HostConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
container_id = "editor"

[engine]
value_preview_len = 40
"#,
        )
        .unwrap();
        assert_eq!(config.container_id, "editor");
        assert_eq!(config.engine.value_preview_len, 40);
        assert_eq!(config.engine.initial_worklist_capacity, 1024);
        assert_eq!(config.command_buffer, 256);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse_config("container = \"typo\"").is_err());
        assert!(parse_config("[engine]\nverify_order = false").is_err());
    }

    #[test]
    fn zero_buffer_fails_validation() {
        assert!(parse_config("command_buffer = 0").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let path = std::env::temp_dir().join(format!("treeflow-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "container_id = \"from-disk\"\n").unwrap();
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.container_id, "from-disk");
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config(Path::new("/nonexistent/treeflow.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/treeflow.toml"));
    }
}
