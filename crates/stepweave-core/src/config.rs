//! Engine configuration loader.
//!
//! Reads `engine.toml` from a configuration directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed, so a bad file never prevents the engine from starting.

use std::path::Path;

use stepweave_types::config::EngineConfig;

/// File name looked up inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "engine.toml";

/// Load engine configuration from `{dir}/engine.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning, returns the default.
/// - Otherwise the parsed config, with zero limits clamped.
pub async fn load_engine_config(dir: &Path) -> EngineConfig {
    let config_path = dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "No {CONFIG_FILE_NAME} found at {}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "Failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config.sanitized(),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepweave_types::config::{ConditionBranching, FailurePolicy};

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            concat!(
                "concurrency_limit = 2\n",
                "failure_policy = \"continue\"\n",
                "condition_branching = \"skip_descendants\"\n",
            ),
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.condition_branching, ConditionBranching::SkipDescendants);
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "concurrency_limit = \"many\"")
            .await
            .unwrap();
        assert_eq!(load_engine_config(tmp.path()).await, EngineConfig::default());
    }

    #[tokio::test]
    async fn zero_limit_is_clamped() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "concurrency_limit = 0")
            .await
            .unwrap();
        assert_eq!(load_engine_config(tmp.path()).await.concurrency_limit, 1);
    }
}
