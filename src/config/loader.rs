// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

use crate::transport::Endpoint;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::load_str(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn load_str(content: &str) -> Result<AgentConfig> {
        let content = Self::substitute_env_vars(content)?;

        let config: AgentConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${ALLSPARK_HOST:-localhost:8080} -> localhost:8080 (if ALLSPARK_HOST not set)
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}")
            .context("Invalid substitution pattern")?;

        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string())
    }

    /// Validate configuration
    pub fn validate(config: &AgentConfig) -> Result<()> {
        if let Err(e) = Endpoint::parse(&config.connection.host) {
            bail!("connection.host is invalid: {}", e);
        }

        if config.connection.reconnect_delay_seconds == 0 {
            bail!("connection.reconnect_delay_seconds must be > 0");
        }

        if config.connection.connect_timeout_seconds == 0 {
            bail!("connection.connect_timeout_seconds must be > 0");
        }

        if config.recorder.device_id.trim().is_empty() {
            bail!("recorder.device_id cannot be empty");
        }

        if config.recorder.source.trim().is_empty() {
            bail!("recorder.source cannot be empty");
        }

        if config.recorder.sample_queue_capacity == 0 {
            bail!("recorder.sample_queue_capacity must be > 0");
        }

        if config.recorder.max_pending_bytes == 0 {
            bail!("recorder.max_pending_bytes must be > 0");
        }

        if config.client_defaults.chunk_duration_ms == 0 {
            bail!("client_defaults.chunk_duration_ms must be > 0");
        }

        if config.discovery.enabled && !config.discovery.service_type.ends_with(".local.") {
            bail!(
                "discovery.service_type must end with '.local.', got '{}'",
                config.discovery.service_type
            );
        }

        if config.source.enabled && (config.source.video_fps == 0 || config.source.audio_buffer_ms == 0) {
            bail!("source.video_fps and source.audio_buffer_ms must be > 0");
        }

        match config.logging.format.as_str() {
            "text" | "json" => {}
            unknown => bail!("Unknown logging.format: '{}'. Supported: text, json", unknown),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("ALLSPARK_TEST_VAR", "test_value");

        let input = "host: ${ALLSPARK_TEST_VAR}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "host: test_value");

        std::env::remove_var("ALLSPARK_TEST_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("ALLSPARK_TEST_VAR2");

        let input = "device_id: ${ALLSPARK_TEST_VAR2:-default-device}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "device_id: default-device");
    }

    #[test]
    fn test_validation_empty_device_id() {
        let mut config = AgentConfig::default();
        config.recorder.device_id = "  ".to_string();

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("device_id"));
    }

    #[test]
    fn test_validation_zero_chunk_duration() {
        let mut config = AgentConfig::default();
        config.client_defaults.chunk_duration_ms = 0;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("chunk_duration_ms"));
    }

    #[test]
    fn test_validation_bad_host() {
        let mut config = AgentConfig::default();
        config.connection.host = "ws://".to_string();

        assert!(ConfigLoader::validate(&config).is_err());
    }
}
