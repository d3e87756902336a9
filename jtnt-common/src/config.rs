//! Agent configuration persisted at the platform config path.
//!
//! All five fields must be present before the first authenticated network
//! call; `validate()` is the gate. The hub may adjust cadences at runtime
//! through heartbeat responses, in which case the in-memory value is
//! updated and persisted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write config: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config field is missing or empty: {0}")]
    MissingField(&'static str),
}

/// Agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub hub_url: String,
    pub agent_token: String,
    #[serde(default)]
    pub heartbeat_sec: u64,
    #[serde(default)]
    pub poll_interval_sec: u64,
}

impl AgentConfig {
    /// Read and parse the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(ConfigError::Read)?;
        let cfg: Self = serde_json::from_slice(&data)?;
        Ok(cfg)
    }

    /// Persist the configuration atomically with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(ConfigError::Write)?;
        }

        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &data).map_err(ConfigError::Write)?;
        set_owner_only(&tmp).map_err(ConfigError::Write)?;
        std::fs::rename(&tmp, path).map_err(ConfigError::Write)?;
        Ok(())
    }

    /// Check that every field required for hub communication is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.is_empty() {
            return Err(ConfigError::MissingField("agent_id"));
        }
        if self.hub_url.is_empty() {
            return Err(ConfigError::MissingField("hub_url"));
        }
        if self.agent_token.is_empty() {
            return Err(ConfigError::MissingField("agent_token"));
        }
        if self.heartbeat_sec == 0 {
            return Err(ConfigError::MissingField("heartbeat_sec"));
        }
        if self.poll_interval_sec == 0 {
            return Err(ConfigError::MissingField("poll_interval_sec"));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentConfig {
        AgentConfig {
            agent_id: "agent-7f3a".to_string(),
            hub_url: "https://hub.example.com".to_string(),
            agent_token: "tok-secret".to_string(),
            heartbeat_sec: 60,
            poll_interval_sec: 30,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let cfg = sample();
        cfg.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.agent_id, cfg.agent_id);
        assert_eq!(loaded.hub_url, cfg.hub_url);
        assert_eq!(loaded.agent_token, cfg.agent_token);
        assert_eq!(loaded.heartbeat_sec, 60);
        assert_eq!(loaded.poll_interval_sec, 30);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        sample().save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut cfg = sample();
        assert!(cfg.validate().is_ok());

        cfg.agent_token = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent_token"));

        let mut cfg = sample();
        cfg.heartbeat_sec = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            AgentConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
