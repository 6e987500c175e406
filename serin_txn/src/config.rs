//! Startup configuration for the prepared-transaction registry.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default value of `max_prepared_xacts` (spec §6 Configuration).
pub const DEFAULT_MAX_PREPARED_XACTS: usize = 50;

/// Two-phase commit subsystem configuration.
///
/// Fixed at server startup: it sizes the registry's shared-memory
/// array, so it cannot be changed without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoPhaseConfig {
    /// Maximum number of simultaneously prepared transactions.
    #[serde(default = "default_max_prepared_xacts")]
    pub max_prepared_xacts: usize,

    /// Directory holding one state file per prepared transaction,
    /// normally `<data-dir>/pg_twophase`.
    pub state_dir: std::path::PathBuf,
}

fn default_max_prepared_xacts() -> usize {
    DEFAULT_MAX_PREPARED_XACTS
}

impl TwoPhaseConfig {
    /// Load configuration from a YAML file, the same way
    /// `serin_pgwire::auth::AuthConfig` loads its user table.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TwoPhaseConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Registry capacity implied by this configuration.
    pub fn capacity(&self) -> usize {
        self.max_prepared_xacts
    }
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            max_prepared_xacts: DEFAULT_MAX_PREPARED_XACTS,
            state_dir: std::path::PathBuf::from("pg_twophase"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capacity_is_fifty() {
        assert_eq!(TwoPhaseConfig::default().capacity(), 50);
    }

    #[test]
    fn loads_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twophase.yaml");
        fs::write(&path, "max_prepared_xacts: 10\nstate_dir: /data/pg_twophase\n").unwrap();
        let cfg = TwoPhaseConfig::load(&path).unwrap();
        assert_eq!(cfg.max_prepared_xacts, 10);
        assert_eq!(cfg.state_dir, std::path::PathBuf::from("/data/pg_twophase"));
    }
}
