use crate::core::{EngineError, Result};
use crate::security::SecurityMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration
///
/// Shared by every request built from it. Loadable from JSON:
///
/// ```json
/// { "security_mode": "bypass", "verbose_errors": true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// `bypass` skips every permission check
    pub security_mode: SecurityMode,

    /// Include the failing expression text in `ForbiddenAccess`
    pub verbose_errors: bool,

    /// Upper bound on re-entrant rounds within one trigger drain
    pub max_trigger_drain_rounds: usize,

    /// Evaluate audit bindings
    pub audit_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::Active,
            verbose_errors: false,
            max_trigger_drain_rounds: 64,
            audit_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the security mode
    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    pub fn verbose_errors(mut self, verbose: bool) -> Self {
        self.verbose_errors = verbose;
        self
    }

    pub fn max_trigger_drain_rounds(mut self, rounds: usize) -> Self {
        self.max_trigger_drain_rounds = rounds;
        self
    }

    pub fn audit_enabled(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_trigger_drain_rounds == 0 {
            return Err(EngineError::Configuration(
                "max_trigger_drain_rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.security_mode, SecurityMode::Active);
        assert!(!config.verbose_errors);
        assert_eq!(config.max_trigger_drain_rounds, 64);
        assert!(config.audit_enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .security_mode(SecurityMode::Bypass)
            .verbose_errors(true)
            .max_trigger_drain_rounds(8)
            .audit_enabled(false);

        assert_eq!(config.security_mode, SecurityMode::Bypass);
        assert!(config.verbose_errors);
        assert_eq!(config.max_trigger_drain_rounds, 8);
        assert!(!config.audit_enabled);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "security_mode": "bypass" }"#).unwrap();
        assert_eq!(config.security_mode, SecurityMode::Bypass);
        assert_eq!(config.max_trigger_drain_rounds, 64);
    }

    #[test]
    fn test_rejects_unknown_and_invalid_fields() {
        assert!(EngineConfig::from_json_str(r#"{ "pool_size": 4 }"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{ "max_trigger_drain_rounds": 0 }"#).is_err());
    }
}
