use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ormscope_host::FALLBACK_GROUP;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENTRY_PROCEDURE: &str = "run";
pub const DEFAULT_ROW_LIMIT: usize = 100;

/// Runtime configuration of a playground session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PlaygroundConfig {
    /// Code evaluated once per runtime instance, before any script.
    pub bootstrap: String,
    /// Dependency list, one requirement per line or comma.
    pub requirements: String,
    /// Group given to models that declare none, unless bootstrap binds
    /// `DEFAULT_GROUP`.
    pub default_group: String,
    pub entry_procedure: String,
    pub row_limit: usize,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            bootstrap: String::new(),
            requirements: String::new(),
            default_group: FALLBACK_GROUP.to_string(),
            entry_procedure: DEFAULT_ENTRY_PROCEDURE.to_string(),
            row_limit: DEFAULT_ROW_LIMIT,
        }
    }
}

impl PlaygroundConfig {
    /// Parse a YAML document; absent keys keep their defaults.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed, has unknown keys, or
    /// names an empty group or entry procedure.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid playground config YAML: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file from disk.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.default_group.trim().is_empty() {
            return Err(anyhow!("default_group must not be empty"));
        }
        if self.entry_procedure.trim().is_empty() {
            return Err(anyhow!("entry_procedure must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::PlaygroundConfig;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = PlaygroundConfig::from_yaml_str("requirements: \"text\\nmath\"\nrow_limit: 5\n");
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| unreachable!());
        assert_eq!(config.requirements, "text\nmath");
        assert_eq!(config.row_limit, 5);
        assert_eq!(config.default_group, "sandbox");
        assert_eq!(config.entry_procedure, "run");
    }

    #[test]
    fn unknown_keys_and_empty_groups_are_rejected() {
        assert!(PlaygroundConfig::from_yaml_str("theme: dark\n").is_err());
        assert!(PlaygroundConfig::from_yaml_str("default_group: \"\"\n").is_err());
        assert_eq!(
            PlaygroundConfig::from_yaml_str("   \n").unwrap_or_default(),
            PlaygroundConfig::default()
        );
    }
}
