//! Runtime configuration, loaded from YAML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vaultkeeper_archive::ArchiveLimits;
use vaultkeeper_core::{EngineInfo, SchemaRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Schema(#[from] vaultkeeper_core::CoreError),
}

/// Identity of the running system, stamped into manifests and compared on restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_database_engine")]
    pub database_engine: String,
}

fn default_schema_version() -> String {
    "4.2".to_string()
}

fn default_database_engine() -> String {
    "sqlite".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            database_engine: default_database_engine(),
        }
    }
}

impl EnvironmentConfig {
    #[must_use]
    pub fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            schema_version: self.schema_version.clone(),
            database_engine: self.database_engine.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultConfig {
    /// SQLite database holding the record store
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Where archives, safety backups and the restore lock live
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Live asset tree bundled into archives and restored from them
    #[serde(default = "default_asset_root")]
    pub asset_root: PathBuf,
    /// Staging area for uploaded archives (default: `<backup_dir>/uploads`)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    /// Schema registry YAML; the built-in registry is used when absent
    #[serde(default)]
    pub schema: Option<PathBuf>,
    #[serde(default)]
    pub limits: ArchiveLimits,
}

fn default_database() -> PathBuf {
    PathBuf::from("./vaultkeeper.sqlite3")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_asset_root() -> PathBuf {
    PathBuf::from("./media")
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            backup_dir: default_backup_dir(),
            asset_root: default_asset_root(),
            staging_dir: None,
            environment: EnvironmentConfig::default(),
            schema: None,
            limits: ArchiveLimits::default(),
        }
    }
}

impl VaultConfig {
    /// Parse a YAML config file from a path
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(content.as_str())
    }

    /// Parse a YAML config from a string
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the YAML is malformed or fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] describing the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("database", &self.database),
            ("backup_dir", &self.backup_dir),
            ("asset_root", &self.asset_root),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!("{name} cannot be empty")));
            }
        }
        if self.environment.schema_version.trim().is_empty() {
            return Err(ConfigError::Validation(
                "environment.schema_version cannot be empty".into(),
            ));
        }
        if self.limits.max_entries == 0 || self.limits.max_uncompressed_bytes == 0 {
            return Err(ConfigError::Validation("archive limits must be greater than zero".into()));
        }
        if self.limits.max_compression_ratio < 1.0 {
            return Err(ConfigError::Validation(
                "limits.max_compression_ratio must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.backup_dir.join("uploads"))
    }

    /// Load the configured schema registry, or the built-in one.
    ///
    /// # Errors
    /// Returns [`ConfigError::Schema`] when the registry cannot be read or is inconsistent.
    pub fn load_registry(&self) -> Result<SchemaRegistry, ConfigError> {
        let registry = match &self.schema {
            Some(path) => SchemaRegistry::from_path(path)?,
            None => SchemaRegistry::builtin()?,
        };
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_takes_defaults() -> Result<(), ConfigError> {
        let config = VaultConfig::parse("database: /var/lib/vault/data.sqlite3\n")?;
        assert_eq!(
            config.database,
            PathBuf::from("/var/lib/vault/data.sqlite3")
        );
        assert_eq!(config.backup_dir, PathBuf::from("./backups"));
        assert_eq!(config.staging_dir(), PathBuf::from("./backups/uploads"));
        assert_eq!(config.environment.engine_info().database_engine, "sqlite");
        assert_eq!(config.limits, ArchiveLimits::default());
        Ok(())
    }

    #[test]
    fn full_yaml_overrides_everything() -> Result<(), ConfigError> {
        let config = VaultConfig::parse(
            r"
database: data.sqlite3
backup_dir: /srv/backups
asset_root: /srv/media
staging_dir: /tmp/uploads
environment:
  schema_version: '5.0'
  database_engine: postgresql
limits:
  max_entries: 500
",
        )?;
        assert_eq!(config.staging_dir(), PathBuf::from("/tmp/uploads"));
        assert_eq!(config.environment.schema_version, "5.0");
        assert_eq!(config.limits.max_entries, 500);
        let default_ratio = ArchiveLimits::default().max_compression_ratio;
        assert_eq!(config.limits.max_compression_ratio, default_ratio);
        Ok(())
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            VaultConfig::parse("database: ''\n"),
            Err(ConfigError::Validation(message)) if message.contains("database")
        ));
        assert!(matches!(
            VaultConfig::parse("limits:\n  max_entries: 0\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            VaultConfig::parse("database: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn builtin_registry_is_the_default() -> Result<(), ConfigError> {
        let registry = VaultConfig::default().load_registry()?;
        assert!(registry.business_entity.is_some());
        Ok(())
    }
}
