//! Client configuration.
//!
//! Configuration supplies the lowest layer of option defaults: container options
//! and per-call overrides are merged on top of it. The file is optional; when it is
//! missing every default applies.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use watchstore_types::{ErrorPolicy, FetchPolicy, MutationOptions, OperationOptions, is_valid_operation_name};

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "WATCHSTORE_CONFIG_PATH";

/// Defaults applied to every container created by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    pub fetch_policy: Option<FetchPolicy>,
    #[serde(default)]
    pub error_policy: Option<ErrorPolicy>,
    /// Default for mutation containers that do not set `allowOverlap` themselves.
    #[serde(default)]
    pub allow_overlap: bool,
    /// Prefix for generated names of combined operations. Defaults to the operation kind.
    #[serde(default)]
    pub operation_name_prefix: Option<String>,
}

impl ClientConfig {
    /// Option defaults for queries, lazy queries and subscriptions.
    pub fn request_defaults(&self) -> OperationOptions {
        OperationOptions {
            fetch_policy: self.fetch_policy,
            error_policy: self.error_policy,
            ..OperationOptions::default()
        }
    }

    /// Option defaults for mutations.
    pub fn mutation_defaults(&self) -> MutationOptions {
        MutationOptions {
            request: self.request_defaults(),
            allow_overlap: Some(self.allow_overlap),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid operation name prefix '{prefix}': must start with a letter or underscore and contain only letters, digits and underscores")]
    InvalidPrefix { prefix: String },
}

/// Returns the default path for the configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("watchstore").join("config.json")
}

/// Loads configuration from the default path.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from `path`. YAML is used for `.yaml`/`.yml` files, JSON otherwise.
pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    if !path.exists() {
        debug!(path = %path.display(), "configuration file not found, using defaults");
        return Ok(ClientConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ClientConfig = match path.extension().and_then(|extension| extension.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    validate_config(&config)?;
    debug!(path = %path.display(), "loaded client configuration");
    Ok(config)
}

/// Validate a configuration value.
pub fn validate_config(config: &ClientConfig) -> Result<(), ConfigError> {
    if let Some(prefix) = &config.operation_name_prefix
        && !is_valid_operation_name(prefix)
    {
        return Err(ConfigError::InvalidPrefix { prefix: prefix.clone() });
    }
    Ok(())
}
