//! Geolocator configuration management.
//!
//! Handles loading and validating geolocator configuration including:
//! - Default desired accuracy
//! - Provider allow-lists for single-shot and continuous requests
//! - Providers ignored when deciding whether geolocation is enabled
//!
//! Configuration is layered with the `config` crate: built-in defaults, then
//! an optional TOML file, then `GEOLOCATOR_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderId;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GEOLOCATOR";

/// Default desired accuracy in meters.
pub const DEFAULT_DESIRED_ACCURACY_M: f64 = 100.0;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration sources could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A field holds an invalid value.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration fields are invalid", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main geolocator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocatorConfig {
    /// Accuracy in meters a single-shot fix must reach to resolve early.
    pub desired_accuracy_m: f64,

    /// Providers used by single-shot requests. Empty means all.
    pub providers_to_use: Vec<ProviderId>,

    /// Providers used by continuous sessions. Empty means all.
    pub providers_to_use_while_listening: Vec<ProviderId>,

    /// Providers that never count towards "geolocation enabled".
    pub ignored_providers: Vec<ProviderId>,

    /// Capacity of the broadcast event channel.
    pub event_channel_capacity: usize,
}

impl Default for GeolocatorConfig {
    fn default() -> Self {
        Self {
            desired_accuracy_m: DEFAULT_DESIRED_ACCURACY_M,
            providers_to_use: Vec::new(),
            providers_to_use_while_listening: Vec::new(),
            ignored_providers: vec![ProviderId::new("passive"), ProviderId::new("local_database")],
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl GeolocatorConfig {
    /// Load configuration from a TOML file layered under environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or a
    /// load/validation error.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load_layers(Some(path))
    }

    /// Load configuration, falling back to defaults (plus environment
    /// overrides) when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or fails
    /// validation.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_layers(Some(path))
        } else {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            Self::load_layers(None)
        }
    }

    fn load_layers(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("providers_to_use")
                .with_list_parse_key("providers_to_use_while_listening")
                .with_list_parse_key("ignored_providers"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if !is_valid_accuracy(self.desired_accuracy_m) {
            errors.push(ConfigError::ValidationError {
                field: "desired_accuracy_m",
                message: format!(
                    "must be a positive number of meters (got {})",
                    self.desired_accuracy_m
                ),
            });
        }

        if self.event_channel_capacity == 0 {
            errors.push(ConfigError::ValidationError {
                field: "event_channel_capacity",
                message: "must be greater than zero".to_string(),
            });
        }

        let blank = self
            .providers_to_use
            .iter()
            .chain(&self.providers_to_use_while_listening)
            .chain(&self.ignored_providers)
            .any(|p| p.as_str().trim().is_empty());
        if blank {
            errors.push(ConfigError::ValidationError {
                field: "providers",
                message: "provider names must not be empty".to_string(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Whether `provider` is ignored for the enabled check.
    #[must_use]
    pub fn is_ignored(&self, provider: &ProviderId) -> bool {
        self.ignored_providers.contains(provider)
    }
}

/// Whether a value is usable as a desired accuracy.
#[must_use]
pub fn is_valid_accuracy(meters: f64) -> bool {
    meters.is_finite() && meters > 0.0
}

/// The platform configuration file path.
///
/// # Errors
///
/// Returns an error if no home/config directory can be determined.
pub fn default_config_path() -> ConfigResult<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "geolocator").ok_or_else(|| {
        ConfigError::ValidationError {
            field: "path",
            message: "Cannot determine config directory".to_string(),
        }
    })?;
    Ok(dirs.config_dir().join("config.toml"))
}
