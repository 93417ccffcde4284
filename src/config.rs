//! Configuration loading.
//!
//! Loads `~/.confcom/config.toml` (or `$CONFCOM_CONFIG_PATH`). Environment
//! variables override file values; file values override defaults. A missing
//! file yields defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::registry::FRAGMENT_ARTIFACT_TYPE;
use crate::trust::Algorithm;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfcomConfig {
    /// External tool locations.
    pub tools: ToolsConfig,
    /// Per-call subprocess timeouts.
    pub timeouts: TimeoutsConfig,
    /// Signing defaults.
    pub signing: SigningConfig,
    /// Registry settings.
    pub registry: RegistryConfig,
    /// Scratch locations.
    pub paths: PathsConfig,
}

impl ConfcomConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config file {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    fn config_path() -> Result<PathBuf> {
        Self::config_path_with(|key| std::env::var(key).ok())
    }

    /// Resolve the config path using a custom env resolver.
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(path) = env("CONFCOM_CONFIG_PATH") {
            return Ok(PathBuf::from(path));
        }
        Ok(config_dir()?.join("config.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver so tests need not mutate the process environment.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CONFCOM_SIGN1UTIL") {
            self.tools.sign1util = v;
        }
        if let Some(v) = env("CONFCOM_ORAS") {
            self.tools.oras = v;
        }
        if let Some(v) = env("CONFCOM_SIGNING_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.timeouts.signing_secs = n,
                Err(_) => tracing::warn!(
                    var = "CONFCOM_SIGNING_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("CONFCOM_REGISTRY_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.timeouts.registry_secs = n,
                Err(_) => tracing::warn!(
                    var = "CONFCOM_REGISTRY_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("CONFCOM_SCRATCH_DIR") {
            self.paths.scratch_dir = PathBuf::from(v);
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed TOML or mistyped fields.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Timeout for each signing tool call.
    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.signing_secs)
    }

    /// Timeout for each registry tool call.
    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.registry_secs)
    }

    /// Configured default signing algorithm.
    ///
    /// # Errors
    ///
    /// Returns an error naming the unsupported algorithm.
    pub fn algorithm(&self) -> Result<Algorithm> {
        self.signing
            .algorithm
            .parse()
            .context("invalid [signing] algorithm in config")
    }
}

/// Directory holding the config file: `~/.confcom`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".confcom"))
}

/// External tool locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// `sign1util` binary name or path.
    pub sign1util: String,
    /// `oras` binary name or path.
    pub oras: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            sign1util: "sign1util".to_owned(),
            oras: "oras".to_owned(),
        }
    }
}

/// Subprocess timeouts in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Per-call budget for `sign1util`.
    pub signing_secs: u64,
    /// Per-call budget for `oras`.
    pub registry_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            signing_secs: 60,
            registry_secs: 120,
        }
    }
}

/// Signing defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Default algorithm name.
    pub algorithm: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default().to_string(),
        }
    }
}

/// Registry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Artifact type used for discover and attach.
    pub artifact_type: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            artifact_type: FRAGMENT_ARTIFACT_TYPE.to_owned(),
        }
    }
}

/// Scratch locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory receiving pulled fragments while they are verified.
    pub scratch_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("confcom"),
        }
    }
}
