//! File + environment configuration.
//!
//! A YAML file supplies the controller, MQTT, and logging sections;
//! `HALOX_*` environment variables override individual fields. The
//! result is translated into the core's runtime config.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use halox_core::ControllerConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── File shape ──────────────────────────────────────────────────────

/// Top-level on-disk configuration.
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub loxone: ControllerSection,

    #[serde(default)]
    pub mqtt: MqttSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct ControllerSection {
    pub host: String,

    #[serde(default = "default_controller_port")]
    pub port: u16,

    pub username: String,

    /// Plaintext in the file; wrapped in a secret before leaving this
    /// module.
    pub password: String,
}

fn default_controller_port() -> u16 {
    80
}

#[derive(Debug, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".into()
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    /// Append log output to this file instead of stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load the YAML file and merge `HALOX_*` environment overrides
/// (e.g. `HALOX_LOXONE_PASSWORD`).
pub fn load(path: &Path) -> Result<FileConfig, ConfigError> {
    let config = Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed("HALOX_").split("_"))
        .extract()?;
    Ok(config)
}

/// Translate the controller section into the core's runtime config.
pub fn controller_config(file: &FileConfig) -> Result<ControllerConfig, ConfigError> {
    if file.loxone.host.is_empty() {
        return Err(ConfigError::Validation {
            field: "loxone.host",
            reason: "must not be empty".into(),
        });
    }
    if file.loxone.username.is_empty() {
        return Err(ConfigError::Validation {
            field: "loxone.username",
            reason: "must not be empty".into(),
        });
    }

    Ok(ControllerConfig {
        host: file.loxone.host.clone(),
        port: file.loxone.port,
        username: file.loxone.username.clone(),
        password: SecretString::from(file.loxone.password.clone()),
    })
}
