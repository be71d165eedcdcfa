//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the
//! configuration

use std::{
    convert::TryFrom,
    env::{self, VarError},
    path::PathBuf,
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const OPERATOR_WORKERS: i64 = 50;
pub const SPECS_MODE: &str = "crd";
pub const SPECS_PATH: &str = "/etc/config/metac";
pub const SPECS_RETRY_INTERVAL_SECONDS: i64 = 1;
pub const SPECS_LOAD_TIMEOUT_SECONDS: i64 = 30;

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
    #[serde(rename = "workers")]
    pub workers: usize,
}

// -----------------------------------------------------------------------------
// Specs structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum SpecsMode {
    /// specifications come from a directory of yaml or json documents
    Config,
    /// specifications are GenericController custom resources
    Crd,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Specs {
    #[serde(rename = "mode")]
    pub mode: SpecsMode,
    #[serde(rename = "path")]
    pub path: PathBuf,
    #[serde(rename = "retryIntervalSeconds")]
    pub retry_interval_seconds: u64,
    #[serde(rename = "loadTimeoutSeconds")]
    pub load_timeout_seconds: u64,
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to retrieve environment variable '{0}', {1}")]
    EnvironmentVariable(&'static str, VarError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "specs")]
    pub specs: Specs,
}

fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, Error> {
    Config::builder()
        .set_default("operator.listen", OPERATOR_LISTEN)
        .map_err(|err| Error::Default("operator.listen".into(), err))?
        .set_default("operator.workers", OPERATOR_WORKERS)
        .map_err(|err| Error::Default("operator.workers".into(), err))?
        .set_default("specs.mode", SPECS_MODE)
        .map_err(|err| Error::Default("specs.mode".into(), err))?
        .set_default("specs.path", SPECS_PATH)
        .map_err(|err| Error::Default("specs.path".into(), err))?
        .set_default("specs.retryIntervalSeconds", SPECS_RETRY_INTERVAL_SECONDS)
        .map_err(|err| Error::Default("specs.retryIntervalSeconds".into(), err))?
        .set_default("specs.loadTimeoutSeconds", SPECS_LOAD_TIMEOUT_SECONDS)
        .map_err(|err| Error::Default("specs.loadTimeoutSeconds".into(), err))
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        defaults()?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(
                File::from(PathBuf::from(format!(
                    "/usr/share/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// prints messages about the effective configuration
    pub fn help(&self) {
        #[cfg(feature = "metrics")]
        info!("Build with 'metrics' feature flag");

        match self.specs.mode {
            SpecsMode::Config => {
                info!(
                    path = %self.specs.path.display(),
                    "Specifications are loaded from a directory",
                );

                if !self.specs.path.is_dir() {
                    warn!(
                        path = %self.specs.path.display(),
                        "Configuration key 'specs.path' does not point to a directory",
                    );
                }
            }
            SpecsMode::Crd => {
                info!("Specifications are observed as GenericController custom resources");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[operator]
workers = 5

[specs]
mode = "config"
path = "/var/lib/metac/specs"
"#,
        )
        .unwrap();

        let config = Configuration::try_from(path).unwrap();
        assert_eq!(config.operator.listen, OPERATOR_LISTEN);
        assert_eq!(config.operator.workers, 5);
        assert_eq!(config.specs.mode, SpecsMode::Config);
        assert_eq!(config.specs.path, PathBuf::from("/var/lib/metac/specs"));
        assert_eq!(config.specs.retry_interval_seconds, 1);
        assert_eq!(config.specs.load_timeout_seconds, 30);
    }
}
