//! Operator settings.
//!
//! Settings cover what stays the same from one invocation to the next: where files live, which remote endpoints to
//! talk to and how hard to work. They are layered with `figment`: built-in defaults first, then an optional YAML file,
//! then an optional JSON file, then `TESTBED_`-prefixed environment variables. Later sources win.

use std::{path::PathBuf, time::Duration};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Json, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use testbed_error::GenericError;

use crate::{
    artifacts::DEFAULT_STAGING_BASE_URL,
    images::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_POOL_WIDTH},
    proxy::{toxics::RangeTable, DEFAULT_TOXIPROXY_URL},
};

/// Prefix of the environment variables settings are read from.
pub const ENV_PREFIX: &str = "TESTBED_";

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// A setting had the wrong type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other configuration error.
    #[snafu(display("Failed to load configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

/// Operator settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Where downloaded image archives and their ETags are kept.
    pub image_cache_dir: PathBuf,

    /// Where the composition document is written.
    pub compose_path: PathBuf,

    /// Where the proxy configuration file is written.
    pub toxi_config_path: PathBuf,

    /// Staging host build candidates are resolved against.
    pub staging_base_url: String,

    /// Number of images acquired concurrently.
    pub image_pool_width: usize,

    /// Upper bound on acquiring every image, in seconds.
    pub image_acquire_timeout_secs: u64,

    /// Address of the toxiproxy API.
    pub toxiproxy_url: String,

    /// Orchestrator command line, split on whitespace.
    pub compose_command: String,

    /// Toxic slider calibration.
    pub ranges: RangeTable,

    /// Standalone range table file (`code: [low, high]`) replacing `ranges` when set.
    pub ranges_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_cache_dir: PathBuf::from(".images"),
            compose_path: PathBuf::from("docker-compose.yml"),
            toxi_config_path: PathBuf::from("docker/toxi/toxi.cfg"),
            staging_base_url: DEFAULT_STAGING_BASE_URL.to_string(),
            image_pool_width: DEFAULT_POOL_WIDTH,
            image_acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT.as_secs(),
            toxiproxy_url: DEFAULT_TOXIPROXY_URL.to_string(),
            compose_command: "docker compose".to_string(),
            ranges: RangeTable::default(),
            ranges_file: None,
        }
    }
}

impl Settings {
    pub fn image_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.image_acquire_timeout_secs)
    }

    /// The toxic range table, read from `ranges_file` when one is configured.
    ///
    /// # Errors
    ///
    /// If the range file cannot be read or parsed, an error is returned.
    pub async fn range_table(&self) -> Result<RangeTable, GenericError> {
        match &self.ranges_file {
            Some(path) => RangeTable::load(path).await,
            None => Ok(self.ranges.clone()),
        }
    }

    /// The orchestrator program and its leading arguments.
    pub fn compose_program(&self) -> (String, Vec<String>) {
        let mut parts = self.compose_command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "docker".to_string());
        (program, parts.collect())
    }
}

/// Layers settings sources on top of the defaults.
pub struct SettingsLoader {
    figment: Figment,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(Settings::default())),
        }
    }
}

impl SettingsLoader {
    /// Layers the given YAML file.
    pub fn from_yaml(mut self, path: impl Into<PathBuf>) -> Self {
        self.figment = self.figment.merge(Yaml::file(path.into()));
        self
    }

    /// Layers the given JSON file.
    pub fn from_json(mut self, path: impl Into<PathBuf>) -> Self {
        self.figment = self.figment.merge(Json::file(path.into()));
        self
    }

    /// Layers `TESTBED_`-prefixed environment variables.
    pub fn from_environment(mut self) -> Self {
        self.figment = self.figment.merge(Env::prefixed(ENV_PREFIX));
        self
    }

    /// Extracts the layered settings.
    ///
    /// # Errors
    ///
    /// If a source cannot be parsed or a setting has the wrong type, an error is returned.
    pub fn load(self) -> Result<Settings, ConfigurationError> {
        Ok(self.figment.extract()?)
    }
}
