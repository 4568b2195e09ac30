//! Layered configuration.
//!
//! Sources are merged in this order, later ones winning:
//! 1. built-in defaults
//! 2. an optional YAML file
//! 3. `PROTOKIT__*` environment variables (`__` separates nesting levels,
//!    e.g. `PROTOKIT__SERVER__PORT=6000`)
//! 4. caller-supplied overrides (typically CLI flags)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "PROTOKIT__";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    FileNotFound { path: PathBuf },
    #[error("invalid configuration: {0}")]
    Invalid(#[source] Box<figment::Error>),
    #[error("invalid listen address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        Self::Invalid(Box::new(value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtokitConfig {
    pub codegen: CodegenConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Where generated artifacts go and whether they are regenerated at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodegenConfig {
    pub output_root: PathBuf,
    pub output_dir_name: String,
    /// When false, startup binds the descriptor set from a previous run.
    pub auto_generate: bool,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            output_dir_name: "protos".to_owned(),
            auto_generate: true,
        }
    }
}

impl CodegenConfig {
    /// `<output_root>/<output_dir_name>`
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.output_root.join(&self.output_dir_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_workers: usize,
    /// In-flight call limit; unlimited when absent.
    pub max_concurrent_rpcs: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "[::]".to_owned(),
            port: 50051,
            max_workers: 10,
            max_concurrent_rpcs: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Listen address for the gRPC transport. `host` must be an IP literal.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidAddress`] when `host` is not an IP address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = self.address();
        address
            .parse()
            .map_err(|source| ConfigError::InvalidAddress { address, source })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

impl ProtokitConfig {
    /// Loads defaults, then `path` (if any), then environment variables.
    ///
    /// # Errors
    /// Returns [`ConfigError::FileNotFound`] for a missing file and
    /// [`ConfigError::Invalid`] when any layer fails to deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Ok(Self::figment(path)?.extract()?)
    }

    /// Like [`ProtokitConfig::load`] with a final override layer on top.
    ///
    /// # Errors
    /// See [`ProtokitConfig::load`].
    pub fn load_with<T: Serialize>(path: Option<&Path>, overrides: &T) -> Result<Self, ConfigError> {
        Ok(Self::figment(path)?
            .merge(Serialized::defaults(overrides))
            .extract()?)
    }

    fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Yaml::file(path));
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }
}
