/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Broker configuration.
//!
//! [`BrokerConfig`] is built in code through [`BrokerConfig::builder()`] or
//! loaded from a TOML file with [`ConfigLoader`]:
//!
//! ```toml
//! max_clones = 1024
//! origin_teardown = "on_last_release"
//! eager_init = true
//! task_stop_retries = 20
//! task_stop_interval_ms = 5
//! extension_dir = "${CORRAL_HOME:-/opt/corral}/extensions"
//!
//! [[extensions]]
//! path = "libstorage.so"
//! alias = "storage"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "CORRAL_CONFIG";

/// When a shared instance whose reference count drops to zero is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginTeardown {
    /// Keep it initialized until the broker shuts down.
    #[default]
    OnShutdown,
    /// Tear it down as soon as the last reference is released.
    OnLastRelease,
}

/// An extension module to load at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtensionSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ExtensionSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Configuration for a [`Broker`](crate::Broker).
///
/// ```rust
/// use corral::{BrokerConfig, OriginTeardown};
///
/// let config = BrokerConfig::builder()
///     .max_clones(16)
///     .origin_teardown(OriginTeardown::OnLastRelease)
///     .build();
/// assert_eq!(config.max_clones(), 16);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BrokerConfig {
    max_clones: usize,
    origin_teardown: OriginTeardown,
    eager_init: bool,
    task_stop_retries: u32,
    task_stop_interval: Duration,
    task_threads: usize,
    extension_dir: Option<PathBuf>,
    extensions: Vec<ExtensionSpec>,
}

impl BrokerConfig {
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::default()
    }

    /// Upper bound of live clone instances.
    pub fn max_clones(&self) -> usize {
        self.max_clones
    }

    pub fn origin_teardown(&self) -> OriginTeardown {
        self.origin_teardown
    }

    /// Whether shared instances are initialized at startup.
    pub fn eager_init(&self) -> bool {
        self.eager_init
    }

    /// How many times a stopping task is polled before giving up.
    pub fn task_stop_retries(&self) -> u32 {
        self.task_stop_retries
    }

    pub fn task_stop_interval(&self) -> Duration {
        self.task_stop_interval
    }

    /// Upper bound of concurrently running task bodies.
    pub fn task_threads(&self) -> usize {
        self.task_threads
    }

    pub fn extension_dir(&self) -> Option<&Path> {
        self.extension_dir.as_deref()
    }

    /// Extensions loaded by [`Broker::start`](crate::Broker::start).
    pub fn extensions(&self) -> &[ExtensionSpec] {
        &self.extensions
    }

    /// Resolves a relative extension path against `extension_dir`.
    pub fn extension_path(&self, path: &Path) -> PathBuf {
        match &self.extension_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfigBuilder::default().build()
    }
}

/// Builder for [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl Default for BrokerConfigBuilder {
    fn default() -> Self {
        Self {
            config: BrokerConfig {
                max_clones: 4096,
                origin_teardown: OriginTeardown::OnShutdown,
                eager_init: false,
                task_stop_retries: 10,
                task_stop_interval: Duration::from_millis(10),
                task_threads: 8,
                extension_dir: None,
                extensions: Vec::new(),
            },
        }
    }
}

impl BrokerConfigBuilder {
    pub fn max_clones(mut self, value: usize) -> Self {
        self.config.max_clones = value;
        self
    }

    pub fn origin_teardown(mut self, value: OriginTeardown) -> Self {
        self.config.origin_teardown = value;
        self
    }

    pub fn eager_init(mut self, value: bool) -> Self {
        self.config.eager_init = value;
        self
    }

    pub fn task_stop_retries(mut self, value: u32) -> Self {
        self.config.task_stop_retries = value;
        self
    }

    pub fn task_stop_interval(mut self, value: Duration) -> Self {
        self.config.task_stop_interval = value;
        self
    }

    pub fn task_threads(mut self, value: usize) -> Self {
        self.config.task_threads = value;
        self
    }

    pub fn extension_dir(mut self, value: Option<PathBuf>) -> Self {
        self.config.extension_dir = value;
        self
    }

    /// Adds an extension to load at startup.
    pub fn extension(mut self, value: ExtensionSpec) -> Self {
        self.config.extensions.push(value);
        self
    }

    pub fn build(self) -> BrokerConfig {
        self.config
    }
}

/// On-disk form of [`BrokerConfig`]. Absent keys keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSettings {
    pub max_clones: Option<usize>,
    pub origin_teardown: Option<OriginTeardown>,
    pub eager_init: Option<bool>,
    pub task_stop_retries: Option<u32>,
    pub task_stop_interval_ms: Option<u64>,
    pub task_threads: Option<usize>,
    pub extension_dir: Option<PathBuf>,
    #[serde(default)]
    pub extensions: Vec<ExtensionSpec>,
}

impl BrokerSettings {
    /// Validates the settings and applies them over the defaults.
    pub fn into_config(self) -> Result<BrokerConfig, ConfigError> {
        let mut builder = BrokerConfig::builder();

        if let Some(max_clones) = self.max_clones {
            if max_clones == 0 {
                return Err(ConfigError::Validation(
                    "max_clones must be greater than zero".to_string(),
                ));
            }
            builder = builder.max_clones(max_clones);
        }
        if let Some(task_threads) = self.task_threads {
            if task_threads == 0 {
                return Err(ConfigError::Validation(
                    "task_threads must be greater than zero".to_string(),
                ));
            }
            builder = builder.task_threads(task_threads);
        }
        if let Some(teardown) = self.origin_teardown {
            builder = builder.origin_teardown(teardown);
        }
        if let Some(eager_init) = self.eager_init {
            builder = builder.eager_init(eager_init);
        }
        if let Some(retries) = self.task_stop_retries {
            builder = builder.task_stop_retries(retries);
        }
        if let Some(interval) = self.task_stop_interval_ms {
            builder = builder.task_stop_interval(Duration::from_millis(interval));
        }

        let mut aliases = Vec::new();
        for spec in self.extensions {
            if let Some(alias) = &spec.alias {
                if aliases.contains(alias) {
                    return Err(ConfigError::Validation(format!(
                        "extension alias '{}' is listed twice",
                        alias
                    )));
                }
                aliases.push(alias.clone());
            }
            builder = builder.extension(spec);
        }

        Ok(builder.extension_dir(self.extension_dir).build())
    }
}

/// Finds and reads broker configuration files.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Searches `./corral.toml`, the user config directory and `/etc/corral`.
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("./corral.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("corral").join("config.toml"));
        }
        search_paths.push(PathBuf::from("/etc/corral/config.toml"));
        Self { search_paths }
    }

    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Loads `config_file`, the file named by `CORRAL_CONFIG`, or the first
    /// file found in the search paths, in that order.
    pub fn load_config(&self, config_file: Option<&Path>) -> Result<BrokerConfig, ConfigError> {
        let config_path = if let Some(path) = config_file {
            path.to_path_buf()
        } else if let Ok(env_config) = env::var(CONFIG_ENV_VAR) {
            PathBuf::from(env_config)
        } else {
            self.find_config_file().ok_or(ConfigError::ConfigNotFound)?
        };

        tracing::debug!(path = %config_path.display(), "Loading broker configuration");
        self.load_config_from_file(&config_path)
    }

    pub fn load_config_from_file(&self, path: &Path) -> Result<BrokerConfig, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(&content)
    }

    /// Parses TOML content after environment substitution.
    pub fn parse(&self, content: &str) -> Result<BrokerConfig, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        toml::from_str::<BrokerSettings>(&substituted)?.into_config()
    }

    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .find(|path| path.is_file())
            .cloned()
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Expands `${VAR}`, `${VAR:-default}` and `${VAR:?message}`.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let pattern = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::EnvSubstitutionError(e.to_string()))?;

    let mut result = String::with_capacity(content.len());
    let mut last = 0;
    for cap in pattern.captures_iter(content) {
        let (Some(full), Some(expr)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        result.push_str(&content[last..full.start()]);
        result.push_str(&expand(expr.as_str())?);
        last = full.end();
    }
    result.push_str(&content[last..]);
    Ok(result)
}

fn expand(expr: &str) -> Result<String, ConfigError> {
    if let Some((name, default)) = expr.split_once(":-") {
        Ok(env::var(name).unwrap_or_else(|_| default.to_string()))
    } else if let Some((name, message)) = expr.split_once(":?") {
        env::var(name).map_err(|_| {
            ConfigError::EnvSubstitutionError(format!(
                "Required environment variable '{}' is not set: {}",
                name, message
            ))
        })
    } else {
        env::var(expr).map_err(|_| {
            ConfigError::EnvSubstitutionError(format!(
                "Required environment variable '{}' is not set",
                expr
            ))
        })
    }
}
