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

//! Error types for broker operations.
//!
//! [`BrokerError`] is what callers of the broker see. Components report their
//! own failures through [`ComponentError`]; extension modules that cannot be
//! opened or validated surface as [`ExtensionError`].

use std::path::PathBuf;
use thiserror::Error;

use crate::descriptor::ComponentFlags;

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No registered, enabled component matches the request.
    #[error("No component matches request: {request}")]
    NotFound { request: String },

    /// A component matched but offers none of the strategies the caller accepts.
    #[error(
        "Component '{type_name}' does not offer the requested strategy \
         (requested {requested:?}, offered {offered:?})"
    )]
    StrategyMismatch {
        type_name: String,
        requested: ComponentFlags,
        offered: ComponentFlags,
    },

    /// The component's init entry point rejected initialization.
    #[error("Component '{type_name}' rejected initialization: {source}")]
    InitFailed {
        type_name: String,
        #[source]
        source: ComponentError,
    },

    /// A clone could not be produced.
    #[error("Unable to allocate a clone of '{type_name}': {reason}")]
    AllocationFailed { type_name: String, reason: String },

    /// An extension with the same path or alias is already loaded.
    #[error("Extension already loaded: {key}")]
    Duplicated { key: String },

    /// No extension is loaded under the given alias.
    #[error("No extension loaded under alias '{alias}'")]
    Missing { alias: String },

    /// A subscription names no selector.
    #[error("Subscription must name an instance, a contract or a type")]
    InvalidSubscription,

    /// The extension module could not be opened or validated.
    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    /// The broker has been shut down.
    #[error("Broker has been shut down")]
    ShutDown,

    #[error("Unknown broker failure: {0}")]
    Unknown(String),
}

/// Failures reported by component entry points.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("{0}")]
    Failed(String),

    /// The component could not resolve something it depends on.
    #[error("Required dependency '{contract}' unavailable: {source}")]
    Dependency {
        contract: String,
        #[source]
        source: Box<BrokerError>,
    },
}

impl ComponentError {
    /// Creates a plain failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        ComponentError::Failed(message.into())
    }

    /// Wraps a broker error raised while resolving `contract`.
    pub fn dependency(contract: impl Into<String>, source: BrokerError) -> Self {
        ComponentError::Dependency {
            contract: contract.into(),
            source: Box::new(source),
        }
    }
}

/// Errors raised while opening or registering an extension module.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// The dynamic library could not be opened.
    #[error("Failed to load library {path}: {error}")]
    LibraryLoad { path: PathBuf, error: String },

    /// The library does not export the declaration symbol.
    #[error("Symbol '{symbol}' not found in library: {error}")]
    SymbolNotFound { symbol: String, error: String },

    /// The module was built against an incompatible ABI or compiler.
    #[error("Extension ABI mismatch: expected {expected}, found {found}")]
    AbiMismatch { expected: String, found: String },

    /// The module's registration callback produced an unusable table.
    #[error("Extension registration failed: {0}")]
    Registration(String),

    /// The module's init or unload hook failed.
    #[error("Extension hook failed: {0}")]
    Hook(#[source] ComponentError),

    /// The extension component was asked for a table before `load` succeeded.
    #[error("Extension is not loaded")]
    NotLoaded,
}

/// Failures starting a task thread.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Every task slot is taken.
    #[error("All {limit} task slots are in use")]
    Saturated { limit: usize },

    /// The task runtime could not be created or is shut down.
    #[error("Task runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

/// Errors raised while loading broker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in any search location")]
    ConfigNotFound,

    #[error("Failed to read configuration file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Environment variable substitution failed: {0}")]
    EnvSubstitutionError(String),

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}
