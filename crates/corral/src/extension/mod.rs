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

//! Runtime-loadable extension modules.
//!
//! An extension contributes its own registration table, which resolution
//! searches after the static table in load order. Loading is bootstrapped
//! through the broker itself: the component implementing the
//! [`EXTENSION_CONTRACT`] is resolved as a clone, asked to open the module,
//! and its [`Extension::table`] is merged in. The default implementation is
//! [`ModuleExtension`], which opens shared libraries exporting an
//! [`ExtensionDeclaration`](abi::ExtensionDeclaration).

pub mod abi;
mod module;

pub use module::ModuleExtension;

use libloading::Library;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::broker::Broker;
use crate::component::Instance;
use crate::error::ExtensionError;
use crate::registration::{Record, Registration};

/// Contract name of components that can load extension modules.
pub const EXTENSION_CONTRACT: &str = "corral.extension";

/// What an extension contributes once loaded.
pub struct ExtensionTable {
    pub registrations: Vec<Registration>,
    /// Library the registrations' code lives in. Every record keeps a share.
    pub library: Option<Arc<Library>>,
}

/// Interface of components implementing [`EXTENSION_CONTRACT`].
pub trait Extension: Send + Sync {
    /// Opens the module at `path`.
    fn load(&self, path: &Path, alias: &str) -> Result<(), ExtensionError>;

    /// Runs the module's own initialization once its table is visible to
    /// resolution.
    fn init(&self, _broker: &Broker) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Runs after the module's components are drained.
    fn unload(&self) -> Result<(), ExtensionError>;

    /// Hands over the module's registration table. Called once after `load`.
    fn table(&self) -> Result<ExtensionTable, ExtensionError>;
}

/// A loaded extension as reported by [`Broker::extensions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub alias: String,
    pub path: PathBuf,
    pub components: usize,
}

pub(crate) struct ExtensionEntry {
    pub alias: String,
    pub path: PathBuf,
    pub records: Vec<Arc<Record>>,
    pub loader: Instance,
}

impl ExtensionEntry {
    /// The key under which a new load collides with this entry. The path
    /// always takes part; the alias only when one was requested.
    fn collision(&self, path: &Path, alias: Option<&str>) -> Option<String> {
        if self.path == path {
            return Some(path.display().to_string());
        }
        match alias {
            Some(alias) if self.alias == alias => Some(alias.to_string()),
            _ => None,
        }
    }

    fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            alias: self.alias.clone(),
            path: self.path.clone(),
            components: self.records.len(),
        }
    }
}

/// Loaded extensions in load order.
#[derive(Default)]
pub(crate) struct ExtensionRegistry {
    entries: RwLock<Vec<ExtensionEntry>>,
}

impl ExtensionRegistry {
    pub fn find_duplicate(&self, path: &Path, alias: Option<&str>) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find_map(|entry| entry.collision(path, alias))
    }

    /// Appends `entry` unless a concurrent load got there first, in which
    /// case the entry is handed back with the colliding key.
    pub fn insert(
        &self,
        entry: ExtensionEntry,
        alias_given: bool,
    ) -> Result<(), (ExtensionEntry, String)> {
        let mut entries = self.entries.write();
        let alias = alias_given.then_some(entry.alias.as_str());
        let collision = entries
            .iter()
            .find_map(|existing| existing.collision(&entry.path, alias));
        match collision {
            Some(key) => Err((entry, key)),
            None => {
                entries.push(entry);
                Ok(())
            }
        }
    }

    /// Removes the first entry loaded under `alias`.
    pub fn remove(&self, alias: &str) -> Option<ExtensionEntry> {
        let mut entries = self.entries.write();
        let index = entries.iter().position(|entry| entry.alias == alias)?;
        Some(entries.remove(index))
    }

    pub fn remove_path(&self, path: &Path) -> Option<ExtensionEntry> {
        let mut entries = self.entries.write();
        let index = entries.iter().position(|entry| entry.path == path)?;
        Some(entries.remove(index))
    }

    /// Aliases in load order.
    pub fn aliases(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.alias.clone())
            .collect()
    }

    /// Every record of every extension, in resolution order.
    pub fn records(&self) -> Vec<Arc<Record>> {
        self.entries
            .read()
            .iter()
            .flat_map(|entry| entry.records.iter().cloned())
            .collect()
    }

    pub fn infos(&self) -> Vec<ExtensionInfo> {
        self.entries.read().iter().map(ExtensionEntry::info).collect()
    }
}
