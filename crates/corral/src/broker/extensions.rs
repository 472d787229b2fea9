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

//! Loading and unloading extension modules.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use super::Broker;
use crate::audit;
use crate::component::Subject;
use crate::descriptor::{ComponentFlags, Request};
use crate::error::{BrokerError, ExtensionError};
use crate::extension::{ExtensionEntry, ExtensionInfo, EXTENSION_CONTRACT};
use crate::notify::EventKind;
use crate::registration::{Owner, Record};

impl Broker {
    /// Loads the extension module at `path` and merges its components into
    /// resolution after the static table and earlier extensions.
    ///
    /// Fails with [`BrokerError::Duplicated`] when an extension with the same
    /// path, or the same alias if one is given, is already loaded. Without an
    /// alias the file stem is used. Any failure rolls the load back.
    pub fn load(&self, path: &Path, alias: Option<&str>) -> Result<ExtensionInfo, BrokerError> {
        self.ensure_running()?;
        let path = normalize(path);
        let alias_given = alias.is_some();
        let alias = alias.map(str::to_string).unwrap_or_else(|| default_alias(&path));
        let display_path = path.display().to_string();

        if let Some(key) = self
            .extensions
            .find_duplicate(&path, alias_given.then_some(alias.as_str()))
        {
            return Err(BrokerError::Duplicated { key });
        }

        let loader = self.resolve(&Request::contract(EXTENSION_CONTRACT), ComponentFlags::CLONE)?;
        let opened = match loader.as_extension() {
            Some(extension) => extension.load(&path, &alias).and_then(|()| {
                extension.table().map_err(|e| {
                    if let Err(unload_error) = extension.unload() {
                        warn!(alias = %alias, error = %unload_error, "Extension unload hook failed");
                    }
                    e
                })
            }),
            None => Err(ExtensionError::Registration(format!(
                "{} does not implement the extension interface",
                loader.descriptor().type_name()
            ))),
        };
        let table = match opened {
            Ok(table) => table,
            Err(e) => {
                audit::log_extension_load_failed(&alias, &display_path, &e.to_string());
                self.release(loader);
                return Err(e.into());
            }
        };

        let records: Vec<Arc<Record>> = table
            .registrations
            .into_iter()
            .map(|registration| {
                Arc::new(registration.into_record(Some(Owner {
                    alias: alias.clone(),
                    library: table.library.clone(),
                })))
            })
            .collect();
        drop(table.library);

        let hooks = loader.subject();
        let entry = ExtensionEntry {
            alias: alias.clone(),
            path: path.clone(),
            records: records.clone(),
            loader,
        };
        if let Err((entry, key)) = self.extensions.insert(entry, alias_given) {
            self.close(entry);
            return Err(BrokerError::Duplicated { key });
        }

        let initialized = match hooks.component().as_extension() {
            Some(extension) => extension.init(self),
            None => Ok(()),
        };
        if let Err(e) = initialized {
            audit::log_extension_load_failed(&alias, &display_path, &e.to_string());
            if let Some(entry) = self.extensions.remove_path(&path) {
                for record in &entry.records {
                    record.disable();
                }
                self.drain(&entry.alias, &entry.records);
                self.close(entry);
            }
            return Err(e.into());
        }

        if self.config.eager_init() {
            for record in &records {
                self.eager_init(record);
            }
        }

        audit::log_extension_loaded(&alias, &display_path, records.len());
        Ok(ExtensionInfo {
            alias,
            path,
            components: records.len(),
        })
    }

    /// Unloads the extension loaded under `alias`.
    ///
    /// Its components are excluded from resolution immediately. Holders of
    /// live instances receive `REMOVE`; whatever is still live afterwards is
    /// torn down before the module's unload hook runs and the module is
    /// released.
    pub fn unload(&self, alias: &str) -> Result<(), BrokerError> {
        self.ensure_running()?;
        self.unload_entry(alias)
    }

    pub(super) fn unload_entry(&self, alias: &str) -> Result<(), BrokerError> {
        let entry = self.extensions.remove(alias).ok_or_else(|| BrokerError::Missing {
            alias: alias.to_string(),
        })?;

        for record in &entry.records {
            record.disable();
        }
        self.drain(&entry.alias, &entry.records);

        let path = entry.path.display().to_string();
        self.close(entry);
        audit::log_extension_unloaded(alias, &path);
        Ok(())
    }

    /// Publishes `REMOVE` for every live instance of `records`, then tears
    /// down whatever is still live.
    fn drain(&self, alias: &str, records: &[Arc<Record>]) {
        for record in records {
            if record.state().initialized {
                let notify = record.descriptor().notifications_enabled();
                self.announce(EventKind::Remove, &Subject::origin(record), notify);
            }
            for clone in self.clones_of(record) {
                self.announce(EventKind::Remove, &clone.subject, clone.notify);
            }
        }

        for record in records {
            let clones = self.clones_of(record);
            let outstanding = record.state().ref_count + clones.len();
            if outstanding > 0 {
                audit::log_extension_drain_forced(alias, record.descriptor().type_name(), outstanding);
            }
            for clone in clones {
                self.teardown_clone(&clone, true);
            }
            self.teardown_origin(record, true);
        }
    }

    /// Runs the module's unload hook, drops the registry's share of its
    /// records and releases its loader.
    fn close(&self, entry: ExtensionEntry) {
        let ExtensionEntry {
            alias,
            records,
            loader,
            ..
        } = entry;

        if let Some(Err(e)) = loader.as_extension().map(|extension| extension.unload()) {
            warn!(alias = %alias, error = %e, "Extension unload hook failed");
        }
        drop(records);
        self.release(loader);
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn default_alias(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
