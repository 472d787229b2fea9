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

use libloading::Library;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::abi::{ExtensionDeclaration, ExtensionRegistrar, InitHook, UnloadHook, DECLARATION_SYMBOL};
use super::{Extension, ExtensionTable, EXTENSION_CONTRACT};
use crate::broker::Broker;
use crate::component::Component;
use crate::descriptor::{ComponentFlags, Descriptor};
use crate::error::ExtensionError;
use crate::registration::Registration;

/// Loads extension modules from shared libraries.
///
/// Registered by default as the broker's extension loader. Each load resolves
/// a fresh clone, so one instance manages exactly one library.
#[derive(Default)]
pub struct ModuleExtension {
    state: Mutex<ModuleState>,
}

/// `library` is declared last: everything else may point into it.
#[derive(Default)]
struct ModuleState {
    alias: Option<String>,
    registrations: Option<Vec<Registration>>,
    init_hooks: Vec<InitHook>,
    unload_hooks: Vec<UnloadHook>,
    library: Option<Arc<Library>>,
}

#[derive(Default)]
struct Collector {
    registrations: Vec<Registration>,
    init_hooks: Vec<InitHook>,
    unload_hooks: Vec<UnloadHook>,
}

impl ExtensionRegistrar for Collector {
    fn register(&mut self, registration: Registration) {
        self.registrations.push(registration);
    }

    fn on_init(&mut self, hook: InitHook) {
        self.init_hooks.push(hook);
    }

    fn on_unload(&mut self, hook: UnloadHook) {
        self.unload_hooks.push(hook);
    }
}

impl ModuleExtension {
    fn open(path: &Path) -> Result<(Library, ExtensionDeclaration), ExtensionError> {
        let library = unsafe {
            Library::new(path).map_err(|e| ExtensionError::LibraryLoad {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?
        };

        let declaration = unsafe {
            let symbol = library
                .get::<*const ExtensionDeclaration>(DECLARATION_SYMBOL.as_bytes())
                .map_err(|e| ExtensionError::SymbolNotFound {
                    symbol: DECLARATION_SYMBOL.to_string(),
                    error: e.to_string(),
                })?;
            (*symbol).read()
        };

        Ok((library, declaration))
    }
}

impl Component for ModuleExtension {
    fn descriptor(&self) -> Descriptor {
        Descriptor::of::<ModuleExtension>(EXTENSION_CONTRACT)
            .with_flags(ComponentFlags::CLONE | ComponentFlags::DISABLE_NOTIFY)
    }

    fn as_extension(&self) -> Option<&dyn Extension> {
        Some(self)
    }
}

impl Extension for ModuleExtension {
    fn load(&self, path: &Path, alias: &str) -> Result<(), ExtensionError> {
        let mut state = self.state.lock();
        if state.library.is_some() {
            return Err(ExtensionError::Registration(format!(
                "loader already holds module '{}'",
                state.alias.as_deref().unwrap_or_default()
            )));
        }

        let (library, declaration) = Self::open(path)?;
        if let Some((expected, found)) = declaration.incompatibility() {
            return Err(ExtensionError::AbiMismatch { expected, found });
        }

        let mut collector = Collector::default();
        (declaration.register)(&mut collector);
        if collector.registrations.is_empty() {
            return Err(ExtensionError::Registration(format!(
                "{} registers no components",
                path.display()
            )));
        }

        debug!(
            path = %path.display(),
            alias = %alias,
            corral_version = declaration.corral_version,
            components = collector.registrations.len(),
            "Opened extension module"
        );

        state.alias = Some(alias.to_string());
        state.registrations = Some(collector.registrations);
        state.init_hooks = collector.init_hooks;
        state.unload_hooks = collector.unload_hooks;
        state.library = Some(Arc::new(library));
        Ok(())
    }

    fn init(&self, broker: &Broker) -> Result<(), ExtensionError> {
        let state = self.state.lock();
        for hook in &state.init_hooks {
            hook(broker).map_err(ExtensionError::Hook)?;
        }
        Ok(())
    }

    fn unload(&self) -> Result<(), ExtensionError> {
        let mut state = self.state.lock();
        if state.library.is_none() {
            return Err(ExtensionError::NotLoaded);
        }

        let hooks = std::mem::take(&mut state.unload_hooks);
        let outcome = hooks
            .iter()
            .map(|hook| hook())
            .find_map(Result::err)
            .map_or(Ok(()), |e| Err(ExtensionError::Hook(e)));

        drop(hooks);
        state.init_hooks.clear();
        state.registrations = None;
        state.library = None;
        outcome
    }

    fn table(&self) -> Result<ExtensionTable, ExtensionError> {
        let mut state = self.state.lock();
        let registrations = state.registrations.take().ok_or(ExtensionError::NotLoaded)?;
        Ok(ExtensionTable {
            registrations,
            library: state.library.clone(),
        })
    }
}
