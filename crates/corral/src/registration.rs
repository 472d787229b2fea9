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

//! Registration of components with a broker.
//!
//! A [`Registration`] is what a process or an extension module hands to the
//! broker: a component's prototype, its descriptor and, for clonable
//! components, the factory that builds fresh instances. Once accepted, each
//! registration becomes a [`Record`] carrying the mutable lifecycle state.
//!
//! Components can also be linked in process-wide:
//!
//! ```rust,ignore
//! use corral::{submit_component, Registration};
//!
//! submit_component!(|| Registration::origin(Clock::default()));
//! ```
//!
//! and picked up with [`BrokerBuilder::with_linked_components`](crate::BrokerBuilder::with_linked_components).

use libloading::Library;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use crate::component::{Component, InstanceId};
use crate::descriptor::{ComponentFlags, Descriptor};
use crate::error::ComponentError;

/// Builds a fresh, independently owned instance of a clonable component.
pub type CloneFactory =
    Box<dyn Fn() -> Result<Arc<dyn Component>, ComponentError> + Send + Sync>;

bitflags::bitflags! {
    /// Lifecycle state of a record as reported by introspection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StateFlags: u8 {
        /// Excluded from resolution because its extension was unloaded.
        const DISABLED = 1 << 0;
        /// The shared instance has been initialized.
        const INITIALIZED = 1 << 1;
    }
}

/// A component offered to the broker.
pub struct Registration {
    descriptor: Descriptor,
    prototype: Arc<dyn Component>,
    factory: Option<CloneFactory>,
}

impl Registration {
    /// Registers `component` as a shared instance.
    pub fn origin<C: Component>(component: C) -> Self {
        let descriptor = component.descriptor();
        Self {
            descriptor,
            prototype: Arc::new(component),
            factory: None,
        }
    }

    /// Registers `prototype` together with the factory used for `CLONE`
    /// resolutions. The prototype doubles as the shared instance when the
    /// descriptor also offers `ORIGIN`.
    pub fn clonable<C, F>(prototype: C, factory: F) -> Self
    where
        C: Component,
        F: Fn() -> Result<C, ComponentError> + Send + Sync + 'static,
    {
        let descriptor = prototype.descriptor();
        Self {
            descriptor,
            prototype: Arc::new(prototype),
            factory: Some(Box::new(move || {
                factory().map(|c| Arc::new(c) as Arc<dyn Component>)
            })),
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub(crate) fn into_record(self, owner: Option<Owner>) -> Record {
        let (extension, library) = match owner {
            Some(owner) => (Some(owner.alias), owner.library),
            None => (None, None),
        };
        Record {
            descriptor: self.descriptor,
            prototype: self.prototype,
            factory: self.factory,
            origin_id: InstanceId::next(),
            state: Mutex::new(RecordState::default()),
            settled: Condvar::new(),
            disabled: AtomicBool::new(false),
            extension,
            library,
        }
    }
}

impl Debug for Registration {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Registration")
            .field("descriptor", &self.descriptor)
            .field("clonable", &self.factory.is_some())
            .finish()
    }
}

/// The extension a record came from.
pub(crate) struct Owner {
    pub alias: String,
    pub library: Option<Arc<Library>>,
}

#[derive(Debug, Default)]
pub(crate) struct RecordState {
    pub initialized: bool,
    pub ref_count: usize,
    /// Thread tearing the shared instance down, if any.
    pub teardown: Option<ThreadId>,
}

/// A registration accepted into a table.
///
/// `library` is declared last so the module stays mapped until the prototype
/// and factory are gone.
pub(crate) struct Record {
    descriptor: Descriptor,
    prototype: Arc<dyn Component>,
    factory: Option<CloneFactory>,
    origin_id: InstanceId,
    state: Mutex<RecordState>,
    settled: Condvar,
    disabled: AtomicBool,
    extension: Option<String>,
    library: Option<Arc<Library>>,
}

impl Record {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn prototype(&self) -> Arc<dyn Component> {
        Arc::clone(&self.prototype)
    }

    pub fn origin_id(&self) -> InstanceId {
        self.origin_id
    }

    /// Strategies this record can actually serve. `CLONE` needs a factory.
    pub fn offered(&self) -> ComponentFlags {
        let mut offered = self.descriptor.flags().strategies();
        if self.factory.is_none() {
            offered.remove(ComponentFlags::CLONE);
        }
        offered
    }

    pub fn make_clone(&self) -> Result<Arc<dyn Component>, ComponentError> {
        match &self.factory {
            Some(factory) => factory(),
            None => Err(ComponentError::failed(format!(
                "{} has no clone factory",
                self.descriptor.type_name()
            ))),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    /// Blocks until the teardown in progress finishes.
    pub fn wait_settled(&self, state: &mut MutexGuard<'_, RecordState>) {
        self.settled.wait(state);
    }

    pub fn notify_settled(&self) {
        self.settled.notify_all();
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn state_flags(&self) -> StateFlags {
        let mut flags = StateFlags::empty();
        if self.is_disabled() {
            flags |= StateFlags::DISABLED;
        }
        if self.state().initialized {
            flags |= StateFlags::INITIALIZED;
        }
        flags
    }

    #[cfg(test)]
    pub fn has_library(&self) -> bool {
        self.library.is_some()
    }
}

/// A component submitted to the process-wide link table with
/// [`submit_component!`](crate::submit_component).
pub struct LinkedComponent {
    build: fn() -> Registration,
}

impl LinkedComponent {
    pub const fn new(build: fn() -> Registration) -> Self {
        Self { build }
    }

    pub fn registration(&self) -> Registration {
        (self.build)()
    }
}

inventory::collect!(LinkedComponent);

/// Every component submitted with `submit_component!`, in link order.
pub fn linked_components() -> Vec<Registration> {
    inventory::iter::<LinkedComponent>
        .into_iter()
        .map(LinkedComponent::registration)
        .collect()
}

/// Adds a component to the process-wide link table.
///
/// The argument is a non-capturing closure or function returning a
/// [`Registration`].
#[macro_export]
macro_rules! submit_component {
    ($build:expr) => {
        $crate::inventory::submit! {
            $crate::LinkedComponent::new($build)
        }
    };
}
