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

//! The component contract and the handles the broker hands out.
//!
//! Anything the broker manages implements [`Component`]. Resolution returns an
//! [`Instance`], a usage reference that must be given back to
//! [`Broker::release`](crate::Broker::release) exactly once; because it is
//! consumed by `release` and cannot be cloned, the compiler enforces the
//! "release once" rule for well-behaved callers. Notifications refer to
//! instances through a [`Subject`], which carries identity and descriptor but
//! no reference count.

use std::any::Any;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::broker::Broker;
use crate::descriptor::Descriptor;
use crate::error::ComponentError;
use crate::extension::Extension;
use crate::notify::Notification;
use crate::registration::Record;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Upcast helper so trait objects can be downcast to their concrete type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A unit the broker can register, resolve and manage.
///
/// Origin instances are shared between every caller that resolves them, so
/// all entry points take `&self`; keep mutable state behind a lock.
pub trait Component: AsAny {
    /// Returns the component's self-description.
    fn descriptor(&self) -> Descriptor;

    /// Lifecycle entry. The broker is passed so the component can resolve
    /// what it depends on; returning an error rejects the instance.
    fn init(&self, _broker: &Broker) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Lifecycle exit. Release everything resolved in `init` here.
    fn uninit(&self, _broker: &Broker) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Task body of a `SCHEDULABLE` component. Runs on a task thread after
    /// `init` and should return once [`Component::stop`] has been called.
    fn run(&self) {}

    /// Asks a running task body to return. Returns `true` once it has.
    fn stop(&self) -> bool {
        true
    }

    /// Receives lifecycle notifications for subscriptions this instance
    /// handles.
    fn on_notify(&self, _broker: &Broker, _event: &Notification) {}

    /// Returns the extension interface if this component implements the
    /// extension contract.
    fn as_extension(&self) -> Option<&dyn Extension> {
        None
    }
}

/// Identity of one live instance, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "#{}", self.0)
    }
}

/// Whether an instance is the shared origin or a per-request clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Origin,
    Clone,
}

/// A resolved component held by a caller.
///
/// Field order matters: the component is dropped before the record,
/// which may own the library the component's code lives in.
pub struct Instance {
    component: Arc<dyn Component>,
    id: InstanceId,
    kind: InstanceKind,
    record: Arc<Record>,
}

impl Instance {
    pub(crate) fn new(
        component: Arc<dyn Component>,
        id: InstanceId,
        kind: InstanceKind,
        record: Arc<Record>,
    ) -> Self {
        Self {
            component,
            id,
            kind,
            record,
        }
    }

    /// A new usage reference to `record`'s shared instance.
    pub(crate) fn origin(record: &Arc<Record>) -> Self {
        Self::new(
            record.prototype(),
            record.origin_id(),
            InstanceKind::Origin,
            Arc::clone(record),
        )
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn is_clone(&self) -> bool {
        self.kind == InstanceKind::Clone
    }

    pub fn descriptor(&self) -> &Descriptor {
        self.record.descriptor()
    }

    pub fn component(&self) -> &dyn Component {
        self.component.as_ref()
    }

    /// Borrows the instance as its concrete type.
    pub fn downcast_ref<T: Component>(&self) -> Option<&T> {
        self.component().as_any().downcast_ref::<T>()
    }

    pub fn as_extension(&self) -> Option<&dyn Extension> {
        self.component().as_extension()
    }

    /// A non-counting view of this instance, as carried by notifications.
    pub fn subject(&self) -> Subject {
        Subject {
            component: Arc::clone(&self.component),
            id: self.id,
            kind: self.kind,
            record: Arc::clone(&self.record),
        }
    }

    pub(crate) fn record(&self) -> &Arc<Record> {
        &self.record
    }
}

impl Debug for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("descriptor", self.descriptor())
            .finish()
    }
}

/// The instance a notification is about.
///
/// A subject does not hold a reference count; use [`Subject::id`] to match it
/// against instances you hold.
#[derive(Clone)]
pub struct Subject {
    component: Arc<dyn Component>,
    id: InstanceId,
    kind: InstanceKind,
    record: Arc<Record>,
}

impl Subject {
    pub(crate) fn origin(record: &Arc<Record>) -> Self {
        Subject {
            component: record.prototype(),
            id: record.origin_id(),
            kind: InstanceKind::Origin,
            record: Arc::clone(record),
        }
    }

    pub(crate) fn record(&self) -> &Arc<Record> {
        &self.record
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn descriptor(&self) -> &Descriptor {
        self.record.descriptor()
    }

    pub fn component(&self) -> &dyn Component {
        self.component.as_ref()
    }

    pub fn downcast_ref<T: Component>(&self) -> Option<&T> {
        self.component().as_any().downcast_ref::<T>()
    }

    /// Whether this subject refers to `instance`.
    pub fn is(&self, instance: &Instance) -> bool {
        self.id == instance.id()
    }
}

impl Debug for Subject {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Subject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("descriptor", self.descriptor())
            .finish()
    }
}
