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

//! The component broker.
//!
//! A [`Broker`] owns the static registration table, the loaded extensions,
//! the live clone instances and the notification subscriptions. It is built
//! once with [`Broker::builder`] and shared by reference with every
//! component it manages; components receive it in `init` and `uninit` so
//! they can resolve and release their own dependencies.
//!
//! ```rust
//! use corral::{Broker, Component, ComponentFlags, Descriptor, Registration, Request};
//!
//! #[derive(Default)]
//! struct Clock;
//!
//! impl Component for Clock {
//!     fn descriptor(&self) -> Descriptor {
//!         Descriptor::of::<Clock>("clock")
//!     }
//! }
//!
//! let broker = Broker::builder()
//!     .register(Registration::origin(Clock))
//!     .build();
//!
//! let clock = broker.resolve(&Request::contract("clock"), ComponentFlags::ORIGIN).unwrap();
//! assert!(clock.downcast_ref::<Clock>().is_some());
//! broker.release(clock);
//! broker.shutdown();
//! ```
//!
//! # Locking
//!
//! There is no global lock. The static table is fixed at build time; the
//! extension list, the clone map, the subscription list and each record's
//! lifecycle state have their own locks. Collection locks are never held
//! across calls into components or handlers. A record's state lock is held
//! while its shared instance initializes or uninitializes, so racing first
//! resolutions initialize it exactly once, and a resolution racing its
//! teardown waits for the teardown to finish; a component resolving its
//! dependencies from `init` nests those locks along the dependency graph,
//! which must therefore be acyclic.

mod extensions;
mod lifecycle;

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::events;
use crate::component::{Instance, InstanceId, InstanceKind};
use crate::config::BrokerConfig;
use crate::descriptor::{ComponentFlags, Descriptor, Request};
use crate::error::BrokerError;
use crate::extension::{ExtensionInfo, ExtensionRegistry, ModuleExtension};
use crate::notify::{Handler, NotificationBroker, Subscription, SubscriptionHandle};
use crate::registration::{linked_components, Record, Registration, StateFlags};
use crate::task::{RuntimeTaskMaker, TaskHandle, TaskMaker};

use lifecycle::CloneRecord;

/// Snapshot of one record for introspection.
#[derive(Debug, Clone)]
pub struct RegistrationInfo {
    pub descriptor: Descriptor,
    pub state: StateFlags,
    /// Outstanding references to the shared instance.
    pub reference_count: usize,
    pub live_clones: usize,
    /// Alias of the extension the record came from.
    pub extension: Option<String>,
}

/// Registry, resolver and lifecycle manager for components.
pub struct Broker {
    config: BrokerConfig,
    statics: Vec<Arc<Record>>,
    extensions: ExtensionRegistry,
    clones: Mutex<BTreeMap<InstanceId, Arc<CloneRecord>>>,
    origin_tasks: Mutex<HashMap<InstanceId, TaskHandle>>,
    notifications: NotificationBroker,
    tasks: Box<dyn TaskMaker>,
    shut_down: AtomicBool,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Initializes shared instances eagerly when configured to, then loads
    /// the configured extensions in order.
    pub fn start(&self) -> Result<(), BrokerError> {
        self.ensure_running()?;
        if self.config.eager_init() {
            for record in &self.statics {
                self.eager_init(record);
            }
        }
        for spec in self.config.extensions() {
            self.load(&self.config.extension_path(&spec.path), spec.alias.as_deref())?;
        }
        Ok(())
    }

    /// Finds the first enabled component matching `request` and returns an
    /// instance of it through one of the strategies in `strategy`.
    ///
    /// The static table is searched first, then each extension in load
    /// order. When both strategies are accepted and offered, the shared
    /// instance is preferred. `DISABLE_NOTIFY` in `strategy` silences the
    /// lifecycle notifications of a clone created by this call.
    pub fn resolve(
        &self,
        request: &Request,
        strategy: ComponentFlags,
    ) -> Result<Instance, BrokerError> {
        self.ensure_running()?;
        let record = self.find(request)?;
        debug!(
            request = %request,
            descriptor = %record.descriptor(),
            "Resolved request"
        );
        self.instantiate(record, strategy)
    }

    /// Resolves by contract name.
    pub fn resolve_contract(
        &self,
        contract: &str,
        strategy: ComponentFlags,
    ) -> Result<Instance, BrokerError> {
        self.resolve(&Request::contract(contract), strategy)
    }

    /// Resolves by concrete type name.
    pub fn resolve_type(
        &self,
        type_name: &str,
        strategy: ComponentFlags,
    ) -> Result<Instance, BrokerError> {
        self.resolve(&Request::type_name(type_name), strategy)
    }

    /// Gives back an instance obtained from [`Broker::resolve`].
    ///
    /// Releasing the last reference to a clone tears it down. Instances the
    /// broker no longer tracks are ignored.
    pub fn release(&self, instance: Instance) {
        match instance.kind() {
            InstanceKind::Origin => self.release_origin(instance),
            InstanceKind::Clone => self.release_clone(instance),
        }
    }

    /// Registers `handler` for lifecycle events matching `subscription`.
    pub fn subscribe(
        &self,
        subscription: Subscription,
        handler: Handler,
    ) -> Result<SubscriptionHandle, BrokerError> {
        self.ensure_running()?;
        if subscription.is_empty() {
            return Err(BrokerError::InvalidSubscription);
        }
        Ok(self.notifications.subscribe(subscription, handler))
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.notifications.unsubscribe(handle)
    }

    pub fn subscription_count(&self) -> usize {
        self.notifications.count()
    }

    /// Outstanding references to `instance`: the shared count for an origin,
    /// one for a tracked clone.
    pub fn reference_count(&self, instance: &Instance) -> usize {
        match instance.kind() {
            InstanceKind::Origin => instance.record().state().ref_count,
            InstanceKind::Clone => usize::from(self.clones.lock().contains_key(&instance.id())),
        }
    }

    /// Live clones whose descriptor matches `request`.
    pub fn live_clones(&self, request: &Request) -> usize {
        self.clones
            .lock()
            .values()
            .filter(|clone| request.matches(clone.subject.descriptor()))
            .count()
    }

    /// Every record, static table first, then extensions in load order.
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        let clone_parents: Vec<Arc<Record>> = self
            .clones
            .lock()
            .values()
            .map(|clone| Arc::clone(clone.subject.record()))
            .collect();

        self.statics
            .iter()
            .cloned()
            .chain(self.extensions.records())
            .map(|record| {
                let reference_count = record.state().ref_count;
                let live_clones = clone_parents
                    .iter()
                    .filter(|parent| Arc::ptr_eq(parent, &record))
                    .count();
                RegistrationInfo {
                    descriptor: record.descriptor().clone(),
                    state: record.state_flags(),
                    reference_count,
                    live_clones,
                    extension: record.extension().map(str::to_string),
                }
            })
            .collect()
    }

    /// Loaded extensions in load order.
    pub fn extensions(&self) -> Vec<ExtensionInfo> {
        self.extensions.infos()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Unloads every extension in reverse load order, tears down remaining
    /// clones, uninitializes shared instances in reverse table order and
    /// stops the task runtime. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for alias in self.extensions.aliases().into_iter().rev() {
            // Errors are logged by the unload path.
            let _ = self.unload_entry(&alias);
        }

        let remaining: Vec<Arc<CloneRecord>> =
            self.clones.lock().values().rev().cloned().collect();
        for clone in remaining {
            self.teardown_clone(&clone, true);
        }

        for record in self.statics.iter().rev() {
            self.teardown_origin(record, true);
        }

        self.notifications.clear();
        self.tasks.shutdown();
        info!(event_type = events::BROKER_SHUTDOWN, "Broker shut down");
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.is_shut_down() {
            Err(BrokerError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Whether `record` is in the static table or a loaded extension.
    fn owns(&self, record: &Arc<Record>) -> bool {
        self.statics.iter().any(|own| Arc::ptr_eq(own, record))
            || self
                .extensions
                .records()
                .iter()
                .any(|own| Arc::ptr_eq(own, record))
    }

    fn find(&self, request: &Request) -> Result<Arc<Record>, BrokerError> {
        let eligible = |record: &Arc<Record>| {
            !record.is_disabled() && request.matches(record.descriptor())
        };

        if let Some(record) = self.statics.iter().find(|record| eligible(record)) {
            return Ok(Arc::clone(record));
        }

        self.extensions
            .records()
            .into_iter()
            .find(|record| eligible(record))
            .ok_or_else(|| BrokerError::NotFound {
                request: request.to_string(),
            })
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    config: BrokerConfig,
    registrations: Vec<Registration>,
    default_loader: bool,
    tasks: Option<Box<dyn TaskMaker>>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            config: BrokerConfig::default(),
            registrations: Vec::new(),
            default_loader: true,
            tasks: None,
        }
    }
}

impl BrokerBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Appends a component to the static table.
    pub fn register(mut self, registration: Registration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Appends every component submitted with
    /// [`submit_component!`](crate::submit_component).
    pub fn with_linked_components(mut self) -> Self {
        self.registrations.extend(linked_components());
        self
    }

    /// Leaves [`ModuleExtension`] out of the static table.
    pub fn without_default_extension_loader(mut self) -> Self {
        self.default_loader = false;
        self
    }

    /// Replaces the default tokio-backed task maker.
    pub fn task_maker(mut self, tasks: impl TaskMaker + 'static) -> Self {
        self.tasks = Some(Box::new(tasks));
        self
    }

    pub fn build(self) -> Broker {
        let BrokerBuilder {
            config,
            mut registrations,
            default_loader,
            tasks,
        } = self;

        if default_loader {
            registrations.push(Registration::clonable(ModuleExtension::default(), || {
                Ok(ModuleExtension::default())
            }));
        }

        let tasks = tasks.unwrap_or_else(|| {
            Box::new(RuntimeTaskMaker::new(
                config.task_threads(),
                config.task_stop_retries(),
                config.task_stop_interval(),
            ))
        });

        let statics: Vec<Arc<Record>> = registrations
            .into_iter()
            .map(|registration| Arc::new(registration.into_record(None)))
            .collect();

        debug!(components = statics.len(), "Broker built");

        Broker {
            config,
            statics,
            extensions: ExtensionRegistry::default(),
            clones: Mutex::new(BTreeMap::new()),
            origin_tasks: Mutex::new(HashMap::new()),
            notifications: NotificationBroker::default(),
            tasks,
            shut_down: AtomicBool::new(false),
        }
    }
}
