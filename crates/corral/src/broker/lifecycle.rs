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

//! Instantiation, release and teardown.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

use super::Broker;
use crate::audit::{self, events};
use crate::component::{Instance, InstanceId, InstanceKind, Subject};
use crate::config::OriginTeardown;
use crate::descriptor::ComponentFlags;
use crate::error::BrokerError;
use crate::notify::EventKind;
use crate::registration::Record;
use crate::task::TaskHandle;

/// Tracking for one live clone.
pub(crate) struct CloneRecord {
    pub subject: Subject,
    pub notify: bool,
    pub task: Mutex<Option<TaskHandle>>,
    tearing_down: AtomicBool,
}

impl CloneRecord {
    fn id(&self) -> InstanceId {
        self.subject.id()
    }
}

impl Broker {
    pub(super) fn instantiate(
        &self,
        record: Arc<Record>,
        strategy: ComponentFlags,
    ) -> Result<Instance, BrokerError> {
        let offered = record.offered();
        let usable = strategy & offered;

        if usable.contains(ComponentFlags::ORIGIN) {
            self.instantiate_origin(record)
        } else if usable.contains(ComponentFlags::CLONE) {
            let notify = record.descriptor().notifications_enabled()
                && !strategy.contains(ComponentFlags::DISABLE_NOTIFY);
            self.instantiate_clone(record, notify)
        } else {
            Err(BrokerError::StrategyMismatch {
                type_name: record.descriptor().type_name().to_string(),
                requested: strategy.strategies(),
                offered,
            })
        }
    }

    fn instantiate_origin(&self, record: Arc<Record>) -> Result<Instance, BrokerError> {
        let initialized_now = self.initialize_origin(&record, true)?;
        let instance = Instance::origin(&record);
        if initialized_now {
            self.announce_started(&instance.subject(), true);
        }
        Ok(instance)
    }

    /// Runs `init` on the shared instance if needed. Returns whether this
    /// call initialized it.
    ///
    /// Waits out a teardown running on another thread. A resolution made from
    /// a handler of the teardown itself takes its reference right away; the
    /// teardown then initializes the instance again once `uninit` has run.
    fn initialize_origin(&self, record: &Arc<Record>, take_ref: bool) -> Result<bool, BrokerError> {
        let current = thread::current().id();
        let mut state = record.state();
        while state.teardown.is_some_and(|owner| owner != current) {
            record.wait_settled(&mut state);
        }
        if state.teardown.is_some() {
            if take_ref {
                state.ref_count += 1;
            }
            return Ok(false);
        }

        let initialized_now = if state.initialized {
            false
        } else {
            self.run_init(record)?;
            state.initialized = true;
            true
        };
        if take_ref {
            state.ref_count += 1;
        }
        Ok(initialized_now)
    }

    fn run_init(&self, record: &Arc<Record>) -> Result<(), BrokerError> {
        record.prototype().init(self).map_err(|source| {
            audit::log_component_init_failed(record.descriptor(), &source.to_string());
            BrokerError::InitFailed {
                type_name: record.descriptor().type_name().to_string(),
                source,
            }
        })?;
        audit::log_component_initialized(record.descriptor(), record.origin_id());
        Ok(())
    }

    /// Initializes a shared instance without taking a reference. Failures
    /// are logged and leave the record for a later resolution to retry.
    pub(super) fn eager_init(&self, record: &Arc<Record>) {
        if !record.descriptor().flags().contains(ComponentFlags::ORIGIN) || record.is_disabled() {
            return;
        }
        if let Ok(true) = self.initialize_origin(record, false) {
            self.announce_started(&Subject::origin(record), true);
        }
    }

    fn instantiate_clone(&self, record: Arc<Record>, notify: bool) -> Result<Instance, BrokerError> {
        let allocation_failed = |reason: String| BrokerError::AllocationFailed {
            type_name: record.descriptor().type_name().to_string(),
            reason,
        };

        let component = record
            .make_clone()
            .map_err(|e| allocation_failed(e.to_string()))?;
        let instance = Instance::new(component, InstanceId::next(), InstanceKind::Clone, Arc::clone(&record));
        let clone = Arc::new(CloneRecord {
            subject: instance.subject(),
            notify,
            task: Mutex::new(None),
            tearing_down: AtomicBool::new(false),
        });

        {
            let mut clones = self.clones.lock();
            if clones.len() >= self.config.max_clones() {
                return Err(allocation_failed(format!(
                    "{} live clones, limit reached",
                    clones.len()
                )));
            }
            clones.insert(instance.id(), Arc::clone(&clone));
        }

        if let Err(source) = instance.component().init(self) {
            self.clones.lock().remove(&instance.id());
            audit::log_component_init_failed(record.descriptor(), &source.to_string());
            return Err(BrokerError::InitFailed {
                type_name: record.descriptor().type_name().to_string(),
                source,
            });
        }
        audit::log_component_initialized(record.descriptor(), instance.id());

        // The owning extension may have been unloaded while `init` ran.
        if record.is_disabled() {
            self.teardown_clone(&clone, true);
            return Err(BrokerError::NotFound {
                request: record.descriptor().to_string(),
            });
        }

        if let Some(handle) = self.announce_started(&clone.subject, notify) {
            *clone.task.lock() = Some(handle);
        }
        Ok(instance)
    }

    /// Publishes `INIT`, starts the task of a schedulable instance and
    /// publishes `START` once it runs. Origin task handles are kept by the
    /// broker; a clone's handle is returned to the caller.
    fn announce_started(&self, subject: &Subject, notify: bool) -> Option<TaskHandle> {
        let notify = notify && subject.descriptor().notifications_enabled();
        self.announce(EventKind::Init, subject, notify);

        if !subject.descriptor().is_schedulable() {
            return None;
        }

        match self.tasks.start(subject) {
            Ok(handle) => {
                self.announce(EventKind::Start, subject, notify);
                match subject.kind() {
                    InstanceKind::Origin => {
                        self.origin_tasks.lock().insert(subject.id(), handle);
                        None
                    }
                    InstanceKind::Clone => Some(handle),
                }
            }
            Err(e) => {
                // The instance stays usable without its task thread.
                warn!(
                    event_type = events::TASK_START_FAILED,
                    instance = %subject.id(),
                    type_name = %subject.descriptor().type_name(),
                    error = %e,
                    "Failed to start task"
                );
                None
            }
        }
    }

    pub(super) fn announce(&self, kind: EventKind, subject: &Subject, notify: bool) {
        if notify {
            self.notifications.publish(self, kind, subject);
        }
    }

    pub(super) fn release_origin(&self, instance: Instance) {
        let record = Arc::clone(instance.record());
        drop(instance);

        if !self.owns(&record) {
            debug!(
                event_type = events::COMPONENT_RELEASE_UNMATCHED,
                type_name = %record.descriptor().type_name(),
                "Release of an instance this broker does not track"
            );
            return;
        }

        let last_release = {
            let mut state = record.state();
            if state.ref_count == 0 {
                debug!(
                    event_type = events::COMPONENT_RELEASE_UNMATCHED,
                    type_name = %record.descriptor().type_name(),
                    "Release of an instance with no outstanding references"
                );
                return;
            }
            state.ref_count -= 1;
            state.ref_count == 0 && state.initialized
        };

        if last_release && self.config.origin_teardown() == OriginTeardown::OnLastRelease {
            self.teardown_origin(&record, false);
        }
    }

    pub(super) fn release_clone(&self, instance: Instance) {
        let clone = self.clones.lock().get(&instance.id()).cloned();
        drop(instance);

        match clone {
            Some(clone) => {
                self.teardown_clone(&clone, false);
            }
            None => debug!(
                event_type = events::COMPONENT_RELEASE_UNMATCHED,
                "Release of an untracked clone"
            ),
        }
    }

    /// Tears a clone down: `STOP` and task stop when schedulable, `UNINIT`,
    /// subscriptions it handles dropped, then `uninit`. A clone whose
    /// `uninit` fails stays tracked unless `force` is set.
    pub(super) fn teardown_clone(&self, clone: &Arc<CloneRecord>, force: bool) -> bool {
        if clone.tearing_down.swap(true, Ordering::AcqRel) {
            return false;
        }

        let subject = &clone.subject;
        let descriptor = subject.descriptor();
        if descriptor.is_schedulable() {
            self.announce(EventKind::Stop, subject, clone.notify);
            let handle = clone.task.lock().take();
            if let Some(handle) = handle {
                self.tasks.stop(&handle);
            }
        }
        self.announce(EventKind::Uninit, subject, clone.notify);
        self.notifications.remove_handler(clone.id());

        match subject.component().uninit(self) {
            Ok(()) => {
                self.clones.lock().remove(&clone.id());
                audit::log_component_uninitialized(descriptor, clone.id());
                true
            }
            Err(e) => {
                audit::log_component_uninit_failed(descriptor, clone.id(), &e.to_string());
                if force {
                    self.clones.lock().remove(&clone.id());
                } else {
                    clone.tearing_down.store(false, Ordering::Release);
                }
                false
            }
        }
    }

    /// Tears the shared instance down if it is initialized. Without `force`
    /// it is left alone while references are outstanding.
    ///
    /// The teardown is claimed under the record's state lock before anything
    /// is announced. If a handler resolves the instance again meanwhile, it is
    /// initialized again after `uninit` and announced as started.
    pub(super) fn teardown_origin(&self, record: &Arc<Record>, force: bool) {
        {
            let mut state = record.state();
            if !state.initialized || state.teardown.is_some() {
                return;
            }
            if !force && state.ref_count > 0 {
                return;
            }
            state.teardown = Some(thread::current().id());
        }

        let subject = Subject::origin(record);
        let descriptor = record.descriptor();
        let notify = descriptor.notifications_enabled();
        if descriptor.is_schedulable() {
            self.announce(EventKind::Stop, &subject, notify);
            let handle = self.origin_tasks.lock().remove(&subject.id());
            if let Some(handle) = handle {
                self.tasks.stop(&handle);
            }
        }
        self.announce(EventKind::Uninit, &subject, notify);
        self.notifications.remove_handler(subject.id());

        let restarted = {
            let mut state = record.state();
            match subject.component().uninit(self) {
                Ok(()) => {
                    state.initialized = false;
                    audit::log_component_uninitialized(descriptor, subject.id());
                }
                Err(e) => {
                    audit::log_component_uninit_failed(descriptor, subject.id(), &e.to_string());
                    if force {
                        state.initialized = false;
                    }
                }
            }
            if force {
                state.ref_count = 0;
            }
            state.teardown = None;

            if state.ref_count == 0 {
                false
            } else if state.initialized {
                true
            } else {
                let reinitialized = self.run_init(record).is_ok();
                state.initialized = reinitialized;
                reinitialized
            }
        };
        record.notify_settled();

        if restarted {
            self.announce_started(&subject, true);
        }
    }

    /// Live clones created from `record`.
    pub(super) fn clones_of(&self, record: &Arc<Record>) -> Vec<Arc<CloneRecord>> {
        self.clones
            .lock()
            .values()
            .filter(|clone| Arc::ptr_eq(clone.subject.record(), record))
            .cloned()
            .collect()
    }
}
