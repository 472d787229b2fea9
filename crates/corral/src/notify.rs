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

//! Lifecycle notifications.
//!
//! Observers subscribe with any combination of an instance, a contract name
//! and a type name. A published event reaches a subscription when any of its
//! selectors matches the subject.
//!
//! Publishing takes a snapshot of the matching subscriptions and releases the
//! lock before calling handlers, so a handler may subscribe, unsubscribe,
//! resolve or release without deadlocking. A subscription removed while a
//! publish is in flight is skipped. One added during the pass is not
//! guaranteed to see it.

use parking_lot::Mutex;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audit;
use crate::broker::Broker;
use crate::component::{Instance, InstanceId, Subject};

/// Lifecycle transition being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init,
    Start,
    Stop,
    Uninit,
    /// The subject's extension is being unloaded; release it.
    Remove,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Init => "INIT",
            EventKind::Start => "START",
            EventKind::Stop => "STOP",
            EventKind::Uninit => "UNINIT",
            EventKind::Remove => "REMOVE",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// An event delivered to handlers.
#[derive(Debug, Clone)]
pub struct Notification {
    kind: EventKind,
    subject: Subject,
}

impl Notification {
    pub(crate) fn new(kind: EventKind, subject: Subject) -> Self {
        Self { kind, subject }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }
}

/// Selectors of a subscription.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    instance: Option<InstanceId>,
    contract: Option<String>,
    type_name: Option<String>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events about `instance`.
    pub fn instance(mut self, instance: &Instance) -> Self {
        self.instance = Some(instance.id());
        self
    }

    /// Events about any instance of `contract`.
    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    /// Events about any instance whose type name is `type_name`.
    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.instance.is_none() && self.contract.is_none() && self.type_name.is_none()
    }

    /// Whether any selector names `subject`.
    pub fn matches(&self, subject: &Subject) -> bool {
        let descriptor = subject.descriptor();
        self.instance == Some(subject.id())
            || self.contract.as_deref() == Some(descriptor.contract())
            || self.type_name.as_deref() == Some(descriptor.type_name())
    }
}

type Callback = Arc<dyn Fn(&Broker, &Notification) + Send + Sync>;

/// Receiver of matching notifications.
#[derive(Clone)]
pub enum Handler {
    /// A component instance; events go to [`Component::on_notify`].
    Instance(Subject),
    /// A plain callback.
    Callback(Callback),
}

impl Handler {
    /// Routes events to `instance`. The subscription is dropped when the
    /// instance is torn down.
    pub fn instance(instance: &Instance) -> Self {
        Handler::Instance(instance.subject())
    }

    pub fn callback<F>(callback: F) -> Self
    where
        F: Fn(&Broker, &Notification) + Send + Sync + 'static,
    {
        Handler::Callback(Arc::new(callback))
    }

    fn instance_id(&self) -> Option<InstanceId> {
        match self {
            Handler::Instance(subject) => Some(subject.id()),
            Handler::Callback(_) => None,
        }
    }

    fn call(&self, broker: &Broker, notification: &Notification) {
        match self {
            Handler::Instance(subject) => subject.component().on_notify(broker, notification),
            Handler::Callback(callback) => callback(broker, notification),
        }
    }
}

impl Debug for Handler {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Handler::Instance(subject) => write!(f, "Handler::Instance({})", subject.id()),
            Handler::Callback(_) => f.write_str("Handler::Callback"),
        }
    }
}

/// Identifies a subscription for [`Broker::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Entry {
    handle: SubscriptionHandle,
    subscription: Subscription,
    handler: Handler,
    active: AtomicBool,
}

/// Subscription list and fan-out.
#[derive(Default)]
pub(crate) struct NotificationBroker {
    entries: Mutex<Vec<Arc<Entry>>>,
    next_handle: AtomicU64,
}

impl NotificationBroker {
    pub fn subscribe(&self, subscription: Subscription, handler: Handler) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Arc::new(Entry {
            handle,
            subscription,
            handler,
            active: AtomicBool::new(true),
        }));
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|entry| entry.handle == handle) {
            Some(index) => {
                entries.remove(index).active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Drops every subscription handled by `instance`. Returns how many.
    pub fn remove_handler(&self, instance: InstanceId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| {
            let keep = entry.handler.instance_id() != Some(instance);
            if !keep {
                entry.active.store(false, Ordering::Release);
            }
            keep
        });
        before - entries.len()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.drain(..) {
            entry.active.store(false, Ordering::Release);
        }
    }

    /// Delivers `kind` about `subject` to every matching subscription on the
    /// calling thread.
    pub fn publish(&self, broker: &Broker, kind: EventKind, subject: &Subject) {
        let snapshot: Vec<Arc<Entry>> = self
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.subscription.matches(subject))
            .cloned()
            .collect();

        if snapshot.is_empty() {
            return;
        }

        let notification = Notification::new(kind, subject.clone());
        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                entry.handler.call(broker, &notification)
            }));
            if delivered.is_err() {
                audit::log_handler_panicked(
                    kind.as_str(),
                    subject.id(),
                    &format!("{:?}", entry.handler),
                );
            }
        }
    }
}
