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


//! Lifecycle notification delivery.

use corral::{
    Broker, BrokerError, Component, ComponentFlags, Descriptor, EventKind, Handler, Instance,
    Notification, Registration, Request, Subscription, SubscriptionHandle,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::fixtures::{clonable, clonable_with, origin, Lifecycle, Recorder, Service};

#[test]
fn test_clone_lifecycle_is_announced() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();
    broker
        .subscribe(Subscription::new().contract("Y"), recorder.handler())
        .unwrap();

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    let id = instance.id();
    broker.release(instance);

    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Init);
    assert_eq!(events[1].kind, EventKind::Uninit);
    assert!(events.iter().all(|event| event.instance == id));
    assert!(events.iter().all(|event| event.contract == "Y"));
}

#[test]
fn test_subscriptions_only_see_their_selectors() {
    let lifecycle = Lifecycle::new();
    let by_type = Recorder::new();
    let by_instance = Recorder::new();
    let broker = Broker::builder()
        .register(Registration::origin(
            Service::new("X", ComponentFlags::ORIGIN, &lifecycle).named("Primary"),
        ))
        .register(clonable("Y", &lifecycle))
        .build();
    broker
        .subscribe(Subscription::new().type_name("Primary"), by_type.handler())
        .unwrap();

    let shared = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    broker
        .subscribe(Subscription::new().instance(&shared), by_instance.handler())
        .unwrap();
    let clone = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    broker.release(clone);
    broker.release(shared);
    broker.shutdown();

    assert_eq!(by_type.kinds(), vec![EventKind::Init, EventKind::Uninit]);
    assert_eq!(by_instance.kinds(), vec![EventKind::Uninit]);
}

#[test]
fn test_empty_subscription_is_rejected() {
    let broker = Broker::builder().build();
    let result = broker.subscribe(Subscription::new(), Recorder::new().handler());
    assert!(matches!(result, Err(BrokerError::InvalidSubscription)));
    assert_eq!(broker.subscription_count(), 0);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();
    let handle = broker
        .subscribe(Subscription::new().contract("Y"), recorder.handler())
        .unwrap();

    assert!(broker.unsubscribe(handle));
    assert!(!broker.unsubscribe(handle));

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    broker.release(instance);
    assert!(recorder.events().is_empty());
}

#[test]
fn test_disabled_notifications_are_silent() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = Broker::builder()
        .register(clonable_with(
            "quiet",
            ComponentFlags::CLONE | ComponentFlags::DISABLE_NOTIFY,
            &lifecycle,
        ))
        .build();
    broker
        .subscribe(Subscription::new().contract("quiet"), recorder.handler())
        .unwrap();

    let instance = broker.resolve_contract("quiet", ComponentFlags::CLONE).unwrap();
    broker.release(instance);

    assert_eq!(lifecycle.inits(), 1);
    assert_eq!(lifecycle.uninits(), 1);
    assert!(recorder.events().is_empty());
}

#[test]
fn test_request_can_silence_one_clone() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();
    broker
        .subscribe(Subscription::new().contract("Y"), recorder.handler())
        .unwrap();

    let silent = broker
        .resolve_contract("Y", ComponentFlags::CLONE | ComponentFlags::DISABLE_NOTIFY)
        .unwrap();
    let loud = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    let silent_id = silent.id();
    let loud_id = loud.id();
    broker.release(silent);
    broker.release(loud);

    assert!(recorder.kinds_for(silent_id).is_empty());
    assert_eq!(
        recorder.kinds_for(loud_id),
        vec![EventKind::Init, EventKind::Uninit]
    );
}

#[test]
fn test_panicking_handler_does_not_stop_fan_out() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();
    broker
        .subscribe(
            Subscription::new().contract("Y"),
            Handler::callback(|_broker: &Broker, _event: &Notification| {
                panic!("handler failure");
            }),
        )
        .unwrap();
    broker
        .subscribe(Subscription::new().contract("Y"), recorder.handler())
        .unwrap();

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    broker.release(instance);

    assert_eq!(recorder.kinds(), vec![EventKind::Init, EventKind::Uninit]);
}

#[test]
fn test_handler_may_unsubscribe_itself() {
    let lifecycle = Lifecycle::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let own_handle: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();

    let handler = {
        let calls = Arc::clone(&calls);
        let own_handle = Arc::clone(&own_handle);
        Handler::callback(move |broker: &Broker, _event: &Notification| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = own_handle.lock().take() {
                broker.unsubscribe(handle);
            }
        })
    };
    let handle = broker
        .subscribe(Subscription::new().contract("Y"), handler)
        .unwrap();
    *own_handle.lock() = Some(handle);

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    broker.release(instance);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.subscription_count(), 0);
}

#[test]
fn test_subscription_removed_during_publish_is_skipped() {
    let lifecycle = Lifecycle::new();
    let removed = Recorder::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();

    let target: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let remover = {
        let target = Arc::clone(&target);
        Handler::callback(move |broker: &Broker, event: &Notification| {
            if event.kind() == EventKind::Init {
                if let Some(handle) = target.lock().take() {
                    assert!(broker.unsubscribe(handle));
                }
            }
        })
    };
    broker
        .subscribe(Subscription::new().contract("Y"), remover)
        .unwrap();
    let handle = broker
        .subscribe(Subscription::new().contract("Y"), removed.handler())
        .unwrap();
    *target.lock() = Some(handle);

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    assert!(removed.events().is_empty());
    assert_eq!(broker.subscription_count(), 1);

    broker.release(instance);
    assert!(removed.events().is_empty());
}

#[test]
fn test_subscription_added_during_publish_sees_later_events() {
    let lifecycle = Lifecycle::new();
    let late = Recorder::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();

    let subscribed = Arc::new(AtomicUsize::new(0));
    let handler = {
        let late = late.clone();
        let subscribed = Arc::clone(&subscribed);
        Handler::callback(move |broker: &Broker, _event: &Notification| {
            if subscribed.fetch_add(1, Ordering::SeqCst) == 0 {
                broker
                    .subscribe(Subscription::new().contract("Y"), late.handler())
                    .unwrap();
            }
        })
    };
    broker
        .subscribe(Subscription::new().contract("Y"), handler)
        .unwrap();

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    assert!(late.events().is_empty());
    broker.release(instance);

    assert_eq!(late.kinds(), vec![EventKind::Uninit]);
}

#[test]
fn test_handler_may_resolve_and_release() {
    let lifecycle = Lifecycle::new();
    let dependency = Lifecycle::new();
    let broker = Broker::builder()
        .register(clonable("Y", &lifecycle))
        .register(origin("X", &dependency))
        .build();
    broker
        .subscribe(
            Subscription::new().contract("Y"),
            Handler::callback(|broker: &Broker, event: &Notification| {
                if event.kind() == EventKind::Init {
                    let instance = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
                    broker.release(instance);
                }
            }),
        )
        .unwrap();

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    broker.release(instance);

    assert_eq!(dependency.inits(), 1);
    assert_eq!(broker.registrations()[1].reference_count, 0);
}

/// Counts notifications routed to it as a handler instance.
struct Watcher {
    seen: Arc<Mutex<Vec<EventKind>>>,
}

impl Watcher {
    fn registration(seen: &Arc<Mutex<Vec<EventKind>>>) -> Registration {
        let shared = Arc::clone(seen);
        Registration::clonable(
            Watcher {
                seen: Arc::clone(seen),
            },
            move || {
                Ok(Watcher {
                    seen: Arc::clone(&shared),
                })
            },
        )
    }
}

impl Component for Watcher {
    fn descriptor(&self) -> Descriptor {
        Descriptor::of::<Watcher>("watcher").with_flags(ComponentFlags::CLONE)
    }

    fn on_notify(&self, _broker: &Broker, event: &Notification) {
        self.seen.lock().push(event.kind());
    }
}

#[test]
fn test_instance_handler_is_dropped_with_its_instance() {
    let lifecycle = Lifecycle::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = Broker::builder()
        .register(Watcher::registration(&seen))
        .register(clonable("Y", &lifecycle))
        .build();

    let watcher: Instance = broker
        .resolve(&Request::contract("watcher"), ComponentFlags::CLONE)
        .unwrap();
    broker
        .subscribe(Subscription::new().contract("Y"), Handler::instance(&watcher))
        .unwrap();
    assert_eq!(broker.subscription_count(), 1);

    let first = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    assert_eq!(*seen.lock(), vec![EventKind::Init]);

    broker.release(watcher);
    assert_eq!(broker.subscription_count(), 0);

    broker.release(first);
    assert_eq!(*seen.lock(), vec![EventKind::Init]);
}
