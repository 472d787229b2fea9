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


//! Shared and per-request instances, reference counting and teardown.

use corral::{
    Broker, BrokerConfig, BrokerError, Component, ComponentError, ComponentFlags, Descriptor,
    EventKind, Handler, Instance, Notification, OriginTeardown, Registration, Request,
    StateFlags, Subscription,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::fixtures::{clonable, origin, Lifecycle, Recorder};

fn releasing_broker(registration: Registration) -> Broker {
    Broker::builder()
        .config(
            BrokerConfig::builder()
                .origin_teardown(OriginTeardown::OnLastRelease)
                .build(),
        )
        .register(registration)
        .build()
}

#[test]
fn test_origin_resolves_to_same_instance() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder().register(origin("X", &lifecycle)).build();

    let first = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    let second = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(broker.reference_count(&second), 2);
    assert_eq!(lifecycle.inits(), 1);

    broker.release(first);
    assert_eq!(broker.reference_count(&second), 1);
    broker.release(second);
}

#[test]
fn test_last_release_tears_origin_down() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = releasing_broker(origin("X", &lifecycle));
    broker
        .subscribe(Subscription::new().contract("X"), recorder.handler())
        .unwrap();

    let instance = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    assert_eq!(broker.reference_count(&instance), 1);

    let probe = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    broker.release(instance);
    assert_eq!(broker.reference_count(&probe), 1);
    broker.release(probe);

    let info = &broker.registrations()[0];
    assert_eq!(info.reference_count, 0);
    assert!(!info.state.contains(StateFlags::INITIALIZED));
    assert_eq!(lifecycle.uninits(), 1);
    assert_eq!(recorder.kinds(), vec![EventKind::Init, EventKind::Uninit]);

    // A later resolution initializes it again.
    let again = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    assert_eq!(lifecycle.inits(), 2);
    broker.release(again);
}

#[test]
fn test_resolution_during_teardown_reinitializes() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = releasing_broker(origin("X", &lifecycle));
    broker
        .subscribe(Subscription::new().contract("X"), recorder.handler())
        .unwrap();

    let held: Arc<parking_lot::Mutex<Option<Instance>>> = Arc::new(parking_lot::Mutex::new(None));
    let once = Arc::new(AtomicBool::new(false));
    let handler = {
        let held = Arc::clone(&held);
        let once = Arc::clone(&once);
        Handler::callback(move |broker: &Broker, event: &Notification| {
            if event.kind() == EventKind::Uninit && !once.swap(true, Ordering::SeqCst) {
                let again = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
                *held.lock() = Some(again);
            }
        })
    };
    broker
        .subscribe(Subscription::new().contract("X"), handler)
        .unwrap();

    let instance = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    broker.release(instance);

    assert_eq!(
        recorder.kinds(),
        vec![EventKind::Init, EventKind::Uninit, EventKind::Init]
    );
    assert_eq!(lifecycle.uninits(), 1);
    assert_eq!(lifecycle.inits(), 2);
    let info = &broker.registrations()[0];
    assert!(info.state.contains(StateFlags::INITIALIZED));
    assert_eq!(info.reference_count, 1);

    let again = held.lock().take().unwrap();
    broker.release(again);
    assert_eq!(lifecycle.uninits(), 2);
    assert!(!broker.registrations()[0]
        .state
        .contains(StateFlags::INITIALIZED));
    assert_eq!(
        recorder.kinds(),
        vec![
            EventKind::Init,
            EventKind::Uninit,
            EventKind::Init,
            EventKind::Uninit
        ]
    );
}

#[test]
fn test_release_on_other_broker_is_ignored() {
    let lifecycle = Lifecycle::new();
    let first = releasing_broker(origin("X", &lifecycle));
    let second = releasing_broker(origin("X", &lifecycle));

    let kept = first.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    let foreign = first.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    second.release(foreign);

    assert_eq!(first.reference_count(&kept), 2);
    assert_eq!(second.registrations()[0].reference_count, 0);
    assert_eq!(lifecycle.uninits(), 0);
    first.release(kept);
}

#[test]
fn test_origin_kept_until_shutdown_by_default() {
    let lifecycle = Lifecycle::new();
    let recorder = Recorder::new();
    let broker = Broker::builder().register(origin("X", &lifecycle)).build();
    broker
        .subscribe(Subscription::new().contract("X"), recorder.handler())
        .unwrap();

    let instance = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    broker.release(instance);

    assert_eq!(lifecycle.uninits(), 0);
    assert!(broker.registrations()[0]
        .state
        .contains(StateFlags::INITIALIZED));

    broker.shutdown();
    assert_eq!(lifecycle.uninits(), 1);
    assert_eq!(recorder.kinds(), vec![EventKind::Init, EventKind::Uninit]);
}

#[test]
fn test_clones_are_independent() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();
    let request = Request::contract("Y");

    let first = broker.resolve(&request, ComponentFlags::CLONE).unwrap();
    let second = broker.resolve(&request, ComponentFlags::CLONE).unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(lifecycle.inits(), 2);
    assert_eq!(broker.live_clones(&request), 2);

    broker.release(first);
    assert_eq!(lifecycle.uninits(), 1);
    assert_eq!(broker.live_clones(&request), 1);
    assert_eq!(broker.reference_count(&second), 1);

    broker.release(second);
    assert_eq!(broker.live_clones(&request), 0);
    assert_eq!(lifecycle.uninits(), 2);
    assert_eq!(broker.registrations()[0].live_clones, 0);
}

#[test]
fn test_failed_origin_init_can_be_retried() {
    let lifecycle = Lifecycle::new();
    lifecycle.fail_init.store(true, Ordering::SeqCst);
    let broker = Broker::builder().register(origin("X", &lifecycle)).build();

    match broker.resolve_contract("X", ComponentFlags::ORIGIN) {
        Err(BrokerError::InitFailed { type_name, .. }) => assert_eq!(type_name, "Service"),
        other => panic!("expected InitFailed, got {:?}", other),
    }
    let info = &broker.registrations()[0];
    assert!(!info.state.contains(StateFlags::INITIALIZED));
    assert_eq!(info.reference_count, 0);

    lifecycle.fail_init.store(false, Ordering::SeqCst);
    let instance = broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap();
    assert_eq!(lifecycle.inits(), 1);
    broker.release(instance);
}

#[test]
fn test_failed_clone_init_leaves_nothing_tracked() {
    let lifecycle = Lifecycle::new();
    lifecycle.fail_init.store(true, Ordering::SeqCst);
    let recorder = Recorder::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();
    broker
        .subscribe(Subscription::new().contract("Y"), recorder.handler())
        .unwrap();

    assert!(matches!(
        broker.resolve_contract("Y", ComponentFlags::CLONE),
        Err(BrokerError::InitFailed { .. })
    ));
    assert_eq!(broker.live_clones(&Request::contract("Y")), 0);
    assert!(recorder.events().is_empty());
}

#[test]
fn test_clone_limit_fails_allocation() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder()
        .config(BrokerConfig::builder().max_clones(2).build())
        .without_default_extension_loader()
        .register(clonable("Y", &lifecycle))
        .build();

    let first = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    let second = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    assert!(matches!(
        broker.resolve_contract("Y", ComponentFlags::CLONE),
        Err(BrokerError::AllocationFailed { .. })
    ));
    assert_eq!(lifecycle.inits(), 2);

    broker.release(first);
    let third = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    broker.release(second);
    broker.release(third);
}

#[test]
fn test_failed_uninit_keeps_clone_tracked() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder().register(clonable("Y", &lifecycle)).build();

    let instance = broker.resolve_contract("Y", ComponentFlags::CLONE).unwrap();
    lifecycle.fail_uninit.store(true, Ordering::SeqCst);
    broker.release(instance);
    assert_eq!(broker.live_clones(&Request::contract("Y")), 1);

    broker.shutdown();
    assert_eq!(broker.live_clones(&Request::contract("Y")), 0);
}

#[test]
fn test_concurrent_first_resolutions_initialize_once() {
    let lifecycle = Lifecycle::new();
    let broker = Arc::new(Broker::builder().register(origin("X", &lifecycle)).build());

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.resolve_contract("X", ComponentFlags::ORIGIN).unwrap())
        })
        .collect();
    let instances: Vec<_> = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .collect();

    assert_eq!(lifecycle.inits(), 1);
    assert_eq!(broker.reference_count(&instances[0]), 8);
    for instance in instances {
        broker.release(instance);
    }
    assert_eq!(broker.registrations()[0].reference_count, 0);
}

/// Resolves the "X" contract in `init` and releases it in `uninit`.
#[derive(Default)]
struct Dependent {
    dependency: parking_lot::Mutex<Option<Instance>>,
}

impl Component for Dependent {
    fn descriptor(&self) -> Descriptor {
        Descriptor::of::<Dependent>("dependent")
    }

    fn init(&self, broker: &Broker) -> Result<(), ComponentError> {
        let dependency = broker
            .resolve_contract("X", ComponentFlags::ORIGIN)
            .map_err(|e| ComponentError::dependency("X", e))?;
        *self.dependency.lock() = Some(dependency);
        Ok(())
    }

    fn uninit(&self, broker: &Broker) -> Result<(), ComponentError> {
        if let Some(dependency) = self.dependency.lock().take() {
            broker.release(dependency);
        }
        Ok(())
    }
}

#[test]
fn test_components_resolve_dependencies_through_broker() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder()
        .register(Registration::origin(Dependent::default()))
        .register(origin("X", &lifecycle))
        .build();

    let dependent = broker
        .resolve_contract("dependent", ComponentFlags::ORIGIN)
        .unwrap();
    assert_eq!(lifecycle.inits(), 1);
    let dependency_refs = broker.registrations()[1].reference_count;
    assert_eq!(dependency_refs, 1);

    broker.release(dependent);
    broker.shutdown();
    assert_eq!(lifecycle.uninits(), 1);
}

#[test]
fn test_missing_dependency_rejects_init() {
    let broker = Broker::builder()
        .register(Registration::origin(Dependent::default()))
        .build();

    match broker.resolve_contract("dependent", ComponentFlags::ORIGIN) {
        Err(BrokerError::InitFailed { source, .. }) => {
            assert!(matches!(source, ComponentError::Dependency { .. }));
        }
        other => panic!("expected InitFailed, got {:?}", other),
    }
}
