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


//! Task threads of schedulable components.

use corral::{
    Broker, BrokerConfig, ComponentFlags, EventKind, Request, Subject, Subscription, TaskError,
    TaskHandle, TaskMaker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

use crate::fixtures::{Lifecycle, Recorder, Worker};

fn wait_for_run(lifecycle: &Lifecycle) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while lifecycle.runs() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn watched(broker: &Broker) -> Recorder {
    let recorder = Recorder::new();
    broker
        .subscribe(Subscription::new().contract("worker"), recorder.handler())
        .unwrap();
    recorder
}

#[test]
fn test_schedulable_clone_runs_between_start_and_stop() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder()
        .register(Worker::registration(&lifecycle, false))
        .build();
    let recorder = watched(&broker);

    let instance = broker.resolve_contract("worker", ComponentFlags::CLONE).unwrap();
    let id = instance.id();
    wait_for_run(&lifecycle);
    broker.release(instance);

    assert_eq!(lifecycle.runs(), 1);
    assert_eq!(lifecycle.uninits(), 1);
    assert_eq!(
        recorder.kinds_for(id),
        vec![
            EventKind::Init,
            EventKind::Start,
            EventKind::Stop,
            EventKind::Uninit
        ]
    );
}

#[test]
#[traced_test]
fn test_unresponsive_task_does_not_block_teardown() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder()
        .config(
            BrokerConfig::builder()
                .task_stop_retries(2)
                .task_stop_interval(Duration::from_millis(1))
                .build(),
        )
        .register(Worker::registration(&lifecycle, true))
        .build();

    let instance = broker.resolve_contract("worker", ComponentFlags::CLONE).unwrap();
    wait_for_run(&lifecycle);
    broker.release(instance);

    assert!(logs_contain("task.stop_failed"));
    assert_eq!(lifecycle.uninits(), 1);
    assert_eq!(broker.live_clones(&Request::contract("worker")), 0);
}

/// Refuses every start.
#[derive(Default)]
struct FullTaskMaker {
    starts: Arc<AtomicUsize>,
}

impl TaskMaker for FullTaskMaker {
    fn start(&self, _subject: &Subject) -> Result<TaskHandle, TaskError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::Saturated { limit: 0 })
    }

    fn stop(&self, _handle: &TaskHandle) -> bool {
        true
    }

    fn is_running(&self, _handle: &TaskHandle) -> bool {
        false
    }
}

#[test]
fn test_failed_task_start_keeps_instance_usable() {
    let lifecycle = Lifecycle::new();
    let starts = Arc::new(AtomicUsize::new(0));
    let broker = Broker::builder()
        .task_maker(FullTaskMaker {
            starts: Arc::clone(&starts),
        })
        .register(Worker::registration(&lifecycle, false))
        .build();
    let recorder = watched(&broker);

    let instance = broker.resolve_contract("worker", ComponentFlags::CLONE).unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.kinds(), vec![EventKind::Init]);

    broker.release(instance);
    assert_eq!(lifecycle.runs(), 0);
    assert_eq!(
        recorder.kinds(),
        vec![EventKind::Init, EventKind::Stop, EventKind::Uninit]
    );
}

#[test]
fn test_schedulable_origin_stops_at_shutdown() {
    let lifecycle = Lifecycle::new();
    let broker = Broker::builder()
        .register(Worker::registration(&lifecycle, false))
        .build();
    let recorder = watched(&broker);

    let instance = broker
        .resolve_contract("worker", ComponentFlags::STRATEGIES)
        .unwrap();
    assert!(!instance.is_clone());
    wait_for_run(&lifecycle);
    broker.release(instance);
    assert_eq!(recorder.kinds(), vec![EventKind::Init, EventKind::Start]);

    broker.shutdown();
    assert_eq!(lifecycle.uninits(), 1);
    assert_eq!(
        recorder.kinds(),
        vec![
            EventKind::Init,
            EventKind::Start,
            EventKind::Stop,
            EventKind::Uninit
        ]
    );
}
