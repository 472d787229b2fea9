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

//! Task threads for schedulable components.
//!
//! Once a `SCHEDULABLE` instance is initialized the broker asks a
//! [`TaskMaker`] to run its [`Component::run`](crate::Component::run) body.
//! Stopping is best effort: the maker asks the component to stop and waits a
//! bounded number of intervals for the body to return. When the budget runs
//! out the stop is reported as failed and the broker tears the instance down
//! anyway.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audit::events;
use crate::component::Subject;
use crate::error::TaskError;

/// Identifies a started task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    subject: Subject,
}

impl TaskHandle {
    pub fn new(id: u64, subject: Subject) -> Self {
        Self { id, subject }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }
}

/// Starts and stops task threads.
pub trait TaskMaker: Send + Sync {
    /// Runs `subject`'s task body on a task thread.
    fn start(&self, subject: &Subject) -> Result<TaskHandle, TaskError>;

    /// Stops a started task. Returns `false` if it did not confirm in time.
    fn stop(&self, handle: &TaskHandle) -> bool;

    fn is_running(&self, handle: &TaskHandle) -> bool;

    /// Releases task threads. Called once when the broker shuts down.
    fn shutdown(&self) {}
}

/// Default [`TaskMaker`] backed by the blocking pool of a tokio runtime.
///
/// The runtime is created on the first start and bounded to `threads`
/// concurrent task bodies.
pub struct RuntimeTaskMaker {
    runtime: Mutex<Option<Runtime>>,
    slots: Arc<Semaphore>,
    threads: usize,
    running: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    stop_retries: u32,
    stop_interval: Duration,
    closed: AtomicBool,
}

impl RuntimeTaskMaker {
    pub fn new(threads: usize, stop_retries: u32, stop_interval: Duration) -> Self {
        let threads = threads.max(1);
        Self {
            runtime: Mutex::new(None),
            slots: Arc::new(Semaphore::new(threads)),
            threads,
            running: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stop_retries,
            stop_interval,
            closed: AtomicBool::new(false),
        }
    }

    /// Grace period granted to a stopping task.
    pub fn grace_period(&self) -> Duration {
        self.stop_interval * self.stop_retries.max(1)
    }

    fn spawn(
        &self,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<JoinHandle<()>, TaskError> {
        let mut runtime = self.runtime.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskError::RuntimeUnavailable("task runtime is shut down".into()));
        }
        if runtime.is_none() {
            let built = Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(self.threads)
                .thread_name("corral-task")
                .enable_time()
                .build()
                .map_err(|e| TaskError::RuntimeUnavailable(e.to_string()))?;
            *runtime = Some(built);
        }
        match runtime.as_ref() {
            Some(runtime) => Ok(runtime.spawn_blocking(body)),
            None => Err(TaskError::RuntimeUnavailable("task runtime missing".into())),
        }
    }
}

impl TaskMaker for RuntimeTaskMaker {
    fn start(&self, subject: &Subject) -> Result<TaskHandle, TaskError> {
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| TaskError::Saturated {
                limit: self.threads,
            })?;

        let body_subject = subject.clone();
        let join = self.spawn(move || {
            let _permit = permit;
            body_subject.component().run();
        })?;

        let handle = TaskHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), subject.clone());
        self.running.lock().insert(handle.id(), join);

        debug!(
            event_type = events::TASK_STARTED,
            instance = %subject.id(),
            type_name = %subject.descriptor().type_name(),
            task = handle.id(),
            "Task started"
        );
        Ok(handle)
    }

    fn stop(&self, handle: &TaskHandle) -> bool {
        let component = handle.subject().component();
        for _ in 0..=self.stop_retries {
            let acknowledged = component.stop();
            let finished = self
                .running
                .lock()
                .get(&handle.id())
                .map_or(true, JoinHandle::is_finished);
            if acknowledged && finished {
                self.running.lock().remove(&handle.id());
                debug!(
                    event_type = events::TASK_STOPPED,
                    instance = %handle.subject().id(),
                    task = handle.id(),
                    "Task stopped"
                );
                return true;
            }
            std::thread::sleep(self.stop_interval);
        }

        // Dropping the join handle detaches the task; it keeps its slot until
        // the body returns.
        self.running.lock().remove(&handle.id());
        warn!(
            event_type = events::TASK_STOP_FAILED,
            instance = %handle.subject().id(),
            type_name = %handle.subject().descriptor().type_name(),
            task = handle.id(),
            retries = self.stop_retries,
            "Task did not stop within its retry budget"
        );
        false
    }

    fn is_running(&self, handle: &TaskHandle) -> bool {
        self.running
            .lock()
            .get(&handle.id())
            .is_some_and(|join| !join.is_finished())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.running.lock().clear();
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.grace_period());
            }
        }
    }
}

impl Drop for RuntimeTaskMaker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
