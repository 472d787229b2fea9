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

//! Structured log events emitted by the broker.
//!
//! Every lifecycle transition is logged with an `event_type` field taken from
//! [`events`], so transitions can be filtered independently of the message
//! text.

use crate::component::InstanceId;
use crate::descriptor::Descriptor;

/// Event type constants for broker log records.
pub mod events {
    /// A component completed initialization.
    pub const COMPONENT_INIT: &str = "component.init";
    /// A component rejected initialization.
    pub const COMPONENT_INIT_FAILED: &str = "component.init_failed";
    /// A component was torn down.
    pub const COMPONENT_UNINIT: &str = "component.uninit";
    /// A component's uninit entry point failed.
    pub const COMPONENT_UNINIT_FAILED: &str = "component.uninit_failed";
    /// A release did not match any tracked instance.
    pub const COMPONENT_RELEASE_UNMATCHED: &str = "component.release_unmatched";

    /// A task thread was started for a schedulable instance.
    pub const TASK_STARTED: &str = "task.started";
    /// A task thread could not be started.
    pub const TASK_START_FAILED: &str = "task.start_failed";
    /// A task thread stopped.
    pub const TASK_STOPPED: &str = "task.stopped";
    /// A task thread did not stop within its retry budget.
    pub const TASK_STOP_FAILED: &str = "task.stop_failed";

    /// An extension module was loaded.
    pub const EXTENSION_LOADED: &str = "extension.loaded";
    /// An extension module failed to load and was rolled back.
    pub const EXTENSION_LOAD_FAILED: &str = "extension.load_failed";
    /// An extension module was unloaded.
    pub const EXTENSION_UNLOADED: &str = "extension.unloaded";
    /// An extension was unloaded while instances were still held.
    pub const EXTENSION_DRAIN_FORCED: &str = "extension.drain_forced";

    /// A notification handler panicked.
    pub const HANDLER_PANICKED: &str = "notify.handler_panicked";

    /// The broker was shut down.
    pub const BROKER_SHUTDOWN: &str = "broker.shutdown";
}

/// Log a successful initialization.
pub fn log_component_initialized(descriptor: &Descriptor, instance: InstanceId) {
    tracing::debug!(
        event_type = events::COMPONENT_INIT,
        contract = %descriptor.contract(),
        type_name = %descriptor.type_name(),
        instance = %instance,
        "Component initialized"
    );
}

/// Log a rejected initialization.
pub fn log_component_init_failed(descriptor: &Descriptor, error: &str) {
    tracing::warn!(
        event_type = events::COMPONENT_INIT_FAILED,
        contract = %descriptor.contract(),
        type_name = %descriptor.type_name(),
        error = %error,
        "Component rejected initialization"
    );
}

/// Log a completed teardown.
pub fn log_component_uninitialized(descriptor: &Descriptor, instance: InstanceId) {
    tracing::debug!(
        event_type = events::COMPONENT_UNINIT,
        contract = %descriptor.contract(),
        type_name = %descriptor.type_name(),
        instance = %instance,
        "Component uninitialized"
    );
}

/// Log a failed uninit entry point.
pub fn log_component_uninit_failed(descriptor: &Descriptor, instance: InstanceId, error: &str) {
    tracing::error!(
        event_type = events::COMPONENT_UNINIT_FAILED,
        contract = %descriptor.contract(),
        type_name = %descriptor.type_name(),
        instance = %instance,
        error = %error,
        "Component failed to uninitialize"
    );
}

/// Log an extension that finished loading.
pub fn log_extension_loaded(alias: &str, path: &str, components: usize) {
    tracing::info!(
        event_type = events::EXTENSION_LOADED,
        alias = %alias,
        path = %path,
        components = components,
        "Extension loaded"
    );
}

/// Log an extension load that was rolled back.
pub fn log_extension_load_failed(alias: &str, path: &str, error: &str) {
    tracing::error!(
        event_type = events::EXTENSION_LOAD_FAILED,
        alias = %alias,
        path = %path,
        error = %error,
        "Extension failed to load"
    );
}

/// Log an extension that was unloaded.
pub fn log_extension_unloaded(alias: &str, path: &str) {
    tracing::info!(
        event_type = events::EXTENSION_UNLOADED,
        alias = %alias,
        path = %path,
        "Extension unloaded"
    );
}

/// Log instances of an extension that were still held when it was drained.
pub fn log_extension_drain_forced(alias: &str, type_name: &str, outstanding: usize) {
    tracing::warn!(
        event_type = events::EXTENSION_DRAIN_FORCED,
        alias = %alias,
        type_name = %type_name,
        outstanding = outstanding,
        "Extension unloaded with outstanding references"
    );
}

/// Log a notification handler that panicked.
pub fn log_handler_panicked(kind: &str, subject: InstanceId, handler: &str) {
    tracing::error!(
        event_type = events::HANDLER_PANICKED,
        kind = %kind,
        subject = %subject,
        handler = %handler,
        "Notification handler panicked"
    );
}
