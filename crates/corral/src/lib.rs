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

//! # Corral
//!
//! Corral is a component broker. Independently compiled code publishes
//! implementations of named contracts; callers resolve a contract to a live
//! instance without knowing its concrete type, and the broker manages each
//! instance's initialization, reference count and teardown.
//!
//! ## Concepts
//!
//! - A [`Component`] describes itself with a [`Descriptor`]: contract name,
//!   type name, version and [`ComponentFlags`].
//! - `ORIGIN` components resolve to one shared instance, initialized on first
//!   use. `CLONE` components resolve to a fresh instance per request, built by
//!   the factory given in [`Registration::clonable`].
//! - `SCHEDULABLE` components get a task thread running [`Component::run`]
//!   once initialized.
//! - Extension modules add components at runtime through [`Broker::load`]
//!   and remove them with [`Broker::unload`].
//! - Observers [`subscribe`](Broker::subscribe) to lifecycle events
//!   (`INIT`, `START`, `STOP`, `UNINIT`, `REMOVE`).
//!
//! ## Example
//!
//! ```rust
//! use corral::{Broker, Component, ComponentError, ComponentFlags, Descriptor, Registration};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct Session {
//!     requests: AtomicUsize,
//! }
//!
//! impl Component for Session {
//!     fn descriptor(&self) -> Descriptor {
//!         Descriptor::of::<Session>("session").with_flags(ComponentFlags::CLONE)
//!     }
//!
//!     fn init(&self, _broker: &Broker) -> Result<(), ComponentError> {
//!         self.requests.store(0, Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//!
//! let broker = Broker::builder()
//!     .register(Registration::clonable(Session::default(), || Ok(Session::default())))
//!     .build();
//!
//! let first = broker.resolve_contract("session", ComponentFlags::CLONE).unwrap();
//! let second = broker.resolve_contract("session", ComponentFlags::CLONE).unwrap();
//! assert_ne!(first.id(), second.id());
//!
//! broker.release(first);
//! broker.release(second);
//! ```

pub mod audit;
pub mod broker;
pub mod component;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod extension;
pub mod notify;
pub mod registration;
pub mod task;

pub use audit::events;
pub use broker::{Broker, BrokerBuilder, RegistrationInfo};
pub use component::{AsAny, Component, Instance, InstanceId, InstanceKind, Subject};
pub use config::{BrokerConfig, BrokerConfigBuilder, ConfigLoader, ExtensionSpec, OriginTeardown};
pub use descriptor::{ComponentFlags, Descriptor, Request, RequestFlags};
pub use error::{BrokerError, ComponentError, ConfigError, ExtensionError, TaskError};
pub use extension::abi::{
    ExtensionDeclaration, ExtensionRegistrar, ABI_VERSION, CORRAL_VERSION, RUSTC_VERSION,
};
pub use extension::{Extension, ExtensionInfo, ExtensionTable, ModuleExtension, EXTENSION_CONTRACT};
pub use notify::{EventKind, Handler, Notification, Subscription, SubscriptionHandle};
pub use registration::{LinkedComponent, Registration, StateFlags};
pub use task::{RuntimeTaskMaker, TaskHandle, TaskMaker};

#[doc(hidden)]
pub use inventory;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a fmt subscriber filtered by `RUST_LOG`, or by `default_filter`
/// when `RUST_LOG` is unset. Does nothing if a global subscriber exists.
pub fn setup_logging(default_filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or("info")));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
