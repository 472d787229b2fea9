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

//! Demonstration extension module.
//!
//! Build with `cargo build -p corral-demo-extension` and load the resulting
//! shared library with `Broker::load`. It contributes:
//!
//! - `demo.greeter`: a shared `Greeter` answering `greet(name)`.
//! - `demo.counter`: a clonable `Counter`, one per request.

use corral::{
    export_extension, Broker, Component, ComponentError, ComponentFlags, Descriptor,
    ExtensionRegistrar, Registration,
};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static GREETING: Lazy<String> =
    Lazy::new(|| std::env::var("CORRAL_DEMO_GREETING").unwrap_or_else(|_| "Hello".to_string()));

#[derive(Default)]
pub struct Greeter {
    ready: AtomicBool,
}

impl Greeter {
    pub fn greet(&self, name: &str) -> Option<String> {
        self.ready
            .load(Ordering::Acquire)
            .then(|| format!("{}, {}!", GREETING.as_str(), name))
    }
}

impl Component for Greeter {
    fn descriptor(&self) -> Descriptor {
        Descriptor::of::<Greeter>("demo.greeter")
    }

    fn init(&self, _broker: &Broker) -> Result<(), ComponentError> {
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn uninit(&self, _broker: &Broker) -> Result<(), ComponentError> {
        self.ready.store(false, Ordering::Release);
        Ok(())
    }
}

#[derive(Default)]
pub struct Counter {
    value: AtomicUsize,
}

impl Counter {
    pub fn increment(&self) -> usize {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Component for Counter {
    fn descriptor(&self) -> Descriptor {
        Descriptor::of::<Counter>("demo.counter").with_flags(ComponentFlags::CLONE)
    }
}

fn register(registrar: &mut dyn ExtensionRegistrar) {
    registrar.register(Registration::origin(Greeter::default()));
    registrar.register(Registration::clonable(Counter::default(), || {
        Ok(Counter::default())
    }));
    registrar.on_init(Box::new(|_broker| {
        tracing::info!(greeting = %GREETING.as_str(), "Demo extension initialized");
        Ok(())
    }));
    registrar.on_unload(Box::new(|| {
        tracing::info!("Demo extension unloaded");
        Ok(())
    }));
}

export_extension!(register);
