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

//! Binary interface between the broker and extension modules.
//!
//! An extension module is a `cdylib` that exports one
//! [`ExtensionDeclaration`] under [`DECLARATION_SYMBOL`], normally through
//! [`export_extension!`](crate::export_extension):
//!
//! ```rust,ignore
//! use corral::{export_extension, ExtensionRegistrar, Registration};
//!
//! fn register(registrar: &mut dyn ExtensionRegistrar) {
//!     registrar.register(Registration::origin(Storage::default()));
//! }
//!
//! export_extension!(register);
//! ```
//!
//! The registrar crosses the library boundary as a Rust trait object, so the
//! loader only accepts modules built against the same ABI version by the same
//! compiler.

use crate::broker::Broker;
use crate::error::ComponentError;
use crate::registration::Registration;

/// Bumped whenever [`ExtensionDeclaration`] or [`ExtensionRegistrar`] change.
pub const ABI_VERSION: u32 = 1;

/// Version of the corral crate the module was built against.
pub const CORRAL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compiler that built the corral crate.
pub const RUSTC_VERSION: &str = env!("CORRAL_RUSTC_VERSION");

/// Name of the exported declaration static.
pub const DECLARATION_SYMBOL: &str = "CORRAL_EXTENSION_DECLARATION";

/// Runs after the module's table has been merged into the broker.
pub type InitHook = Box<dyn Fn(&Broker) -> Result<(), ComponentError> + Send + Sync>;

/// Runs after the module's components have been drained, before it is unmapped.
pub type UnloadHook = Box<dyn Fn() -> Result<(), ComponentError> + Send + Sync>;

/// Collects what a module contributes.
pub trait ExtensionRegistrar {
    /// Appends a component to the module's table. Table order is resolution
    /// order within the module.
    fn register(&mut self, registration: Registration);

    fn on_init(&mut self, hook: InitHook);

    fn on_unload(&mut self, hook: UnloadHook);
}

/// The static a module exports.
#[derive(Copy, Clone)]
pub struct ExtensionDeclaration {
    pub abi_version: u32,
    pub corral_version: &'static str,
    pub rustc_version: &'static str,
    pub register: fn(&mut dyn ExtensionRegistrar),
}

impl ExtensionDeclaration {
    /// Returns a description of the mismatch if the module cannot be used by
    /// this build of the broker.
    pub fn incompatibility(&self) -> Option<(String, String)> {
        if self.abi_version != ABI_VERSION {
            return Some((
                format!("abi {}", ABI_VERSION),
                format!("abi {}", self.abi_version),
            ));
        }
        if self.rustc_version != RUSTC_VERSION {
            return Some((
                format!("rustc {}", RUSTC_VERSION),
                format!("rustc {}", self.rustc_version),
            ));
        }
        None
    }
}

/// Exports an [`ExtensionDeclaration`] calling `$register`.
#[macro_export]
macro_rules! export_extension {
    ($register:path) => {
        #[doc(hidden)]
        #[no_mangle]
        pub static CORRAL_EXTENSION_DECLARATION: $crate::ExtensionDeclaration =
            $crate::ExtensionDeclaration {
                abi_version: $crate::ABI_VERSION,
                corral_version: $crate::CORRAL_VERSION,
                rustc_version: $crate::RUSTC_VERSION,
                register: $register,
            };
    };
}
