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

//! Contract descriptors and resolution requests.
//!
//! Every component describes itself with a [`Descriptor`]: the contract it
//! implements, its concrete type name, a version and a set of
//! [`ComponentFlags`]. Callers find components by building a [`Request`] that
//! names some of those fields.
//!
//! ## Matching
//!
//! Only the fields named by a request participate. By default every named
//! field must compare equal; [`Request::any`] switches to "at least one named
//! field compares equal". Names compare as exact strings, versions compare
//! with exact equality.
//!
//! ```rust
//! use corral::{Descriptor, Request};
//! use semver::Version;
//!
//! let descriptor = Descriptor::new("storage", "FileStore").with_version(Version::new(2, 1, 0));
//!
//! assert!(Request::contract("storage").matches(&descriptor));
//! assert!(!Request::contract("storage").and_version(Version::new(2, 0, 0)).matches(&descriptor));
//! assert!(Request::contract("cache").or_type("FileStore").matches(&descriptor));
//! ```

use semver::Version;
use std::fmt::{Display, Formatter, Result as FmtResult};

bitflags::bitflags! {
    /// Capabilities a component advertises in its descriptor.
    ///
    /// `ORIGIN` and `CLONE` are also used as the caller's accepted strategy set
    /// when resolving.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ComponentFlags: u32 {
        /// Resolves to the single shared instance.
        const ORIGIN = 1 << 0;
        /// Resolves to a freshly constructed instance per request.
        const CLONE = 1 << 1;
        /// Runs on a task thread once initialized.
        const SCHEDULABLE = 1 << 2;
        /// Suppresses lifecycle notifications for the instance.
        const DISABLE_NOTIFY = 1 << 3;
    }
}

impl ComponentFlags {
    /// The instantiation strategies.
    pub const STRATEGIES: ComponentFlags = ComponentFlags::ORIGIN.union(ComponentFlags::CLONE);

    /// Returns only the strategy bits of this set.
    pub fn strategies(self) -> ComponentFlags {
        self & Self::STRATEGIES
    }
}

bitflags::bitflags! {
    /// Which request fields participate in matching, and how they combine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u32 {
        const CONTRACT = 1 << 0;
        const TYPE_NAME = 1 << 1;
        const VERSION = 1 << 2;
        /// Combine named fields with OR instead of AND.
        const ANY = 1 << 8;
    }
}

/// Static self-description of a component.
///
/// Descriptors are captured once, when a component is registered, and never
/// change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    contract: String,
    type_name: String,
    version: Version,
    instance_size: usize,
    flags: ComponentFlags,
}

impl Descriptor {
    /// Creates a descriptor for an `ORIGIN` component at version 1.0.0.
    pub fn new(contract: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            type_name: type_name.into(),
            version: Version::new(1, 0, 0),
            instance_size: 0,
            flags: ComponentFlags::ORIGIN,
        }
    }

    /// Creates a descriptor for `T`, taking the type name and instance size from
    /// the type itself.
    pub fn of<T>(contract: impl Into<String>) -> Self {
        Self::new(contract, short_type_name::<T>()).with_instance_size(std::mem::size_of::<T>())
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_flags(mut self, flags: ComponentFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_instance_size(mut self, instance_size: usize) -> Self {
        self.instance_size = instance_size;
        self
    }

    /// The contract name this component implements.
    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// The concrete type name of the implementation.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn instance_size(&self) -> usize {
        self.instance_size
    }

    pub fn flags(&self) -> ComponentFlags {
        self.flags
    }

    pub fn is_schedulable(&self) -> bool {
        self.flags.contains(ComponentFlags::SCHEDULABLE)
    }

    pub fn notifications_enabled(&self) -> bool {
        !self.flags.contains(ComponentFlags::DISABLE_NOTIFY)
    }
}

impl Display for Descriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}::{}@{}", self.contract, self.type_name, self.version)
    }
}

/// A resolution request.
///
/// Build one from a single field with [`Request::contract`],
/// [`Request::type_name`] or [`Request::version`], then narrow it with the
/// `and_*` methods or widen it with the `or_*` methods. Mixing the two is not
/// meaningful: any `or_*` call switches the whole request to OR semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    flags: RequestFlags,
    contract: Option<String>,
    type_name: Option<String>,
    version: Option<Version>,
}

impl Request {
    /// Requests components implementing `contract`.
    pub fn contract(contract: impl Into<String>) -> Self {
        Self::default().and_contract(contract)
    }

    /// Requests components whose concrete type is `type_name`.
    pub fn type_name(type_name: impl Into<String>) -> Self {
        Self::default().and_type(type_name)
    }

    /// Requests components at exactly `version`.
    pub fn version(version: Version) -> Self {
        Self::default().and_version(version)
    }

    /// A request matching exactly the given descriptor's names and version.
    pub fn exact(descriptor: &Descriptor) -> Self {
        Self::contract(descriptor.contract())
            .and_type(descriptor.type_name())
            .and_version(descriptor.version().clone())
    }

    pub fn and_contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self.flags |= RequestFlags::CONTRACT;
        self
    }

    pub fn and_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self.flags |= RequestFlags::TYPE_NAME;
        self
    }

    pub fn and_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self.flags |= RequestFlags::VERSION;
        self
    }

    pub fn or_contract(self, contract: impl Into<String>) -> Self {
        self.and_contract(contract).any()
    }

    pub fn or_type(self, type_name: impl Into<String>) -> Self {
        self.and_type(type_name).any()
    }

    pub fn or_version(self, version: Version) -> Self {
        self.and_version(version).any()
    }

    /// Switches to OR semantics: one matching named field is enough.
    pub fn any(mut self) -> Self {
        self.flags |= RequestFlags::ANY;
        self
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn contract_name(&self) -> Option<&str> {
        self.contract.as_deref()
    }

    pub fn type_name_value(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn version_value(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Whether `descriptor` satisfies this request.
    ///
    /// An AND request that names no field matches every descriptor; an OR
    /// request that names no field matches none.
    pub fn matches(&self, descriptor: &Descriptor) -> bool {
        let mut checks = Vec::with_capacity(3);

        if self.flags.contains(RequestFlags::CONTRACT) {
            checks.push(self.contract.as_deref() == Some(descriptor.contract()));
        }
        if self.flags.contains(RequestFlags::TYPE_NAME) {
            checks.push(self.type_name.as_deref() == Some(descriptor.type_name()));
        }
        if self.flags.contains(RequestFlags::VERSION) {
            checks.push(self.version.as_ref() == Some(descriptor.version()));
        }

        if self.flags.contains(RequestFlags::ANY) {
            checks.into_iter().any(|hit| hit)
        } else {
            checks.into_iter().all(|hit| hit)
        }
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let mut parts = Vec::new();
        if let Some(contract) = &self.contract {
            parts.push(format!("contract == {}", contract));
        }
        if let Some(type_name) = &self.type_name {
            parts.push(format!("type == {}", type_name));
        }
        if let Some(version) = &self.version {
            parts.push(format!("version == {}", version));
        }
        if parts.is_empty() {
            return write!(f, "<any>");
        }
        let joiner = if self.flags.contains(RequestFlags::ANY) {
            " || "
        } else {
            " && "
        };
        write!(f, "{}", parts.join(joiner))
    }
}

/// The last path segment of `T`'s type name, without generic arguments.
pub(crate) fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
