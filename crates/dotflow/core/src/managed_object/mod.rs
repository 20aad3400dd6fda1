// Dotflow
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Managed objects: resources sourced, administered and recycled by the kernel.
//!
//! Each object is declared with a [`ManagedObjectScope`]. A container per
//! scope instance (function invocation, thread or process) sources the object
//! on first use, runs its administration and governance hooks, and unloads it
//! when the scope ends.

mod administration;
mod container;
mod pool;
mod recycle;
mod source;

pub use administration::{Administration, Governance, GovernanceHooks};
pub use container::{ContainerState, ManagedObjectContainer};
pub(crate) use container::Readiness;
pub use pool::{BoundedManagedObjectPool, ManagedObjectPool};
pub use recycle::{RecycleContext, RecycleFunction};
pub use source::{ManagedObjectExecuteContext, ManagedObjectSource, ManagedObjectSourceContext, ManagedObjectUser};

use crate::team::TeamManagement;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// An object under kernel management.
pub trait ManagedObject: Send + Sync + 'static {
    /// The value functions work with
    fn object(&self) -> &(dyn Any + Send + Sync);

    /// Called once when the kernel lets go of the object
    fn unload(&self, _reason: UnloadReason) {}
}

impl dyn ManagedObject {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object().downcast_ref::<T>()
    }
}

/// Managed object wrapping a plain value.
#[derive(Debug)]
pub struct SimpleManagedObject<T> {
    value: T,
}

impl<T: Any + Send + Sync> ManagedObject for SimpleManagedObject<T> {
    fn object(&self) -> &(dyn Any + Send + Sync) {
        &self.value
    }
}

/// Wraps `value` as a managed object without unload behaviour
pub fn managed<T: Any + Send + Sync>(value: T) -> Arc<dyn ManagedObject> {
    Arc::new(SimpleManagedObject { value })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedObjectScope {
    /// One instance per function invocation
    Function,
    /// Shared by the functions of one thread
    Thread,
    /// Shared by every thread of one process
    Process,
}

/// Why an object was unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnloadReason {
    /// No recycle function was declared
    NoRecycleFunction,
    /// The recycle function completed without reusing the object
    NotReused,
    RecycleFailed,
    /// The owning scope failed; recycling was skipped
    Forced,
    /// The source supplied the object after sourcing had already failed
    LateArrival,
    AdministrationFailed,
}

/// How a source supplies its objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcingMode {
    /// The object is supplied before `source_managed_object` returns
    Synchronous,
    /// The object may be supplied later, failing after `timeout`
    Asynchronous { timeout: Duration },
}

/// Typed handle to a declared managed object.
pub struct ManagedObjectRef<T> {
    scope: ManagedObjectScope,
    index: usize,
    name: Arc<str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ManagedObjectRef<T> {
    pub(crate) fn new(scope: ManagedObjectScope, index: usize, name: &str) -> Self {
        Self {
            scope,
            index,
            name: Arc::from(name),
            _marker: PhantomData,
        }
    }

    pub fn scope(&self) -> ManagedObjectScope {
        self.scope
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for ManagedObjectRef<T> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope,
            index: self.index,
            name: Arc::clone(&self.name),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ManagedObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectRef")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("index", &self.index)
            .finish()
    }
}

/// Everything the kernel knows about one declared managed object.
pub struct ManagedObjectMetaData {
    pub(crate) name: String,
    pub(crate) scope: ManagedObjectScope,
    pub(crate) index: usize,
    pub(crate) source: Arc<dyn ManagedObjectSource>,
    pub(crate) sourcing: SourcingMode,
    pub(crate) pool: Option<Arc<dyn ManagedObjectPool>>,
    pub(crate) recycle: Option<Arc<dyn RecycleFunction>>,
    pub(crate) recycle_team: Option<TeamManagement>,
    pub(crate) pre_administration: Vec<Arc<dyn Administration>>,
    pub(crate) post_administration: Vec<Arc<dyn Administration>>,
    pub(crate) governance: Vec<Arc<dyn Governance>>,
}

impl ManagedObjectMetaData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> ManagedObjectScope {
        self.scope
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sourcing(&self) -> SourcingMode {
        self.sourcing
    }

    pub fn source(&self) -> &Arc<dyn ManagedObjectSource> {
        &self.source
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn has_recycle_function(&self) -> bool {
        self.recycle.is_some()
    }
}

impl fmt::Debug for ManagedObjectMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectMetaData")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("index", &self.index)
            .field("sourcing", &self.sourcing)
            .field("pooled", &self.pool.is_some())
            .field("recycle", &self.recycle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_value_downcasts() {
        let object = managed(String::from("connection"));
        assert_eq!(object.downcast_ref::<String>().map(String::as_str), Some("connection"));
        assert!(object.downcast_ref::<u32>().is_none());
    }

    #[test]
    fn test_reference_is_typed_handle() {
        let reference: ManagedObjectRef<String> = ManagedObjectRef::new(ManagedObjectScope::Thread, 2, "db");
        let copy = reference.clone();
        assert_eq!(copy.name(), "db");
        assert_eq!(copy.index(), 2);
        assert_eq!(copy.scope(), ManagedObjectScope::Thread);
    }
}
