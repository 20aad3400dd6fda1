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

//! The office: the function graph a kernel executes.
//!
//! Everything here is fixed once [`KernelBuilder::build`] returns. Functions
//! name their team, the managed objects they require (by typed reference,
//! resolved to an index per scope), the function that follows them and their
//! escalation handlers.

mod builder;
mod container;
mod context;

pub use builder::{FunctionBuilder, KernelBuilder, ManagedObjectBuilder};
pub use context::ManagedFunctionContext;
pub(crate) use container::ManagedFunctionContainer;

use crate::escalation::{Escalation, EscalationFlowHandler, EscalationProcedure};
use crate::function::BoxedFunctionState;
use crate::managed_object::{ManagedObjectMetaData, ManagedObjectScope};
use crate::team::TeamManagement;
use crate::thread::ThreadState;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Value passed between functions.
pub type Argument = Box<dyn Any + Send>;

/// Result of function logic: the argument for the next function, or an escalation.
pub type FunctionResult = Result<Option<Argument>, Escalation>;

/// Logic of a function.
pub trait ManagedFunction: Send + Sync + 'static {
    fn execute(&self, context: &mut ManagedFunctionContext<'_>) -> FunctionResult;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut ManagedFunctionContext<'_>) -> FunctionResult + Send + Sync + 'static,
{
    fn execute(&self, context: &mut ManagedFunctionContext<'_>) -> FunctionResult {
        self(context)
    }
}

/// A managed object a function requires, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRequirement {
    pub scope: ManagedObjectScope,
    pub index: usize,
}

pub struct FunctionMetaData {
    pub(crate) name: String,
    pub(crate) team: TeamManagement,
    pub(crate) logic: Arc<dyn ManagedFunction>,
    pub(crate) required_objects: Vec<ObjectRequirement>,
    pub(crate) next: Option<String>,
    pub(crate) escalation: Arc<EscalationProcedure>,
    pub(crate) asynchronous_timeout: Duration,
}

impl FunctionMetaData {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Team responsible for executing the function
    pub fn team(&self) -> &TeamManagement {
        &self.team
    }

    pub fn required_objects(&self) -> &[ObjectRequirement] {
        &self.required_objects
    }

    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn escalation_procedure(&self) -> &Arc<EscalationProcedure> {
        &self.escalation
    }

    pub fn asynchronous_timeout(&self) -> Duration {
        self.asynchronous_timeout
    }
}

impl fmt::Debug for FunctionMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionMetaData")
            .field("name", &self.name)
            .field("team", self.team.id())
            .field("required_objects", &self.required_objects)
            .field("next", &self.next)
            .finish()
    }
}

/// The complete, immutable function graph of one kernel.
#[derive(Default)]
pub struct OfficeMetaData {
    functions: HashMap<String, Arc<FunctionMetaData>>,
    function_objects: Vec<Arc<ManagedObjectMetaData>>,
    thread_objects: Vec<Arc<ManagedObjectMetaData>>,
    process_objects: Vec<Arc<ManagedObjectMetaData>>,
    escalation: Arc<EscalationProcedure>,
}

impl OfficeMetaData {
    pub(crate) fn new(
        functions: HashMap<String, Arc<FunctionMetaData>>,
        objects: Vec<Arc<ManagedObjectMetaData>>,
        escalation: EscalationProcedure,
    ) -> Self {
        let mut office = Self {
            functions,
            escalation: Arc::new(escalation),
            ..Self::default()
        };
        for object in objects {
            match object.scope {
                ManagedObjectScope::Function => office.function_objects.push(object),
                ManagedObjectScope::Thread => office.thread_objects.push(object),
                ManagedObjectScope::Process => office.process_objects.push(object),
            }
        }
        office
    }

    /// Office without functions or objects
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn function(&self, name: &str) -> Option<&Arc<FunctionMetaData>> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Objects of `scope`, positioned by their index
    pub fn managed_objects(&self, scope: ManagedObjectScope) -> &[Arc<ManagedObjectMetaData>] {
        match scope {
            ManagedObjectScope::Function => &self.function_objects,
            ManagedObjectScope::Thread => &self.thread_objects,
            ManagedObjectScope::Process => &self.process_objects,
        }
    }

    pub(crate) fn all_managed_objects(&self) -> impl Iterator<Item = &Arc<ManagedObjectMetaData>> {
        self.function_objects.iter().chain(&self.thread_objects).chain(&self.process_objects)
    }

    /// Procedure consulted once every region of a thread has declined an escalation
    pub fn escalation_procedure(&self) -> &Arc<EscalationProcedure> {
        &self.escalation
    }
}

impl fmt::Debug for OfficeMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeMetaData")
            .field("functions", &self.function_names())
            .field("function_objects", &self.function_objects.len())
            .field("thread_objects", &self.thread_objects.len())
            .field("process_objects", &self.process_objects.len())
            .finish()
    }
}

/// Handles an escalation by invoking a function with the escalation as its argument.
#[derive(Debug, Clone)]
pub struct FunctionEscalationHandler {
    function: String,
}

impl FunctionEscalationHandler {
    pub fn new(function: impl Into<String>) -> Self {
        Self { function: function.into() }
    }

    pub fn function(&self) -> &str {
        &self.function
    }
}

impl EscalationFlowHandler for FunctionEscalationHandler {
    fn create_handler(&self, thread: &Arc<ThreadState>, escalation: Escalation) -> Option<BoxedFunctionState> {
        let office = Arc::clone(thread.process().office());
        match office.function(&self.function) {
            Some(function) => Some(ManagedFunctionContainer::create(function, thread, Some(Box::new(escalation)))),
            None => {
                error!(function = %self.function, error = %escalation, "escalation handler function is not in the office");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_office() {
        let office = OfficeMetaData::empty();
        assert!(office.function("anything").is_none());
        assert!(office.managed_objects(ManagedObjectScope::Thread).is_empty());
        assert!(office.escalation_procedure().is_empty());
        assert!(office.function_names().is_empty());
    }
}
