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

use super::{Argument, FunctionMetaData, ObjectRequirement};
use crate::escalation::{Escalation, EscalationKind};
use crate::flow::{AsynchronousFlow, AsynchronousFlowState};
use crate::managed_object::{ManagedObject, ManagedObjectRef};
use crate::thread::ThreadState;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What function logic sees while it executes.
///
/// Flows requested here are started once the logic returns successfully:
/// spawned threads start, sequential flows run in request order before the
/// function's `next`, then the thread waits for every asynchronous flow
/// created here. An escalating function starts none of them.
pub struct ManagedFunctionContext<'a> {
    function: &'a FunctionMetaData,
    thread: &'a Arc<ThreadState>,
    argument: Option<Argument>,
    objects: &'a [(ObjectRequirement, Arc<dyn ManagedObject>)],
    sequential: Vec<(Arc<FunctionMetaData>, Option<Argument>)>,
    spawned: Vec<(Arc<FunctionMetaData>, Option<Argument>)>,
    asynchronous: Vec<Arc<AsynchronousFlowState>>,
}

/// Flows a function requested, handed back once its logic returns.
pub(crate) struct RequestedFlows {
    pub(crate) sequential: Vec<(Arc<FunctionMetaData>, Option<Argument>)>,
    pub(crate) spawned: Vec<(Arc<FunctionMetaData>, Option<Argument>)>,
    pub(crate) asynchronous: Vec<Arc<AsynchronousFlowState>>,
}

impl<'a> ManagedFunctionContext<'a> {
    pub(crate) fn new(
        function: &'a FunctionMetaData,
        thread: &'a Arc<ThreadState>,
        argument: Option<Argument>,
        objects: &'a [(ObjectRequirement, Arc<dyn ManagedObject>)],
    ) -> Self {
        Self {
            function,
            thread,
            argument,
            objects,
            sequential: Vec::new(),
            spawned: Vec::new(),
            asynchronous: Vec::new(),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    pub fn thread_state(&self) -> &Arc<ThreadState> {
        self.thread
    }

    /// Borrows the argument if it is a `T`
    pub fn argument<T: Any>(&self) -> Option<&T> {
        self.argument.as_ref().and_then(|argument| argument.downcast_ref::<T>())
    }

    /// Takes the argument if it is a `T`, leaving it in place otherwise
    pub fn take_argument<T: Any>(&mut self) -> Option<T> {
        let argument = self.argument.take()?;
        match argument.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(argument) => {
                self.argument = Some(argument);
                None
            }
        }
    }

    /// The required managed object behind `reference`.
    ///
    /// # Errors
    /// `InvalidAccess` if the function never declared the object or it holds another type
    pub fn object<T: Any>(&self, reference: &ManagedObjectRef<T>) -> Result<&T, Escalation> {
        let requirement = ObjectRequirement {
            scope: reference.scope(),
            index: reference.index(),
        };
        let object = self
            .objects
            .iter()
            .find(|(required, _)| *required == requirement)
            .map(|(_, object)| object)
            .ok_or_else(|| {
                Escalation::new(
                    EscalationKind::InvalidAccess,
                    format!("function {} did not require managed object {}", self.function.name, reference.name()),
                )
            })?;
        object.downcast_ref::<T>().ok_or_else(|| {
            Escalation::new(
                EscalationKind::InvalidAccess,
                format!("managed object {} is not a {}", reference.name(), std::any::type_name::<T>()),
            )
        })
    }

    /// Runs `function` on this thread after the current function returns.
    ///
    /// # Errors
    /// `InvalidAccess` if the office has no such function
    pub fn do_flow(&mut self, function: &str, argument: Option<Argument>) -> Result<(), Escalation> {
        let function = self.lookup(function)?;
        debug!(from = %self.function.name, to = %function.name, "sequential flow requested");
        self.sequential.push((function, argument));
        Ok(())
    }

    /// Starts `function` on a new thread of the same process once the
    /// current function returns successfully.
    ///
    /// # Errors
    /// `InvalidAccess` if the office has no such function
    pub fn spawn_flow(&mut self, function: &str, argument: Option<Argument>) -> Result<(), Escalation> {
        let function = self.lookup(function)?;
        debug!(from = %self.function.name, to = %function.name, "thread spawn requested");
        self.spawned.push((function, argument));
        Ok(())
    }

    /// Creates a flow the thread waits on once the function returns
    pub fn create_asynchronous_flow(&mut self) -> AsynchronousFlow {
        self.create_asynchronous_flow_with_timeout(self.function.asynchronous_timeout)
    }

    pub fn create_asynchronous_flow_with_timeout(&mut self, timeout: Duration) -> AsynchronousFlow {
        let state = AsynchronousFlowState::new(self.thread.process().asset_manager(), timeout);
        self.asynchronous.push(Arc::clone(&state));
        AsynchronousFlow::new(state)
    }

    fn lookup(&self, function: &str) -> Result<Arc<FunctionMetaData>, Escalation> {
        self.thread.process().office().function(function).cloned().ok_or_else(|| {
            Escalation::new(EscalationKind::InvalidAccess, format!("office has no function named {function}"))
        })
    }

    pub(crate) fn into_flows(self) -> RequestedFlows {
        RequestedFlows {
            sequential: self.sequential,
            spawned: self.spawned,
            asynchronous: self.asynchronous,
        }
    }
}

impl fmt::Debug for ManagedFunctionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFunctionContext")
            .field("function", &self.function.name)
            .field("thread", &self.thread.id())
            .field("objects", &self.objects.len())
            .field("sequential_flows", &self.sequential.len())
            .field("spawned_flows", &self.spawned.len())
            .field("asynchronous_flows", &self.asynchronous.len())
            .finish()
    }
}
