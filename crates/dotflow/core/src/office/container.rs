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

//! Execution of one function invocation.
//!
//! ```text
//! EscalationScope(ManagedFunctionContainer) -> NextFunctionState
//!                       |
//!                       +-> sequential flows -> AwaitFlowsState -> unload function objects
//! ```

use super::context::RequestedFlows;
use super::{Argument, FunctionMetaData, ManagedFunctionContext, ObjectRequirement};
use crate::escalation::{Escalation, EscalationKind, EscalationScope};
use crate::flow::{AsynchronousFlowState, FlowPoll};
use crate::function::{BoxedFunctionState, FunctionOutcome, FunctionState, FunctionStateContext, Suspension, Unwind};
use crate::managed_object::{ManagedObject, ManagedObjectContainer, ManagedObjectScope, Readiness};
use crate::promise::Promise;
use crate::team::TeamManagement;
use crate::telemetry;
use crate::thread::ThreadState;
use metrics::counter;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

/// Argument for the next function, present once the function returned normally
type NextSlot = Arc<Mutex<Option<Option<Argument>>>>;

pub(crate) struct ManagedFunctionContainer {
    function: Arc<FunctionMetaData>,
    thread: Arc<ThreadState>,
    argument: Option<Argument>,
    loaded: Vec<(ObjectRequirement, Arc<dyn ManagedObject>)>,
    function_objects: Vec<(usize, Arc<ManagedObjectContainer>)>,
    next: NextSlot,
}

impl ManagedFunctionContainer {
    /// Chain invoking `function` on `thread`, followed by its `next` function.
    ///
    /// The function's escalation procedure covers the function and the flows
    /// it starts, never its `next`.
    pub(crate) fn create(function: &Arc<FunctionMetaData>, thread: &Arc<ThreadState>, argument: Option<Argument>) -> BoxedFunctionState {
        let next: NextSlot = Arc::new(Mutex::new(None));
        let body: BoxedFunctionState = Box::new(Self {
            function: Arc::clone(function),
            thread: Arc::clone(thread),
            argument,
            loaded: Vec::with_capacity(function.required_objects.len()),
            function_objects: Vec::new(),
            next: Arc::clone(&next),
        });
        let body = EscalationScope::wrap(Arc::clone(&function.escalation), body);
        if function.next.is_none() {
            return body;
        }
        Promise::join(
            body,
            Box::new(NextFunctionState {
                name: format!("{}:next", function.name),
                function: Arc::clone(function),
                thread: Arc::clone(thread),
                slot: next,
            }),
        )
    }

    fn container_for(&mut self, requirement: ObjectRequirement) -> Option<Arc<ManagedObjectContainer>> {
        match requirement.scope {
            ManagedObjectScope::Thread => self.thread.thread_object(requirement.index),
            ManagedObjectScope::Process => self.thread.process().process_object(requirement.index),
            ManagedObjectScope::Function => {
                if let Some((_, container)) = self.function_objects.iter().find(|(index, _)| *index == requirement.index) {
                    return Some(Arc::clone(container));
                }
                let office = Arc::clone(self.thread.process().office());
                let meta = office.managed_objects(ManagedObjectScope::Function).get(requirement.index)?;
                let container = ManagedObjectContainer::new(Arc::clone(meta));
                self.function_objects.push((requirement.index, Arc::clone(&container)));
                Some(container)
            }
        }
    }

    fn unload_function_objects(thread: &Arc<ThreadState>, function_objects: Vec<(usize, Arc<ManagedObjectContainer>)>) -> Option<BoxedFunctionState> {
        let containers = function_objects.into_iter().map(|(_, container)| container).collect();
        ManagedObjectContainer::unload_all(containers, thread, ManagedObjectScope::Function)
    }

    fn escalate(self, escalation: Escalation) -> Unwind {
        let unload = Self::unload_function_objects(&self.thread, self.function_objects);
        Unwind::new(escalation).then_pending(unload)
    }
}

impl FunctionState for ManagedFunctionContainer {
    fn name(&self) -> &str {
        &self.function.name
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn responsible_team(&self) -> Option<&TeamManagement> {
        Some(&self.function.team)
    }

    fn execute(mut self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        // Objects are loaded in declaration order; a pending one parks the
        // whole invocation, which resumes here on the function's team.
        while self.loaded.len() < self.function.required_objects.len() {
            let requirement = self.function.required_objects[self.loaded.len()];
            let Some(container) = self.container_for(requirement) else {
                let message = format!("function {} requires an undeclared managed object", self.function.name);
                return Err(self.escalate(Escalation::new(EscalationKind::InvalidAccess, message)));
            };
            match container.check_ready(&self.thread) {
                Readiness::Ready(object) => self.loaded.push((requirement, object)),
                Readiness::Pending(latch) => {
                    debug!(function = %self.function.name, object = container.name(), "waiting on managed object");
                    return Ok(FunctionOutcome::Await(Suspension::new(latch, self)));
                }
                Readiness::Failed(escalation) => return Err(self.escalate(escalation)),
            }
        }

        let ManagedFunctionContainer {
            function,
            thread,
            argument,
            loaded,
            function_objects,
            next,
        } = *self;

        counter!(telemetry::FUNCTIONS_EXECUTED, 1);
        let mut context = ManagedFunctionContext::new(&function, &thread, argument, &loaded);
        let result = panic::catch_unwind(AssertUnwindSafe(|| function.logic.execute(&mut context))).unwrap_or_else(|payload| Err(Escalation::panic(payload)));
        let RequestedFlows {
            sequential,
            spawned,
            asynchronous,
        } = context.into_flows();
        drop(loaded);

        let unload = Self::unload_function_objects(&thread, function_objects);
        match result {
            Ok(argument) => {
                *next.lock() = Some(argument);
                for (flow, argument) in spawned {
                    let spawned_thread = thread.process().spawn_thread(&flow, argument);
                    debug!(from = %function.name, to = %flow.name, thread = spawned_thread.id(), "thread spawned by flow");
                }
                let flows = sequential
                    .into_iter()
                    .map(|(flow, argument)| Some(ManagedFunctionContainer::create(&flow, &thread, argument)));
                let await_flows = (!asynchronous.is_empty()).then(|| {
                    Box::new(AwaitFlowsState {
                        name: format!("{}:await", function.name),
                        thread: Arc::clone(&thread),
                        team: function.team.clone(),
                        flows: asynchronous,
                    }) as BoxedFunctionState
                });
                let continuation = Promise::all(flows.chain([await_flows, unload]));
                Ok(FunctionOutcome::from_chain(continuation))
            }
            Err(escalation) => {
                for flow in &asynchronous {
                    flow.abandon();
                }
                if !spawned.is_empty() {
                    debug!(function = %function.name, dropped = spawned.len(), "escalated before spawning threads");
                }
                debug!(function = %function.name, kind = %escalation.kind(), "function escalated");
                Err(Unwind::new(escalation).then_pending(unload))
            }
        }
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Self::unload_function_objects(&self.thread, self.function_objects)
    }
}

/// Waits for the asynchronous flows of one invocation, running their
/// completion callbacks on the function's team.
struct AwaitFlowsState {
    name: String,
    thread: Arc<ThreadState>,
    team: TeamManagement,
    flows: Vec<Arc<AsynchronousFlowState>>,
}

impl AwaitFlowsState {
    fn abandon_all(&self) {
        for flow in &self.flows {
            flow.abandon();
        }
    }
}

impl FunctionState for AwaitFlowsState {
    fn name(&self) -> &str {
        &self.name
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn responsible_team(&self) -> Option<&TeamManagement> {
        Some(&self.team)
    }

    fn execute(mut self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        while let Some(flow) = self.flows.first().cloned() {
            match flow.poll() {
                FlowPoll::Pending(latch) => {
                    debug!(thread = self.thread.id(), flow = %self.name, "waiting on asynchronous flow");
                    return Ok(FunctionOutcome::Await(Suspension::new(latch, self)));
                }
                FlowPoll::Completed(completion) => {
                    self.flows.remove(0);
                    if let Some(completion) = completion {
                        let result = panic::catch_unwind(AssertUnwindSafe(completion)).unwrap_or_else(|payload| Err(Escalation::panic(payload)));
                        if let Err(escalation) = result {
                            self.abandon_all();
                            return Err(Unwind::new(escalation));
                        }
                    }
                }
                FlowPoll::Failed(escalation) => {
                    self.flows.remove(0);
                    self.abandon_all();
                    return Err(Unwind::new(escalation));
                }
            }
        }
        Ok(FunctionOutcome::Complete)
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        self.abandon_all();
        None
    }
}

/// Starts the declared `next` function with the value the function returned.
struct NextFunctionState {
    name: String,
    function: Arc<FunctionMetaData>,
    thread: Arc<ThreadState>,
    slot: NextSlot,
}

impl FunctionState for NextFunctionState {
    fn name(&self) -> &str {
        &self.name
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        // An escalation handled by the function's procedure replaces the next function
        let Some(argument) = self.slot.lock().take() else {
            return Ok(FunctionOutcome::Complete);
        };
        let Some(next) = self.function.next.as_deref() else {
            return Ok(FunctionOutcome::Complete);
        };
        let office = Arc::clone(self.thread.process().office());
        match office.function(next) {
            Some(next) => Ok(FunctionOutcome::Next(ManagedFunctionContainer::create(next, &self.thread, argument))),
            None => Err(Unwind::new(Escalation::new(
                EscalationKind::InvalidAccess,
                format!("next function {next} of {} is not in the office", self.function.name),
            ))),
        }
    }
}
