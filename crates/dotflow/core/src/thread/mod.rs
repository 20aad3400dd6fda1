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

//! Thread state and the function loop.
//!
//! A thread is one logical flow of execution within a process. Its chain may
//! hop between teams and park on assets, but only ever runs on one worker at
//! a time. Every thread chain ends with a completion state that unloads the
//! thread's objects and reports to the process.

mod process;

pub use process::{ProcessCompletion, ProcessOutcome, ProcessState};

use crate::escalation::{Escalation, EscalationProcedure};
use crate::function::{BoxedFunctionState, ClosureFunctionState, FunctionOutcome, FunctionState, FunctionStateContext, Unwind};
use crate::managed_object::{ManagedObjectContainer, ManagedObjectScope};
use crate::promise::Promise;
use crate::team::{Job, TeamId};
use crate::telemetry;
use metrics::counter;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, warn};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub struct ThreadState {
    id: u64,
    process: Arc<ProcessState>,
    escalation_stack: Mutex<Vec<Arc<EscalationProcedure>>>,
    thread_objects: Mutex<Vec<Option<Arc<ManagedObjectContainer>>>>,
    active_function: Mutex<Option<String>>,
    failed: AtomicBool,
    handling_office_escalation: AtomicBool,
    complete: AtomicBool,
}

impl ThreadState {
    pub(crate) fn new(process: Arc<ProcessState>) -> Arc<Self> {
        process.thread_started();
        let thread_objects = vec![None; process.office().managed_objects(ManagedObjectScope::Thread).len()];
        Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            process,
            escalation_stack: Mutex::new(Vec::new()),
            thread_objects: Mutex::new(thread_objects),
            active_function: Mutex::new(None),
            failed: AtomicBool::new(false),
            handling_office_escalation: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    /// Whether an escalation on this thread reached the process level handler
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Name of the state most recently executed on this thread
    pub fn active_function(&self) -> Option<String> {
        self.active_function.lock().clone()
    }

    fn set_active_function(&self, name: &str) {
        let mut active = self.active_function.lock();
        if active.as_deref() != Some(name) {
            *active = Some(name.to_string());
        }
    }

    /// Number of escalation regions currently executing
    pub fn escalation_depth(&self) -> usize {
        self.escalation_stack.lock().len()
    }

    pub(crate) fn push_escalation_procedure(&self, procedure: Arc<EscalationProcedure>) {
        self.escalation_stack.lock().push(procedure);
    }

    pub(crate) fn pop_escalation_procedure(&self) {
        self.escalation_stack.lock().pop();
    }

    /// Thread scoped object `index`, created on first use
    pub(crate) fn thread_object(&self, index: usize) -> Option<Arc<ManagedObjectContainer>> {
        let mut objects = self.thread_objects.lock();
        let slot = objects.get_mut(index)?;
        if slot.is_none() {
            let meta = self.process.office().managed_objects(ManagedObjectScope::Thread).get(index)?;
            *slot = Some(ManagedObjectContainer::new(Arc::clone(meta)));
        }
        slot.clone()
    }

    /// Final state of every thread chain
    pub(crate) fn completion_state(self: &Arc<Self>) -> BoxedFunctionState {
        Box::new(ThreadCompletionState { thread: Arc::clone(self) })
    }

    /// Resolves an escalation that unwound out of the whole chain.
    ///
    /// # Workflow
    /// 1. The office procedure gets one chance, unless its handler is the one escalating
    /// 2. Otherwise the thread is marked failed and the process level handler runs
    /// 3. Either way the pending remainder is cancelled and its cleanup runs after the handler
    pub(crate) fn handle_escalation(self: &Arc<Self>, unwind: Unwind) -> Option<BoxedFunctionState> {
        let (escalation, pending) = unwind.into_parts();

        if !self.handling_office_escalation.swap(true, Ordering::AcqRel) {
            let office = Arc::clone(self.process.office());
            if let Some(flow) = office.escalation_procedure().find(&escalation) {
                counter!(telemetry::ESCALATIONS_HANDLED, 1);
                debug!(thread = self.id, kind = %escalation.kind(), handler = flow.handler_name(), "escalation handled by office");
                let handler = flow.handler().create_handler(self, escalation);
                let thread = Arc::clone(self);
                let reset = ClosureFunctionState::new("office-escalation-complete", self, move |_| {
                    thread.handling_office_escalation.store(false, Ordering::Release);
                    Ok(None)
                })
                .boxed();
                let cleanup = pending.and_then(|pending| pending.cancel());
                return Promise::all([handler, Some(reset), cleanup]);
            }
            self.handling_office_escalation.store(false, Ordering::Release);
        }

        self.failed.store(true, Ordering::Release);
        self.process.record_failure(escalation.clone());
        counter!(telemetry::ESCALATIONS_UNHANDLED, 1);
        error!(
            process = %self.process.id(),
            thread = self.id,
            kind = %escalation.kind(),
            message = escalation.message(),
            "escalation reached process level"
        );

        let handler: BoxedFunctionState = Box::new(ProcessEscalationState {
            thread: Arc::clone(self),
            escalation,
        });
        let cleanup = pending.and_then(|pending| pending.cancel());
        if cleanup.is_none() {
            warn!(thread = self.id, "escalation left no remaining chain to clean up");
        }
        Promise::then(Some(handler), cleanup)
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", &self.process.id())
            .field("failed", &self.is_failed())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Runs a chain on the calling worker.
///
/// The loop ends when the chain completes, parks on an asset, or reaches a
/// state owned by a team other than `current_team`, which then receives the
/// remainder as a job.
pub(crate) fn run_function_loop(head: BoxedFunctionState, current_team: Option<TeamId>) {
    let mut context = FunctionStateContext::new(current_team);
    let mut head = head;
    loop {
        if let Some(team) = head.responsible_team() {
            if context.current_team() != Some(team.id()) {
                let team = team.clone();
                debug!(function = head.name(), team = %team.id(), "handing continuation to team");
                team.assign(Job::new(head));
                return;
            }
        }

        let Some(next) = execute_step(head, &mut context) else {
            return;
        };
        head = next;
    }
}

/// Runs a chain to completion on the calling thread, ignoring team ownership
fn run_inline(head: BoxedFunctionState) {
    let mut context = FunctionStateContext::new(None);
    let mut head = head;
    while let Some(next) = execute_step(head, &mut context) {
        head = next;
    }
}

fn execute_step(head: BoxedFunctionState, context: &mut FunctionStateContext) -> Option<BoxedFunctionState> {
    let thread = Arc::clone(head.thread_state());
    thread.set_active_function(head.name());
    context.record_execution();

    match head.execute(context) {
        Ok(FunctionOutcome::Next(next)) => Some(next),
        Ok(FunctionOutcome::Complete) => None,
        Ok(FunctionOutcome::Await(suspension)) => {
            let (latch, chain) = suspension.into_parts();
            latch.park(chain)
        }
        Err(unwind) => thread.handle_escalation(unwind),
    }
}

/// Hands a chain woken from an asset latch to the team that owns its head
pub(crate) fn activate(chain: BoxedFunctionState) {
    let team = match chain.responsible_team() {
        Some(team) => team.clone(),
        None => chain.thread_state().process().default_team().clone(),
    };
    team.assign(Job::new(chain));
}

/// Unwinds a chain that no team will run, executing the cleanup inline
pub(crate) fn abandon_chain(chain: BoxedFunctionState, escalation: Escalation) {
    let thread = Arc::clone(chain.thread_state());
    let unwind = Unwind::new(escalation).then_pending(Some(chain));
    if let Some(cleanup) = thread.handle_escalation(unwind) {
        run_inline(cleanup);
    }
}

/// Unloads the thread's objects and reports completion to the process.
struct ThreadCompletionState {
    thread: Arc<ThreadState>,
}

impl FunctionState for ThreadCompletionState {
    fn name(&self) -> &str {
        "thread-complete"
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let thread = self.thread;
        if thread.complete.swap(true, Ordering::AcqRel) {
            return Ok(FunctionOutcome::Complete);
        }
        let objects: Vec<Arc<ManagedObjectContainer>> = thread.thread_objects.lock().iter_mut().filter_map(Option::take).collect();
        let unload = ManagedObjectContainer::unload_all(objects, &thread, ManagedObjectScope::Thread);
        let finish: BoxedFunctionState = Box::new(ThreadFinishState { thread });
        Ok(FunctionOutcome::from_chain(Promise::then(unload, Some(finish))))
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Some(self)
    }
}

struct ThreadFinishState {
    thread: Arc<ThreadState>,
}

impl FunctionState for ThreadFinishState {
    fn name(&self) -> &str {
        "thread-finish"
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        debug!(thread = self.thread.id, failed = self.thread.is_failed(), "thread complete");
        let process = Arc::clone(self.thread.process());
        Ok(FunctionOutcome::from_chain(process.thread_completed(&self.thread)))
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Some(self)
    }
}

/// Invokes the process level handler, containing any panic it raises.
struct ProcessEscalationState {
    thread: Arc<ThreadState>,
    escalation: Escalation,
}

impl FunctionState for ProcessEscalationState {
    fn name(&self) -> &str {
        "process-escalation"
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let handler = Arc::clone(self.thread.process().top_handler());
        let escalation = self.escalation;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_escalation(&escalation))) {
            let failure = Escalation::panic(payload);
            error!(thread = self.thread.id, error = %failure, "process escalation handler failed");
        }
        Ok(FunctionOutcome::Complete)
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationKind;
    use crate::test_support::{Recorder, detached_process, detached_thread};
    use std::time::Duration;

    #[test]
    fn test_unhandled_escalation_reaches_process_handler() {
        let recorder = Recorder::default();
        let process = detached_process();
        let thread = ThreadState::new(Arc::clone(&process));

        let failing = ClosureFunctionState::new("failing", &thread, |_| Err(Escalation::application("broken", "bad state"))).boxed();
        let chain = Promise::all([Some(failing), Some(recorder.cancellable_state(&thread, "rest")), Some(thread.completion_state())]).unwrap();
        run_function_loop(chain, None);

        assert!(thread.is_failed());
        assert!(thread.is_complete());
        assert_eq!(recorder.entries(), vec!["cancel:rest", "cleanup:rest"]);

        let outcome = process.completion().wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.escalation().unwrap().kind(), &EscalationKind::Application("broken".into()));
    }

    #[test]
    fn test_completion_runs_once() {
        let process = detached_process();
        let thread = ThreadState::new(Arc::clone(&process));
        run_function_loop(thread.completion_state(), None);
        run_function_loop(thread.completion_state(), None);
        assert!(thread.is_complete());
        assert!(process.completion().is_complete());
    }

    #[test]
    fn test_active_function_is_tracked() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        run_function_loop(recorder.state(&thread, "tracked"), None);
        assert_eq!(thread.active_function().as_deref(), Some("tracked"));
    }

    #[test]
    fn test_abandoned_chain_is_cleaned_up() {
        let recorder = Recorder::default();
        let process = detached_process();
        let thread = ThreadState::new(Arc::clone(&process));
        let chain = Promise::all([Some(recorder.cancellable_state(&thread, "work")), Some(thread.completion_state())]).unwrap();

        abandon_chain(chain, Escalation::new(EscalationKind::TeamRejected, "stopped"));
        assert_eq!(recorder.entries(), vec!["cancel:work", "cleanup:work"]);
        assert!(thread.is_failed());
        let outcome = process.completion().wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.escalation().unwrap().kind(), &EscalationKind::TeamRejected);
    }
}
