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

//! Process state: the threads of one invocation and their shared objects.

use super::ThreadState;
use crate::asset::AssetManager;
use crate::escalation::{CleanupEscalation, Escalation, EscalationHandler};
use crate::function::{BoxedFunctionState, FunctionOutcome, FunctionState, FunctionStateContext, Unwind};
use crate::managed_object::{ManagedObjectContainer, ManagedObjectScope};
use crate::office::{Argument, FunctionMetaData, ManagedFunctionContainer, OfficeMetaData};
use crate::promise::Promise;
use crate::team::TeamManagement;
use crate::telemetry;
use futures::task::AtomicWaker;
use metrics::counter;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Final report of a process.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    process_id: Uuid,
    escalation: Option<Escalation>,
    cleanup_escalations: Vec<CleanupEscalation>,
}

impl ProcessOutcome {
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// First escalation that reached the process level handler
    pub fn escalation(&self) -> Option<&Escalation> {
        self.escalation.as_ref()
    }

    pub fn cleanup_escalations(&self) -> &[CleanupEscalation] {
        &self.cleanup_escalations
    }

    pub fn is_success(&self) -> bool {
        self.escalation.is_none()
    }
}

#[derive(Default)]
struct CompletionSlot {
    outcome: Mutex<Option<ProcessOutcome>>,
    completed: Condvar,
    waker: AtomicWaker,
}

impl CompletionSlot {
    fn complete(&self, outcome: ProcessOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.completed.notify_all();
        self.waker.wake();
    }
}

/// Handle for waiting on a process.
///
/// Can be waited on from a blocking thread or awaited as a future.
#[derive(Clone)]
pub struct ProcessCompletion {
    process_id: Uuid,
    slot: Arc<CompletionSlot>,
}

impl ProcessCompletion {
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    pub fn is_complete(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Outcome if the process has completed
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.slot.outcome.lock().clone()
    }

    /// Blocks until the process completes
    pub fn wait(&self) -> ProcessOutcome {
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.slot.completed.wait(&mut outcome);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return Some(outcome.clone());
            }
            if self.slot.completed.wait_until(&mut outcome, deadline).timed_out() {
                return outcome.clone();
            }
        }
    }
}

impl Future for ProcessCompletion {
    type Output = ProcessOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.waker.register(cx.waker());
        match self.slot.outcome.lock().as_ref() {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => Poll::Pending,
        }
    }
}

impl fmt::Debug for ProcessCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCompletion")
            .field("process_id", &self.process_id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// State shared by every thread of one process invocation.
pub struct ProcessState {
    id: Uuid,
    office: Arc<OfficeMetaData>,
    default_team: TeamManagement,
    assets: Arc<AssetManager>,
    top_handler: Arc<dyn EscalationHandler>,
    process_objects: Mutex<Vec<Option<Arc<ManagedObjectContainer>>>>,
    active_threads: AtomicUsize,
    failed: AtomicBool,
    escalation: Mutex<Option<Escalation>>,
    cleanup_escalations: Mutex<Vec<CleanupEscalation>>,
    completion: Arc<CompletionSlot>,
}

impl ProcessState {
    pub(crate) fn new(
        office: Arc<OfficeMetaData>,
        default_team: TeamManagement,
        assets: Arc<AssetManager>,
        top_handler: Arc<dyn EscalationHandler>,
    ) -> Arc<Self> {
        let process_objects = vec![None; office.managed_objects(ManagedObjectScope::Process).len()];
        Arc::new(Self {
            id: Uuid::new_v4(),
            office,
            default_team,
            assets,
            top_handler,
            process_objects: Mutex::new(process_objects),
            active_threads: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            escalation: Mutex::new(None),
            cleanup_escalations: Mutex::new(Vec::new()),
            completion: Arc::new(CompletionSlot::default()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn office(&self) -> &Arc<OfficeMetaData> {
        &self.office
    }

    /// Team for chains that do not name one
    pub fn default_team(&self) -> &TeamManagement {
        &self.default_team
    }

    pub fn asset_manager(&self) -> &Arc<AssetManager> {
        &self.assets
    }

    pub(crate) fn top_handler(&self) -> &Arc<dyn EscalationHandler> {
        &self.top_handler
    }

    /// Whether any thread reached the process level handler
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    pub fn completion(&self) -> ProcessCompletion {
        ProcessCompletion {
            process_id: self.id,
            slot: Arc::clone(&self.completion),
        }
    }

    /// Starts a new thread running `function`
    pub(crate) fn spawn_thread(self: &Arc<Self>, function: &Arc<FunctionMetaData>, argument: Option<Argument>) -> Arc<ThreadState> {
        let thread = ThreadState::new(Arc::clone(self));
        let body = ManagedFunctionContainer::create(function, &thread, argument);
        let chain = Promise::join(body, thread.completion_state());
        debug!(process = %self.id, thread = thread.id(), function = function.name(), "thread spawned");
        super::activate(chain);
        thread
    }

    pub(crate) fn process_object(&self, index: usize) -> Option<Arc<ManagedObjectContainer>> {
        let mut objects = self.process_objects.lock();
        let slot = objects.get_mut(index)?;
        if slot.is_none() {
            let meta = self.office.managed_objects(ManagedObjectScope::Process).get(index)?;
            *slot = Some(ManagedObjectContainer::new(Arc::clone(meta)));
        }
        slot.clone()
    }

    pub(crate) fn thread_started(&self) {
        self.active_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks the process failed, keeping the first escalation for the outcome
    pub(crate) fn record_failure(&self, escalation: Escalation) {
        self.failed.store(true, Ordering::Release);
        self.escalation.lock().get_or_insert(escalation);
    }

    pub(crate) fn record_cleanup_escalations(&self, escalations: Vec<CleanupEscalation>) {
        self.cleanup_escalations.lock().extend(escalations);
    }

    /// Called once per finished thread; the last thread receives the process teardown chain
    pub(crate) fn thread_completed(self: &Arc<Self>, thread: &Arc<ThreadState>) -> Option<BoxedFunctionState> {
        if self.active_threads.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        let objects: Vec<Arc<ManagedObjectContainer>> = self.process_objects.lock().iter_mut().filter_map(Option::take).collect();
        let unload = ManagedObjectContainer::unload_all(objects, thread, ManagedObjectScope::Process);
        let finish: BoxedFunctionState = Box::new(ProcessFinishState {
            process: Arc::clone(self),
            thread: Arc::clone(thread),
        });
        Promise::then(unload, Some(finish))
    }

    fn finish(&self) {
        let outcome = ProcessOutcome {
            process_id: self.id,
            escalation: self.escalation.lock().clone(),
            cleanup_escalations: self.cleanup_escalations.lock().clone(),
        };
        counter!(telemetry::PROCESSES_COMPLETED, 1);
        info!(process = %self.id, success = outcome.is_success(), cleanup_escalations = outcome.cleanup_escalations.len(), "process completed");
        self.completion.complete(outcome);
    }
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("active_threads", &self.active_threads())
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Publishes the process outcome once every object is unloaded.
struct ProcessFinishState {
    process: Arc<ProcessState>,
    thread: Arc<ThreadState>,
}

impl FunctionState for ProcessFinishState {
    fn name(&self) -> &str {
        "process-complete"
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        self.process.finish();
        Ok(FunctionOutcome::Complete)
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::detached_process;

    #[test]
    fn test_single_thread_completes_process() {
        let process = detached_process();
        let completion = process.completion();
        let thread = ThreadState::new(Arc::clone(&process));
        assert_eq!(process.active_threads(), 1);

        let teardown = process.thread_completed(&thread).expect("last thread tears down");
        crate::thread::run_function_loop(teardown, None);

        let outcome = completion.wait_timeout(Duration::from_secs(1)).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.process_id(), process.id());
    }

    #[test]
    fn test_only_last_thread_tears_down() {
        let process = detached_process();
        let first = ThreadState::new(Arc::clone(&process));
        let second = ThreadState::new(Arc::clone(&process));

        assert!(process.thread_completed(&first).is_none());
        assert!(process.completion().wait_timeout(Duration::from_millis(10)).is_none());
        assert!(process.thread_completed(&second).is_some());
    }

    #[test]
    fn test_first_failure_is_kept() {
        let process = detached_process();
        process.record_failure(Escalation::application("first", "a"));
        process.record_failure(Escalation::application("second", "b"));
        assert!(process.is_failed());

        let thread = ThreadState::new(Arc::clone(&process));
        crate::thread::run_function_loop(process.thread_completed(&thread).unwrap(), None);
        let outcome = process.completion().wait();
        assert_eq!(outcome.escalation().unwrap().message(), "a");
    }

    #[tokio::test]
    async fn test_completion_is_a_future() {
        let process = detached_process();
        let completion = process.completion();
        let thread = ThreadState::new(Arc::clone(&process));
        let teardown = process.thread_completed(&thread).unwrap();

        std::thread::spawn(move || crate::thread::run_function_loop(teardown, None));
        let outcome = completion.await;
        assert!(outcome.is_success());
    }
}
