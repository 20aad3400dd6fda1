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

//! Function states: the units of work that make up a continuation chain.
//!
//! A chain is an `Option<BoxedFunctionState>`; `None` is the empty chain.
//! Executing a state consumes it and yields a [`FunctionOutcome`] describing
//! what runs next, or an [`Unwind`] carrying an escalation together with the
//! part of the chain that was still pending when it was raised.

use crate::asset::AssetLatch;
use crate::escalation::Escalation;
use crate::promise::Promise;
use crate::team::{TeamId, TeamManagement};
use crate::thread::ThreadState;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

pub type BoxedFunctionState = Box<dyn FunctionState>;

/// A single step of a continuation chain.
///
/// # Workflow
/// 1. The function loop checks [`responsible_team`](Self::responsible_team);
///    when it names a team other than the current one, the remaining chain is
///    handed to that team as a job.
/// 2. Otherwise [`execute`](Self::execute) runs on the current worker.
/// 3. [`cancel`](Self::cancel) is used instead of `execute` when an escalation
///    unwinds past the state, returning whatever cleanup must still run.
pub trait FunctionState: Send + 'static {
    /// Diagnostic name
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Thread state the step belongs to
    fn thread_state(&self) -> &Arc<ThreadState>;

    /// Team that must execute this step, `None` to run on any worker
    fn responsible_team(&self) -> Option<&TeamManagement> {
        None
    }

    fn execute(self: Box<Self>, context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind>;

    /// Returns the cleanup still required once this step will never execute.
    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        None
    }
}

/// Result of executing one function state.
pub enum FunctionOutcome {
    /// Continue with this state
    Next(BoxedFunctionState),
    /// The chain is finished
    Complete,
    /// The chain cannot progress until the latch is released
    Await(Suspension),
}

impl FunctionOutcome {
    pub fn from_chain(chain: Option<BoxedFunctionState>) -> Self {
        match chain {
            Some(next) => FunctionOutcome::Next(next),
            None => FunctionOutcome::Complete,
        }
    }
}

impl fmt::Debug for FunctionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionOutcome::Next(next) => write!(f, "Next({})", next.name()),
            FunctionOutcome::Complete => write!(f, "Complete"),
            FunctionOutcome::Await(suspension) => write!(f, "Await({})", suspension.chain.name()),
        }
    }
}

/// A chain parked on a latch.
///
/// Wrapping states re-wrap the suspended chain on the way out so that the
/// chain resumed later is the complete remainder, not only the innermost step.
pub struct Suspension {
    latch: Arc<AssetLatch>,
    chain: BoxedFunctionState,
}

impl Suspension {
    pub fn new(latch: Arc<AssetLatch>, chain: BoxedFunctionState) -> Self {
        Self { latch, chain }
    }

    pub fn map_chain<F>(self, wrap: F) -> Self
    where
        F: FnOnce(BoxedFunctionState) -> BoxedFunctionState,
    {
        Self {
            latch: self.latch,
            chain: wrap(self.chain),
        }
    }

    /// Appends `next` to the suspended chain
    pub fn then(self, next: BoxedFunctionState) -> Self {
        self.map_chain(|chain| Promise::join(chain, next))
    }

    pub fn latch(&self) -> &Arc<AssetLatch> {
        &self.latch
    }

    pub(crate) fn into_parts(self) -> (Arc<AssetLatch>, BoxedFunctionState) {
        (self.latch, self.chain)
    }
}

/// An escalation unwinding a chain.
///
/// `pending` accumulates the remainder of the chain, innermost first, as the
/// unwind passes through each wrapping state. Whoever handles the escalation
/// cancels the pending remainder to obtain its cleanup.
pub struct Unwind {
    escalation: Escalation,
    pending: Option<BoxedFunctionState>,
}

impl Unwind {
    pub fn new(escalation: Escalation) -> Self {
        Self { escalation, pending: None }
    }

    pub fn escalation(&self) -> &Escalation {
        &self.escalation
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Appends the remainder owned by an enclosing state
    pub fn then_pending(mut self, next: Option<BoxedFunctionState>) -> Self {
        self.pending = Promise::then(self.pending.take(), next);
        self
    }

    pub fn into_parts(self) -> (Escalation, Option<BoxedFunctionState>) {
        (self.escalation, self.pending)
    }
}

impl From<Escalation> for Unwind {
    fn from(escalation: Escalation) -> Self {
        Self::new(escalation)
    }
}

impl fmt::Debug for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwind")
            .field("escalation", &self.escalation)
            .field("pending", &self.pending.as_ref().map(|state| state.name().to_string()))
            .finish()
    }
}

/// Per-job context handed to every executed state.
#[derive(Debug)]
pub struct FunctionStateContext {
    team: Option<TeamId>,
    executed: usize,
}

impl FunctionStateContext {
    pub fn new(team: Option<TeamId>) -> Self {
        Self { team, executed: 0 }
    }

    /// Team whose worker is running this job, `None` for a resolver thread
    pub fn current_team(&self) -> Option<&TeamId> {
        self.team.as_ref()
    }

    /// Number of states executed by this job so far
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub(crate) fn record_execution(&mut self) {
        self.executed += 1;
    }
}

type ClosureBody = Box<dyn FnOnce(&mut FunctionStateContext) -> Result<Option<BoxedFunctionState>, Escalation> + Send>;
type ClosureCleanup = Box<dyn FnOnce() -> Option<BoxedFunctionState> + Send>;

/// Function state backed by a closure.
///
/// The closure returns the chain to continue with; an `Err` escalates.
pub struct ClosureFunctionState {
    name: Cow<'static, str>,
    thread: Arc<ThreadState>,
    team: Option<TeamManagement>,
    body: ClosureBody,
    cleanup: Option<ClosureCleanup>,
}

impl ClosureFunctionState {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, thread: &Arc<ThreadState>, body: F) -> Self
    where
        F: FnOnce(&mut FunctionStateContext) -> Result<Option<BoxedFunctionState>, Escalation> + Send + 'static,
    {
        Self {
            name: name.into(),
            thread: Arc::clone(thread),
            team: None,
            body: Box::new(body),
            cleanup: None,
        }
    }

    pub fn on_team(mut self, team: TeamManagement) -> Self {
        self.team = Some(team);
        self
    }

    /// Cleanup chain produced when the state is cancelled instead of executed
    pub fn on_cancel<C>(mut self, cleanup: C) -> Self
    where
        C: FnOnce() -> Option<BoxedFunctionState> + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    pub fn boxed(self) -> BoxedFunctionState {
        Box::new(self)
    }
}

impl FunctionState for ClosureFunctionState {
    fn name(&self) -> &str {
        &self.name
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn responsible_team(&self) -> Option<&TeamManagement> {
        self.team.as_ref()
    }

    fn execute(self: Box<Self>, context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let next = (self.body)(context).map_err(Unwind::new)?;
        Ok(FunctionOutcome::from_chain(next))
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        self.cleanup.and_then(|cleanup| cleanup())
    }
}
