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

//! Composition of function states into continuation chains.

use crate::function::{BoxedFunctionState, FunctionOutcome, FunctionState, FunctionStateContext, Unwind};
use crate::team::TeamManagement;
use crate::thread::ThreadState;
use std::sync::Arc;

/// Chain combinators.
pub struct Promise;

impl Promise {
    /// Runs `first` to completion, including every state it produces, then `second`.
    ///
    /// Either side may be empty; joining an empty chain returns the other side
    /// unchanged.
    pub fn then(first: Option<BoxedFunctionState>, second: Option<BoxedFunctionState>) -> Option<BoxedFunctionState> {
        match (first, second) {
            (None, None) => None,
            (Some(first), None) => Some(first),
            (None, Some(second)) => Some(second),
            (Some(first), Some(second)) => Some(Self::join(first, second)),
        }
    }

    /// Sequences the states in iteration order, skipping empty entries
    pub fn all<I>(states: I) -> Option<BoxedFunctionState>
    where
        I: IntoIterator<Item = Option<BoxedFunctionState>>,
    {
        let states: Vec<_> = states.into_iter().collect();
        states.into_iter().rev().fold(None, |rest, state| Self::then(state, rest))
    }

    pub(crate) fn join(first: BoxedFunctionState, second: BoxedFunctionState) -> BoxedFunctionState {
        Box::new(ThenFunctionState { delegate: first, then: second })
    }
}

/// `delegate` followed by `then`.
///
/// Everything `delegate` produces is re-wrapped, so `then` only runs once the
/// delegate's whole sub-chain has completed.
struct ThenFunctionState {
    delegate: BoxedFunctionState,
    then: BoxedFunctionState,
}

impl FunctionState for ThenFunctionState {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        self.delegate.thread_state()
    }

    fn responsible_team(&self) -> Option<&TeamManagement> {
        self.delegate.responsible_team()
    }

    fn execute(self: Box<Self>, context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let ThenFunctionState { delegate, then } = *self;
        match delegate.execute(context) {
            Ok(FunctionOutcome::Next(next)) => Ok(FunctionOutcome::Next(Promise::join(next, then))),
            Ok(FunctionOutcome::Complete) => Ok(FunctionOutcome::Next(then)),
            Ok(FunctionOutcome::Await(suspension)) => Ok(FunctionOutcome::Await(suspension.then(then))),
            Err(unwind) => Err(unwind.then_pending(Some(then))),
        }
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        let ThenFunctionState { delegate, then } = *self;
        let delegate_cleanup = delegate.cancel();
        let then_cleanup = then.cancel();
        Promise::then(delegate_cleanup, then_cleanup)
    }
}

impl ThreadState {
    /// Convenience for [`Promise::then`] when building a thread's chain
    pub fn then(&self, function: Option<BoxedFunctionState>, next: Option<BoxedFunctionState>) -> Option<BoxedFunctionState> {
        Promise::then(function, next)
    }
}
