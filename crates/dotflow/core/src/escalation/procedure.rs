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

use super::{Escalation, EscalationKind};
use crate::function::{BoxedFunctionState, FunctionOutcome, FunctionState, FunctionStateContext, Unwind};
use crate::promise::Promise;
use crate::team::TeamManagement;
use crate::telemetry;
use crate::thread::ThreadState;
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Selects the escalations a flow handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationMatcher {
    Kind(EscalationKind),
    /// Matches every escalation, consulted after all exact kinds
    Any,
}

impl EscalationMatcher {
    pub fn matches(&self, escalation: &Escalation) -> bool {
        match self {
            EscalationMatcher::Kind(kind) => kind == escalation.kind(),
            EscalationMatcher::Any => true,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, EscalationMatcher::Kind(_))
    }
}

impl From<EscalationKind> for EscalationMatcher {
    fn from(kind: EscalationKind) -> Self {
        EscalationMatcher::Kind(kind)
    }
}

/// Produces the chain that handles a matched escalation.
pub trait EscalationFlowHandler: Send + Sync + 'static {
    fn create_handler(&self, thread: &Arc<ThreadState>, escalation: Escalation) -> Option<BoxedFunctionState>;
}

impl<F> EscalationFlowHandler for F
where
    F: Fn(&Arc<ThreadState>, Escalation) -> Option<BoxedFunctionState> + Send + Sync + 'static,
{
    fn create_handler(&self, thread: &Arc<ThreadState>, escalation: Escalation) -> Option<BoxedFunctionState> {
        self(thread, escalation)
    }
}

/// One matcher and the handler it routes to.
#[derive(Clone)]
pub struct EscalationFlow {
    matcher: EscalationMatcher,
    handler_name: String,
    handler: Arc<dyn EscalationFlowHandler>,
}

impl EscalationFlow {
    pub fn new(matcher: EscalationMatcher, handler_name: impl Into<String>, handler: Arc<dyn EscalationFlowHandler>) -> Self {
        Self {
            matcher,
            handler_name: handler_name.into(),
            handler,
        }
    }

    pub fn matcher(&self) -> &EscalationMatcher {
        &self.matcher
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn handler(&self) -> &Arc<dyn EscalationFlowHandler> {
        &self.handler
    }
}

impl fmt::Debug for EscalationFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationFlow")
            .field("matcher", &self.matcher)
            .field("handler", &self.handler_name)
            .finish()
    }
}

/// Ordered escalation flows for one level of a thread.
#[derive(Debug, Clone, Default)]
pub struct EscalationProcedure {
    flows: Vec<EscalationFlow>,
}

impl EscalationProcedure {
    pub fn new(flows: Vec<EscalationFlow>) -> Self {
        Self { flows }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flows(&self) -> &[EscalationFlow] {
        &self.flows
    }

    /// First exact match in declaration order, else the first catch-all
    pub fn find(&self, escalation: &Escalation) -> Option<&EscalationFlow> {
        self.flows
            .iter()
            .find(|flow| flow.matcher.is_exact() && flow.matcher.matches(escalation))
            .or_else(|| self.flows.iter().find(|flow| !flow.matcher.is_exact()))
    }
}

/// A region of a thread's chain covered by an escalation procedure.
///
/// While the body executes, the procedure is pushed on the thread's
/// escalation stack. An escalation unwinding out of the body that the
/// procedure matches is stopped here: the body's pending remainder is
/// cancelled and the handler chain continues in its place, followed by the
/// cleanup of the cancelled remainder. Anything else keeps unwinding.
pub struct EscalationScope {
    procedure: Arc<EscalationProcedure>,
    body: BoxedFunctionState,
}

impl EscalationScope {
    pub fn wrap(procedure: Arc<EscalationProcedure>, body: BoxedFunctionState) -> BoxedFunctionState {
        if procedure.is_empty() {
            return body;
        }
        Box::new(Self { procedure, body })
    }
}

impl FunctionState for EscalationScope {
    fn name(&self) -> &str {
        self.body.name()
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        self.body.thread_state()
    }

    fn responsible_team(&self) -> Option<&TeamManagement> {
        self.body.responsible_team()
    }

    fn execute(self: Box<Self>, context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let EscalationScope { procedure, body } = *self;
        let thread = Arc::clone(body.thread_state());

        thread.push_escalation_procedure(Arc::clone(&procedure));
        let result = body.execute(context);
        thread.pop_escalation_procedure();

        match result {
            Ok(FunctionOutcome::Next(next)) => Ok(FunctionOutcome::Next(Box::new(EscalationScope { procedure, body: next }))),
            Ok(FunctionOutcome::Complete) => Ok(FunctionOutcome::Complete),
            Ok(FunctionOutcome::Await(suspension)) => Ok(FunctionOutcome::Await(
                suspension.map_chain(|chain| Box::new(EscalationScope { procedure, body: chain })),
            )),
            Err(unwind) => {
                let Some(flow) = procedure.find(unwind.escalation()) else {
                    return Err(unwind);
                };
                counter!(telemetry::ESCALATIONS_HANDLED, 1);
                debug!(
                    thread = thread.id(),
                    kind = %unwind.escalation().kind(),
                    handler = flow.handler_name(),
                    "escalation handled by region"
                );
                let handler = Arc::clone(flow.handler());
                let (escalation, pending) = unwind.into_parts();
                let cleanup = pending.and_then(|pending| pending.cancel());
                let handling = handler.create_handler(&thread, escalation);
                Ok(FunctionOutcome::from_chain(Promise::then(handling, cleanup)))
            }
        }
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        self.body.cancel()
    }
}

/// Last-resort handler for escalations no procedure matched.
pub trait EscalationHandler: Send + Sync + 'static {
    fn handle_escalation(&self, escalation: &Escalation);
}

impl<F> EscalationHandler for F
where
    F: Fn(&Escalation) + Send + Sync + 'static,
{
    fn handle_escalation(&self, escalation: &Escalation) {
        self(escalation)
    }
}

/// Default process level handler: logs the escalation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEscalationHandler;

impl EscalationHandler for LoggingEscalationHandler {
    fn handle_escalation(&self, escalation: &Escalation) {
        error!(kind = %escalation.kind(), message = escalation.message(), "unhandled escalation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::ClosureFunctionState;
    use crate::test_support::{Recorder, detached_thread};
    use crate::thread::run_function_loop;

    fn recording_flow(matcher: EscalationMatcher, recorder: &Recorder, label: &'static str) -> EscalationFlow {
        let recorder = recorder.clone();
        let handler = move |thread: &Arc<ThreadState>, escalation: Escalation| {
            let log = recorder.clone();
            Some(
                ClosureFunctionState::new(label, thread, move |_| {
                    log.record(format!("{label}:{}", escalation.message()));
                    Ok(None)
                })
                .boxed(),
            )
        };
        EscalationFlow::new(matcher, label, Arc::new(handler))
    }

    #[test]
    fn test_exact_match_beats_catch_all() {
        let recorder = Recorder::default();
        let procedure = EscalationProcedure::new(vec![
            recording_flow(EscalationMatcher::Any, &recorder, "any"),
            recording_flow(EscalationKind::Panic.into(), &recorder, "panic"),
        ]);

        let panic = Escalation::new(EscalationKind::Panic, "boom");
        assert_eq!(procedure.find(&panic).unwrap().handler_name(), "panic");

        let other = Escalation::new(EscalationKind::Governance, "denied");
        assert_eq!(procedure.find(&other).unwrap().handler_name(), "any");

        assert!(EscalationProcedure::default().find(&other).is_none());
    }

    #[test]
    fn test_scope_handles_matched_escalation() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let procedure = Arc::new(EscalationProcedure::new(vec![recording_flow(EscalationKind::Panic.into(), &recorder, "handler")]));

        let failing = ClosureFunctionState::new("failing", &thread, |_| Err(Escalation::new(EscalationKind::Panic, "boom"))).boxed();
        let region = Promise::all(vec![Some(failing), Some(recorder.cancellable_state(&thread, "skipped"))]).unwrap();
        let chain = Promise::then(Some(EscalationScope::wrap(procedure, region)), Some(recorder.state(&thread, "after")));

        run_function_loop(chain.unwrap(), None);
        assert_eq!(recorder.entries(), vec!["cancel:skipped", "handler:boom", "cleanup:skipped", "after"]);
        assert_eq!(thread.escalation_depth(), 0);
    }

    #[test]
    fn test_scope_propagates_unmatched_escalation() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let procedure = Arc::new(EscalationProcedure::new(vec![recording_flow(EscalationKind::Panic.into(), &recorder, "handler")]));

        let failing = ClosureFunctionState::new("failing", &thread, |_| Err(Escalation::application("other", "nope"))).boxed();
        let scope = EscalationScope::wrap(procedure, failing);

        let unwind = scope.execute(&mut FunctionStateContext::new(None)).unwrap_err();
        assert_eq!(unwind.escalation().message(), "nope");
        assert!(recorder.entries().is_empty());
    }

    #[test]
    fn test_scope_is_active_while_body_executes() {
        let thread = detached_thread();
        let procedure = Arc::new(EscalationProcedure::new(vec![recording_flow(EscalationMatcher::Any, &Recorder::default(), "any")]));
        let observed = Recorder::default();
        let log = observed.clone();
        let inspect_thread = Arc::clone(&thread);
        let inspect = ClosureFunctionState::new("inspect", &thread, move |_| {
            log.record(format!("depth:{}", inspect_thread.escalation_depth()));
            Ok(None)
        })
        .boxed();

        run_function_loop(EscalationScope::wrap(procedure, inspect), None);
        assert_eq!(observed.entries(), vec!["depth:1"]);
        assert_eq!(thread.escalation_depth(), 0);
    }

    #[test]
    fn test_empty_procedure_does_not_wrap() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let body = recorder.state(&thread, "body");
        let address = body.as_ref() as *const dyn FunctionState as *const ();
        let wrapped = EscalationScope::wrap(Arc::new(EscalationProcedure::default()), body);
        assert_eq!(wrapped.as_ref() as *const dyn FunctionState as *const (), address);
    }
}
