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

//! Asynchronous flows.
//!
//! A function creates an asynchronous flow to signal that its thread must not
//! continue until some external party completes it. The function returns
//! immediately; its continuation parks until [`AsynchronousFlow::complete`]
//! is called or the flow times out.

use crate::asset::{Asset, AssetCheck, AssetLatch, AssetManager, AssetRegistration, CheckAssetContext};
use crate::error::{KernelError, KernelResult};
use crate::escalation::{Escalation, TimeoutKind};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Callback run on the owning function's team once the flow completes.
pub type AsynchronousFlowCompletion = Box<dyn FnOnce() -> Result<(), Escalation> + Send>;

enum FlowStatus {
    Pending,
    Completed(Option<AsynchronousFlowCompletion>),
    /// Completion already handed to the waiting chain
    Consumed,
    Failed(Escalation),
    /// The owning function escalated; completion is accepted and dropped
    Abandoned,
}

pub(crate) enum FlowPoll {
    Pending(Arc<AssetLatch>),
    Completed(Option<AsynchronousFlowCompletion>),
    Failed(Escalation),
}

pub(crate) struct AsynchronousFlowState {
    id: u64,
    status: Mutex<FlowStatus>,
    latch: Arc<AssetLatch>,
    registration: Mutex<Option<AssetRegistration>>,
}

impl AsynchronousFlowState {
    pub(crate) fn new(assets: &AssetManager, timeout: Duration) -> Arc<Self> {
        let state = Arc::new(Self {
            id: NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed),
            status: Mutex::new(FlowStatus::Pending),
            latch: AssetLatch::new(),
            registration: Mutex::new(None),
        });
        let registration = assets.register(Arc::clone(&state) as Arc<dyn Asset>, timeout, TimeoutKind::AsynchronousFlow);
        *state.registration.lock() = Some(registration);
        state
    }

    fn unregister(&self) {
        if let Some(registration) = self.registration.lock().take() {
            registration.unregister();
        }
    }

    /// Takes the completion if available
    pub(crate) fn poll(&self) -> FlowPoll {
        let mut status = self.status.lock();
        match std::mem::replace(&mut *status, FlowStatus::Consumed) {
            FlowStatus::Pending => {
                *status = FlowStatus::Pending;
                FlowPoll::Pending(Arc::clone(&self.latch))
            }
            FlowStatus::Completed(completion) => FlowPoll::Completed(completion),
            FlowStatus::Consumed => FlowPoll::Completed(None),
            FlowStatus::Failed(escalation) => {
                *status = FlowStatus::Failed(escalation.clone());
                FlowPoll::Failed(escalation)
            }
            FlowStatus::Abandoned => {
                *status = FlowStatus::Abandoned;
                FlowPoll::Completed(None)
            }
        }
    }

    /// Stops waiting on the flow; later completions are accepted and ignored
    pub(crate) fn abandon(&self) {
        {
            let mut status = self.status.lock();
            if matches!(*status, FlowStatus::Pending) {
                *status = FlowStatus::Abandoned;
            }
        }
        self.unregister();
    }
}

impl Asset for AsynchronousFlowState {
    fn check_on_asset(&self, _context: &CheckAssetContext) -> AssetCheck {
        match *self.status.lock() {
            FlowStatus::Pending => AssetCheck::Pending,
            _ => AssetCheck::Resolved,
        }
    }

    fn fail_asset(&self, escalation: Escalation) {
        {
            let mut status = self.status.lock();
            if !matches!(*status, FlowStatus::Pending) {
                return;
            }
            *status = FlowStatus::Failed(escalation);
        }
        debug!(flow = self.id, "asynchronous flow timed out");
        self.latch.release();
    }
}

/// Handle for completing an asynchronous flow from anywhere.
#[derive(Clone)]
pub struct AsynchronousFlow {
    state: Arc<AsynchronousFlowState>,
}

impl AsynchronousFlow {
    pub(crate) fn new(state: Arc<AsynchronousFlowState>) -> Self {
        Self { state }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Completes the flow, optionally running `completion` before the
    /// function's continuation resumes. An `Err` from the callback escalates
    /// on the function's thread.
    ///
    /// # Errors
    /// - `AsynchronousFlowAlreadyCompleted` on a second call
    /// - `AsynchronousFlowTimedOut` once the flow has timed out
    pub fn complete(&self, completion: Option<AsynchronousFlowCompletion>) -> KernelResult<()> {
        {
            let mut status = self.state.status.lock();
            match &*status {
                FlowStatus::Pending => *status = FlowStatus::Completed(completion),
                FlowStatus::Completed(_) | FlowStatus::Consumed => return Err(KernelError::AsynchronousFlowAlreadyCompleted),
                FlowStatus::Failed(_) => return Err(KernelError::AsynchronousFlowTimedOut),
                FlowStatus::Abandoned => {
                    *status = FlowStatus::Consumed;
                    debug!(flow = self.state.id, "completion of abandoned flow ignored");
                    return Ok(());
                }
            }
        }
        self.state.unregister();
        debug!(flow = self.state.id, "asynchronous flow completed");
        self.state.latch.release();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.state.status.lock(), FlowStatus::Completed(_) | FlowStatus::Consumed)
    }
}

impl fmt::Debug for AsynchronousFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsynchronousFlow")
            .field("id", &self.state.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}
