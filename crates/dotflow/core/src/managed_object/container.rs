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

//! Lifecycle of one managed object instance.
//!
//! ```text
//! NotLoaded -> Loading -> Loaded -> Administering -> InUse -> Recycling -> Reused | Unloaded
//!                 |                      |
//!                 +------> Failed <------+
//! ```

use super::{ManagedObject, ManagedObjectMetaData, ManagedObjectScope, ManagedObjectUser, RecycleContext, RecycleFunction, SourcingMode, UnloadReason};
use crate::asset::{Asset, AssetCheck, AssetLatch, AssetRegistration, CheckAssetContext};
use crate::escalation::{CleanupEscalation, Escalation, EscalationKind, TimeoutKind};
use crate::function::{BoxedFunctionState, FunctionOutcome, FunctionState, FunctionStateContext, Unwind};
use crate::promise::Promise;
use crate::team::TeamManagement;
use crate::telemetry;
use crate::thread::ThreadState;
use metrics::counter;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    NotLoaded,
    Loading,
    Loaded,
    Administering,
    InUse,
    Recycling,
    Reused,
    Unloaded,
    Failed,
}

/// Whether a container's object can be used.
pub(crate) enum Readiness {
    Ready(Arc<dyn ManagedObject>),
    /// Park on the latch and check again once released
    Pending(Arc<AssetLatch>),
    Failed(Escalation),
}

struct ContainerInner {
    state: ContainerState,
    object: Option<Arc<dyn ManagedObject>>,
    failure: Option<Escalation>,
    latch: Arc<AssetLatch>,
    registration: Option<AssetRegistration>,
}

enum Step {
    Source,
    Administer(Arc<dyn ManagedObject>),
}

/// Holds one instance of a managed object for one scope instance.
///
/// # Concurrency
/// All transitions happen under the inner lock. Source, administration and
/// governance code always runs with the lock released.
pub struct ManagedObjectContainer {
    meta: Arc<ManagedObjectMetaData>,
    inner: Mutex<ContainerInner>,
}

impl ManagedObjectContainer {
    pub fn new(meta: Arc<ManagedObjectMetaData>) -> Arc<Self> {
        Arc::new(Self {
            meta,
            inner: Mutex::new(ContainerInner {
                state: ContainerState::NotLoaded,
                object: None,
                failure: None,
                latch: AssetLatch::new(),
                registration: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &Arc<ManagedObjectMetaData> {
        &self.meta
    }

    pub fn state(&self) -> ContainerState {
        self.inner.lock().state
    }

    /// Drives the container towards `InUse`.
    ///
    /// # Workflow
    /// 1. `NotLoaded`: register the sourcing timeout if asynchronous, then ask the source
    /// 2. `Loaded`: run pre-administration and governance exactly once
    /// 3. `Loading` / `Administering`: the caller parks on the current latch
    pub(crate) fn check_ready(self: &Arc<Self>, thread: &Arc<ThreadState>) -> Readiness {
        loop {
            let step = {
                let mut inner = self.inner.lock();
                match inner.state {
                    ContainerState::InUse => match inner.object.as_ref() {
                        Some(object) => return Readiness::Ready(Arc::clone(object)),
                        None => return Readiness::Failed(self.unavailable()),
                    },
                    ContainerState::Failed => {
                        let failure = inner.failure.clone().unwrap_or_else(|| self.unavailable());
                        return Readiness::Failed(failure);
                    }
                    ContainerState::Loading | ContainerState::Administering => return Readiness::Pending(Arc::clone(&inner.latch)),
                    ContainerState::NotLoaded => {
                        inner.state = ContainerState::Loading;
                        if let SourcingMode::Asynchronous { timeout } = self.meta.sourcing {
                            let asset = Arc::new(SourcingAsset {
                                container: Arc::downgrade(self),
                            });
                            let registration = thread.process().asset_manager().register(asset, timeout, TimeoutKind::ManagedObjectSourcing);
                            inner.registration = Some(registration);
                        }
                        Step::Source
                    }
                    ContainerState::Loaded => match inner.object.clone() {
                        Some(object) => {
                            inner.state = ContainerState::Administering;
                            inner.latch = AssetLatch::new();
                            Step::Administer(object)
                        }
                        None => return Readiness::Failed(self.unavailable()),
                    },
                    ContainerState::Recycling | ContainerState::Reused | ContainerState::Unloaded => return Readiness::Failed(self.unavailable()),
                }
            };

            match step {
                Step::Source => {
                    self.source();
                    if self.meta.sourcing == SourcingMode::Synchronous && self.state() == ContainerState::Loading {
                        let message = format!("synchronous source for {} returned without supplying an object", self.name());
                        self.fail(Escalation::new(EscalationKind::ManagedObjectSource, message));
                    }
                }
                Step::Administer(object) => self.administer(object),
            }
        }
    }

    fn unavailable(&self) -> Escalation {
        Escalation::new(EscalationKind::InvalidAccess, format!("managed object {} is not available", self.name()))
    }

    fn source(self: &Arc<Self>) {
        debug!(object = self.name(), "sourcing managed object");
        let user = ManagedObjectUser::new(Arc::clone(self));
        let meta = &self.meta;
        let sourced = panic::catch_unwind(AssertUnwindSafe(|| match &meta.pool {
            Some(pool) => pool.source_managed_object(meta.source.as_ref(), user),
            None => meta.source.source_managed_object(user),
        }));
        if let Err(payload) = sourced {
            self.fail(Escalation::panic(payload));
        }
    }

    fn administer(&self, object: Arc<dyn ManagedObject>) {
        let result = self
            .meta
            .pre_administration
            .iter()
            .try_for_each(|administration| invoke_hook(|| administration.administer(object.as_ref())))
            .and_then(|()| {
                self.meta
                    .governance
                    .iter()
                    .try_for_each(|governance| invoke_hook(|| governance.govern(object.as_ref())))
            });

        let latch = {
            let mut inner = self.inner.lock();
            match &result {
                Ok(()) => inner.state = ContainerState::InUse,
                Err(escalation) => {
                    inner.state = ContainerState::Failed;
                    inner.failure = Some(escalation.clone());
                    inner.object = None;
                }
            }
            Arc::clone(&inner.latch)
        };
        if let Err(escalation) = result {
            warn!(object = self.name(), error = %escalation, "managed object administration failed");
            self.discard(object, UnloadReason::AdministrationFailed);
        }
        latch.release();
    }

    /// Supplied by the source through its user
    pub(crate) fn set_object(&self, object: Arc<dyn ManagedObject>) {
        let latch = {
            let mut inner = self.inner.lock();
            if inner.state != ContainerState::Loading {
                drop(inner);
                warn!(object = self.name(), "managed object arrived after sourcing ended");
                self.discard(object, UnloadReason::LateArrival);
                return;
            }
            inner.state = ContainerState::Loaded;
            inner.object = Some(object);
            if let Some(registration) = inner.registration.take() {
                registration.unregister();
            }
            Arc::clone(&inner.latch)
        };
        counter!(telemetry::MANAGED_OBJECTS_LOADED, 1);
        debug!(object = self.name(), "managed object loaded");
        latch.release();
    }

    /// Fails sourcing; ignored once sourcing has ended
    pub(crate) fn fail(&self, escalation: Escalation) {
        let latch = {
            let mut inner = self.inner.lock();
            if inner.state != ContainerState::Loading {
                debug!(object = self.name(), error = %escalation, "ignoring failure after sourcing ended");
                return;
            }
            inner.state = ContainerState::Failed;
            inner.failure = Some(escalation.clone());
            if let Some(registration) = inner.registration.take() {
                registration.unregister();
            }
            Arc::clone(&inner.latch)
        };
        warn!(object = self.name(), error = %escalation, "managed object sourcing failed");
        latch.release();
    }

    fn reuse(&self, object: Arc<dyn ManagedObject>) {
        match &self.meta.pool {
            Some(pool) => {
                {
                    let mut inner = self.inner.lock();
                    inner.state = ContainerState::Reused;
                    inner.object = None;
                }
                counter!(telemetry::MANAGED_OBJECTS_REUSED, 1);
                debug!(object = self.name(), "managed object returned to pool");
                pool.reuse_managed_object(object);
            }
            None => {
                debug!(object = self.name(), "reuse requested without a pool");
                self.finish_unload(object, UnloadReason::NotReused);
            }
        }
    }

    fn finish_unload(&self, object: Arc<dyn ManagedObject>, reason: UnloadReason) {
        {
            let mut inner = self.inner.lock();
            inner.state = ContainerState::Unloaded;
            inner.object = None;
        }
        self.discard(object, reason);
    }

    fn discard(&self, object: Arc<dyn ManagedObject>, reason: UnloadReason) {
        debug!(object = self.name(), ?reason, "unloading managed object");
        if panic::catch_unwind(AssertUnwindSafe(|| object.unload(reason))).is_err() {
            warn!(object = self.name(), "managed object panicked while unloading");
        }
        if let Some(pool) = &self.meta.pool {
            pool.discard_managed_object(&object, reason);
        }
        counter!(telemetry::MANAGED_OBJECTS_UNLOADED, 1);
    }

    /// Chain unloading `containers` as one batch.
    ///
    /// Cleanup escalations raised by earlier objects are handed to the recycle
    /// functions of later ones, then reported to the process.
    pub(crate) fn unload_all(containers: Vec<Arc<ManagedObjectContainer>>, thread: &Arc<ThreadState>, scope: ManagedObjectScope) -> Option<BoxedFunctionState> {
        if containers.is_empty() {
            return None;
        }
        let batch = Arc::new(CleanupBatch::default());
        let unloads = containers.into_iter().map(|container| {
            Some(Box::new(UnloadState {
                container,
                thread: Arc::clone(thread),
                batch: Arc::clone(&batch),
                scope,
            }) as BoxedFunctionState)
        }).collect::<Vec<_>>();
        let report: BoxedFunctionState = Box::new(CleanupReportState {
            thread: Arc::clone(thread),
            batch,
        });
        Promise::then(Promise::all(unloads), Some(report))
    }
}

impl fmt::Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectContainer")
            .field("name", &self.meta.name)
            .field("state", &self.state())
            .finish()
    }
}

fn invoke_hook<F>(hook: F) -> Result<(), Escalation>
where
    F: FnOnce() -> Result<(), Escalation>,
{
    panic::catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|payload| Err(Escalation::panic(payload)))
}

fn scope_failed(scope: ManagedObjectScope, thread: &ThreadState) -> bool {
    match scope {
        ManagedObjectScope::Process => thread.process().is_failed(),
        ManagedObjectScope::Function | ManagedObjectScope::Thread => thread.is_failed(),
    }
}

/// Monitors an asynchronous sourcing for its timeout.
struct SourcingAsset {
    container: Weak<ManagedObjectContainer>,
}

impl Asset for SourcingAsset {
    fn check_on_asset(&self, _context: &CheckAssetContext) -> AssetCheck {
        match self.container.upgrade() {
            Some(container) if container.state() == ContainerState::Loading => AssetCheck::Pending,
            _ => AssetCheck::Resolved,
        }
    }

    fn fail_asset(&self, escalation: Escalation) {
        if let Some(container) = self.container.upgrade() {
            container.fail(escalation);
        }
    }
}

#[derive(Default)]
struct CleanupBatch {
    escalations: Mutex<Vec<CleanupEscalation>>,
}

impl CleanupBatch {
    fn push(&self, object_name: &str, escalation: Escalation) {
        counter!(telemetry::CLEANUP_ESCALATIONS, 1);
        warn!(object = object_name, error = %escalation, "cleanup escalation");
        self.escalations.lock().push(CleanupEscalation::new(object_name, escalation));
    }

    fn snapshot(&self) -> Vec<CleanupEscalation> {
        self.escalations.lock().clone()
    }

    fn take(&self) -> Vec<CleanupEscalation> {
        std::mem::take(&mut *self.escalations.lock())
    }
}

/// Post-administration, governance and hand-off to recycling for one object.
struct UnloadState {
    container: Arc<ManagedObjectContainer>,
    thread: Arc<ThreadState>,
    batch: Arc<CleanupBatch>,
    scope: ManagedObjectScope,
}

impl FunctionState for UnloadState {
    fn name(&self) -> &str {
        self.container.name()
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let UnloadState { container, thread, batch, scope } = *self;

        let (object, abandoned_latch, unused) = {
            let mut inner = container.inner.lock();
            match inner.state {
                ContainerState::InUse => {
                    inner.state = ContainerState::Recycling;
                    (inner.object.clone(), None, None)
                }
                ContainerState::Loading => {
                    inner.state = ContainerState::Failed;
                    inner.failure = Some(Escalation::new(EscalationKind::Cancelled, "scope ended before the object was supplied"));
                    if let Some(registration) = inner.registration.take() {
                        registration.unregister();
                    }
                    (None, Some(Arc::clone(&inner.latch)), None)
                }
                // Supplied, but the waiting chain never got to administer it
                ContainerState::Loaded => (None, None, inner.object.clone()),
                _ => (None, None, None),
            }
        };
        if let Some(latch) = abandoned_latch {
            latch.release();
        }
        if let Some(unused) = unused {
            container.finish_unload(unused, UnloadReason::Forced);
            return Ok(FunctionOutcome::Complete);
        }
        let Some(object) = object else {
            return Ok(FunctionOutcome::Complete);
        };

        let meta = Arc::clone(&container.meta);
        if scope_failed(scope, &thread) {
            for governance in &meta.governance {
                if let Err(escalation) = invoke_hook(|| governance.disregard(object.as_ref())) {
                    batch.push(&meta.name, escalation);
                }
            }
            container.finish_unload(object, UnloadReason::Forced);
            return Ok(FunctionOutcome::Complete);
        }

        for administration in &meta.post_administration {
            if let Err(escalation) = invoke_hook(|| administration.administer(object.as_ref())) {
                batch.push(&meta.name, escalation);
            }
        }
        for governance in &meta.governance {
            if let Err(escalation) = invoke_hook(|| governance.enforce(object.as_ref())) {
                batch.push(&meta.name, escalation);
            }
        }

        match &meta.recycle {
            Some(function) => Ok(FunctionOutcome::Next(Box::new(RecycleState {
                function: Arc::clone(function),
                team: meta.recycle_team.clone(),
                container,
                thread,
                batch,
                object,
            }))),
            None => {
                container.finish_unload(object, UnloadReason::NoRecycleFunction);
                Ok(FunctionOutcome::Complete)
            }
        }
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Some(self)
    }
}

/// Runs the recycle function, on the recycle team when one is declared.
struct RecycleState {
    container: Arc<ManagedObjectContainer>,
    thread: Arc<ThreadState>,
    batch: Arc<CleanupBatch>,
    object: Arc<dyn ManagedObject>,
    function: Arc<dyn RecycleFunction>,
    team: Option<TeamManagement>,
}

impl FunctionState for RecycleState {
    fn name(&self) -> &str {
        self.container.name()
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn responsible_team(&self) -> Option<&TeamManagement> {
        self.team.as_ref()
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let RecycleState {
            container,
            batch,
            object,
            function,
            ..
        } = *self;

        let earlier = batch.snapshot();
        let mut context = RecycleContext::new(container.name(), &object, &earlier);
        let result = invoke_hook(|| function.recycle(&mut context));
        let reused = context.is_reused();

        match result {
            Ok(()) if reused => container.reuse(object),
            Ok(()) => container.finish_unload(object, UnloadReason::NotReused),
            Err(escalation) => {
                batch.push(container.name(), escalation);
                container.finish_unload(object, UnloadReason::RecycleFailed);
            }
        }
        Ok(FunctionOutcome::Complete)
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Some(self)
    }
}

/// Hands a batch's cleanup escalations to the process outcome.
struct CleanupReportState {
    thread: Arc<ThreadState>,
    batch: Arc<CleanupBatch>,
}

impl FunctionState for CleanupReportState {
    fn name(&self) -> &str {
        "cleanup-report"
    }

    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(self: Box<Self>, _context: &mut FunctionStateContext) -> Result<FunctionOutcome, Unwind> {
        let escalations = self.batch.take();
        if !escalations.is_empty() {
            self.thread.process().record_cleanup_escalations(escalations);
        }
        Ok(FunctionOutcome::Complete)
    }

    fn cancel(self: Box<Self>) -> Option<BoxedFunctionState> {
        Some(self)
    }
}
