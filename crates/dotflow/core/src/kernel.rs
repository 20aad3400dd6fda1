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

//! Kernel entry point.
//!
//! # Lifecycle
//! 1. [`KernelBuilder::build`] creates teams and initialises sources
//! 2. [`Kernel::open`] starts teams, the asset manager, then the sources
//! 3. [`Kernel::invoke_process`] runs processes while open
//! 4. [`Kernel::close`] stops sources, the asset manager, then drains the teams

use crate::asset::AssetManager;
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::escalation::EscalationHandler;
use crate::managed_object::ManagedObjectExecuteContext;
use crate::office::{Argument, KernelBuilder, OfficeMetaData};
use crate::team::{TeamManagement, TeamRegistry};
use crate::thread::{ProcessCompletion, ProcessState};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

pub(crate) struct KernelInner {
    config: KernelConfig,
    office: Arc<OfficeMetaData>,
    teams: TeamRegistry,
    default_team: TeamManagement,
    assets: Arc<AssetManager>,
    top_handler: Arc<dyn EscalationHandler>,
    open: AtomicBool,
    // Serialises open and close
    lifecycle: Mutex<()>,
}

impl KernelInner {
    fn invoke_process(&self, function: &str, argument: Option<Argument>) -> KernelResult<ProcessCompletion> {
        if !self.open.load(Ordering::Acquire) {
            return Err(KernelError::NotOpen);
        }
        let function = self.office.function(function).ok_or_else(|| KernelError::UnknownFunction { name: function.to_string() })?;
        let process = ProcessState::new(
            Arc::clone(&self.office),
            self.default_team.clone(),
            Arc::clone(&self.assets),
            Arc::clone(&self.top_handler),
        );
        let completion = process.completion();
        debug!(process = %process.id(), function = function.name(), "invoking process");
        process.spawn_thread(function, argument);
        Ok(completion)
    }

    fn stop_sources(&self) {
        for object in self.office.all_managed_objects() {
            let source = Arc::clone(object.source());
            if panic::catch_unwind(AssertUnwindSafe(|| source.stop())).is_err() {
                warn!(object = object.name(), "managed object source panicked while stopping");
            }
        }
    }
}

/// A built office with its teams, ready to run processes.
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    pub(crate) fn new(
        config: KernelConfig,
        office: Arc<OfficeMetaData>,
        teams: TeamRegistry,
        default_team: TeamManagement,
        assets: Arc<AssetManager>,
        top_handler: Arc<dyn EscalationHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(KernelInner {
                config,
                office,
                teams,
                default_team,
                assets,
                top_handler,
                open: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn office(&self) -> &Arc<OfficeMetaData> {
        &self.inner.office
    }

    pub fn team_names(&self) -> Vec<String> {
        self.inner.teams.names()
    }

    pub fn team(&self, name: &str) -> Option<TeamManagement> {
        self.inner.teams.get(name)
    }

    pub fn asset_manager(&self) -> &Arc<AssetManager> {
        &self.inner.assets
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Handle for starting processes that does not keep the kernel alive
    pub fn invoker(&self) -> ProcessInvoker {
        ProcessInvoker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Starts teams, the asset manager and every managed object source.
    ///
    /// # Errors
    /// `AlreadyOpen`, a team or the asset manager failing to start, or a
    /// source failing to start. The kernel is closed again on failure.
    #[instrument(skip(self), fields(teams = self.inner.teams.len()))]
    pub fn open(&self) -> KernelResult<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        if self.inner.open.load(Ordering::Acquire) {
            return Err(KernelError::AlreadyOpen);
        }

        if let Err(err) = self.start() {
            error!(error = %err, "kernel failed to open");
            if let Err(stop_err) = self.shutdown() {
                warn!(error = %stop_err, "kernel did not stop cleanly after failing to open");
            }
            return Err(err);
        }
        info!("kernel open");
        Ok(())
    }

    fn start(&self) -> KernelResult<()> {
        self.inner.teams.start_all()?;
        self.inner.assets.start()?;
        self.inner.open.store(true, Ordering::Release);

        for object in self.inner.office.all_managed_objects() {
            let context = ManagedObjectExecuteContext::new(object.name(), self.invoker());
            object.source().start(context).map_err(|err| KernelError::ManagedObjectSource {
                name: object.name().to_string(),
                message: format!("{err:#}"),
            })?;
        }
        Ok(())
    }

    /// Starts a process at `function`.
    ///
    /// The returned handle completes once every thread of the process has
    /// finished and every process scoped object is unloaded.
    ///
    /// # Errors
    /// `NotOpen` outside open/close, `UnknownFunction` for an undeclared function
    #[instrument(skip(self, argument))]
    pub fn invoke_process(&self, function: &str, argument: Option<Argument>) -> KernelResult<ProcessCompletion> {
        self.inner.invoke_process(function, argument)
    }

    /// Stops sources and the asset manager, then drains the teams.
    ///
    /// Closing a kernel that is not open does nothing.
    #[instrument(skip(self))]
    pub fn close(&self) -> KernelResult<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        if !self.inner.open.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self.shutdown();
        info!("kernel closed");
        result
    }

    fn shutdown(&self) -> KernelResult<()> {
        self.inner.open.store(false, Ordering::Release);
        self.inner.stop_sources();
        self.inner.assets.stop();
        self.inner.teams.stop_all()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "kernel did not close cleanly");
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("open", &self.is_open())
            .field("teams", &self.team_names())
            .field("office", &self.inner.office)
            .finish()
    }
}

/// Starts processes on a kernel without owning it.
#[derive(Clone)]
pub struct ProcessInvoker {
    inner: Weak<KernelInner>,
}

impl ProcessInvoker {
    /// # Errors
    /// `NotOpen` once the kernel is closed or dropped
    pub fn invoke_process(&self, function: &str, argument: Option<Argument>) -> KernelResult<ProcessCompletion> {
        match self.inner.upgrade() {
            Some(inner) => inner.invoke_process(function, argument),
            None => Err(KernelError::NotOpen),
        }
    }
}

impl fmt::Debug for ProcessInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInvoker").field("alive", &(self.inner.strong_count() > 0)).finish()
    }
}
