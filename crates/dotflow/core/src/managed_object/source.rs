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

//! Managed object sources and the user handle they supply objects through.

use super::{ManagedObject, ManagedObjectContainer, RecycleFunction};
use crate::error::KernelResult;
use crate::escalation::{Escalation, EscalationKind};
use crate::kernel::ProcessInvoker;
use crate::office::Argument;
use crate::thread::ProcessCompletion;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Supplies instances of one managed object.
///
/// # Workflow
/// 1. `init` once while the kernel is built
/// 2. `start` when the kernel opens; sources that trigger processes keep the context
/// 3. `source_managed_object` whenever a scope first needs the object
/// 4. `stop` when the kernel closes
pub trait ManagedObjectSource: Send + Sync + 'static {
    fn init(&self, _context: &mut ManagedObjectSourceContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&self, _context: ManagedObjectExecuteContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Supplies an object, or a failure, through `user`
    fn source_managed_object(&self, user: ManagedObjectUser);

    fn stop(&self) {}
}

impl<F> ManagedObjectSource for F
where
    F: Fn(ManagedObjectUser) + Send + Sync + 'static,
{
    fn source_managed_object(&self, user: ManagedObjectUser) {
        self(user)
    }
}

/// Declarations a source may make while initialising.
pub struct ManagedObjectSourceContext {
    name: String,
    recycle: Option<Arc<dyn RecycleFunction>>,
    asynchronous: Option<Option<Duration>>,
}

impl ManagedObjectSourceContext {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            recycle: None,
            asynchronous: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_recycle_function(&mut self, recycle: Arc<dyn RecycleFunction>) {
        self.recycle = Some(recycle);
    }

    /// Objects arrive asynchronously; `None` uses the kernel's default timeout
    pub fn set_asynchronous(&mut self, timeout: Option<Duration>) {
        self.asynchronous = Some(timeout);
    }

    pub(crate) fn into_parts(self) -> (Option<Arc<dyn RecycleFunction>>, Option<Option<Duration>>) {
        (self.recycle, self.asynchronous)
    }
}

/// Handed to a source when the kernel opens.
#[derive(Clone)]
pub struct ManagedObjectExecuteContext {
    name: String,
    invoker: ProcessInvoker,
}

impl ManagedObjectExecuteContext {
    pub(crate) fn new(name: &str, invoker: ProcessInvoker) -> Self {
        Self {
            name: name.to_string(),
            invoker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts a new process at `function`
    pub fn invoke_process(&self, function: &str, argument: Option<Argument>) -> KernelResult<ProcessCompletion> {
        self.invoker.invoke_process(function, argument)
    }

    pub fn invoker(&self) -> &ProcessInvoker {
        &self.invoker
    }
}

impl fmt::Debug for ManagedObjectExecuteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectExecuteContext").field("name", &self.name).finish()
    }
}

/// One-shot handle through which a source supplies an object.
///
/// Dropping the handle without supplying anything fails the sourcing.
pub struct ManagedObjectUser {
    container: Option<Arc<ManagedObjectContainer>>,
}

impl ManagedObjectUser {
    pub(crate) fn new(container: Arc<ManagedObjectContainer>) -> Self {
        Self { container: Some(container) }
    }

    pub fn object_name(&self) -> &str {
        self.container.as_ref().map_or("", |container| container.name())
    }

    pub fn set_managed_object(mut self, object: Arc<dyn ManagedObject>) {
        if let Some(container) = self.container.take() {
            container.set_object(object);
        }
    }

    pub fn set_failure(mut self, failure: impl Into<Escalation>) {
        if let Some(container) = self.container.take() {
            container.fail(failure.into());
        }
    }
}

impl Drop for ManagedObjectUser {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            let message = format!("source for {} released its user without supplying an object", container.name());
            container.fail(Escalation::new(EscalationKind::ManagedObjectSource, message));
        }
    }
}

impl fmt::Debug for ManagedObjectUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectUser").field("object", &self.object_name()).finish()
    }
}
