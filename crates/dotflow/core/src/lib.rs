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

//! Dotflow Core
//!
//! An execution kernel that runs units of work ("functions") as explicit
//! continuation chains instead of native call stacks. Each chain step is
//! dispatched to the worker team its function names, may park on a managed
//! object or asynchronous flow, and routes failures as escalations through
//! the handlers of its thread.
//!
//! The usual entry point is [`KernelBuilder`]: declare teams, managed objects
//! and functions, build a [`Kernel`], open it and invoke processes.

pub mod asset;
pub mod config;
pub mod error;
pub mod escalation;
pub mod flow;
pub mod function;
pub mod kernel;
pub mod managed_object;
pub mod office;
pub mod promise;
pub mod team;
pub mod telemetry;
pub mod thread;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export the types most embedders need
pub use config::{KernelConfig, TeamConfig, TeamKind};
pub use error::{KernelError, KernelResult};
pub use escalation::{CleanupEscalation, Escalation, EscalationKind, EscalationMatcher};
pub use flow::AsynchronousFlow;
pub use function::{BoxedFunctionState, FunctionOutcome, FunctionState};
pub use kernel::{Kernel, ProcessInvoker};
pub use managed_object::{ManagedObject, ManagedObjectRef, ManagedObjectScope, ManagedObjectSource, ManagedObjectUser, UnloadReason};
pub use office::{Argument, FunctionResult, KernelBuilder, ManagedFunctionContext};
pub use promise::Promise;
pub use thread::{ProcessCompletion, ProcessOutcome};
