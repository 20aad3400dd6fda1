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

use super::ManagedObject;
use crate::escalation::{CleanupEscalation, Escalation};
use std::any::Any;
use std::sync::Arc;

/// Cleans up an object after use, optionally returning it to its pool.
pub trait RecycleFunction: Send + Sync + 'static {
    fn recycle(&self, context: &mut RecycleContext<'_>) -> Result<(), Escalation>;
}

impl<F> RecycleFunction for F
where
    F: Fn(&mut RecycleContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
{
    fn recycle(&self, context: &mut RecycleContext<'_>) -> Result<(), Escalation> {
        self(context)
    }
}

/// What a recycle function sees of the object being recycled.
pub struct RecycleContext<'a> {
    object_name: &'a str,
    object: &'a Arc<dyn ManagedObject>,
    cleanup_escalations: &'a [CleanupEscalation],
    reused: bool,
}

impl<'a> RecycleContext<'a> {
    pub(crate) fn new(object_name: &'a str, object: &'a Arc<dyn ManagedObject>, cleanup_escalations: &'a [CleanupEscalation]) -> Self {
        Self {
            object_name,
            object,
            cleanup_escalations,
            reused: false,
        }
    }

    pub fn object_name(&self) -> &str {
        self.object_name
    }

    pub fn managed_object(&self) -> &dyn ManagedObject {
        self.object.as_ref()
    }

    pub fn object<T: Any>(&self) -> Option<&T> {
        self.object.object().downcast_ref::<T>()
    }

    /// Failures from objects unloaded earlier in the same batch
    pub fn cleanup_escalations(&self) -> &[CleanupEscalation] {
        self.cleanup_escalations
    }

    /// Returns the object to its pool instead of unloading it
    pub fn reuse_managed_object(&mut self) {
        self.reused = true;
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }
}
