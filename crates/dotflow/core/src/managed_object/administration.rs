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

//! Administration and governance hooks attached to managed objects.
//!
//! Hooks receive the object and downcast it to whatever capability they
//! expect; objects opt in simply by being of a type the hook understands.

use super::ManagedObject;
use crate::escalation::Escalation;

/// Hook run before an object is first used, or after its last use.
pub trait Administration: Send + Sync + 'static {
    fn administer(&self, object: &dyn ManagedObject) -> Result<(), Escalation>;
}

impl<F> Administration for F
where
    F: Fn(&dyn ManagedObject) -> Result<(), Escalation> + Send + Sync + 'static,
{
    fn administer(&self, object: &dyn ManagedObject) -> Result<(), Escalation> {
        self(object)
    }
}

/// Governance over an object's use.
///
/// `govern` runs when the object is loaded. On unload either `enforce`
/// (normal completion) or `disregard` (the owning scope failed) runs.
pub trait Governance: Send + Sync + 'static {
    fn govern(&self, object: &dyn ManagedObject) -> Result<(), Escalation>;

    fn enforce(&self, _object: &dyn ManagedObject) -> Result<(), Escalation> {
        Ok(())
    }

    fn disregard(&self, _object: &dyn ManagedObject) -> Result<(), Escalation> {
        Ok(())
    }
}

type Hook = Box<dyn Fn(&dyn ManagedObject) -> Result<(), Escalation> + Send + Sync>;

/// Governance assembled from closures.
#[derive(Default)]
pub struct GovernanceHooks {
    govern: Option<Hook>,
    enforce: Option<Hook>,
    disregard: Option<Hook>,
}

impl GovernanceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_govern<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn ManagedObject) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        self.govern = Some(Box::new(hook));
        self
    }

    pub fn on_enforce<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn ManagedObject) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        self.enforce = Some(Box::new(hook));
        self
    }

    pub fn on_disregard<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn ManagedObject) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        self.disregard = Some(Box::new(hook));
        self
    }
}

impl Governance for GovernanceHooks {
    fn govern(&self, object: &dyn ManagedObject) -> Result<(), Escalation> {
        self.govern.as_ref().map_or(Ok(()), |hook| hook(object))
    }

    fn enforce(&self, object: &dyn ManagedObject) -> Result<(), Escalation> {
        self.enforce.as_ref().map_or(Ok(()), |hook| hook(object))
    }

    fn disregard(&self, object: &dyn ManagedObject) -> Result<(), Escalation> {
        self.disregard.as_ref().map_or(Ok(()), |hook| hook(object))
    }
}
