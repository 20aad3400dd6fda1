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

//! Escalations: failures raised while a continuation chain executes.
//!
//! An [`Escalation`] is never returned to the code that invoked a process.
//! It travels up the chain of the thread that raised it until an
//! [`EscalationProcedure`] matches its [`EscalationKind`], falling back to the
//! office procedure and finally to the process level [`EscalationHandler`].

mod procedure;

pub use procedure::{
    EscalationFlow, EscalationFlowHandler, EscalationHandler, EscalationMatcher, EscalationProcedure, EscalationScope, LoggingEscalationHandler,
};

use std::any::Any;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// What timed out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// An asynchronous managed object source did not supply its object in time
    ManagedObjectSourcing,
    /// An asynchronous flow was not completed in time
    AsynchronousFlow,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::ManagedObjectSourcing => write!(f, "managed object sourcing"),
            TimeoutKind::AsynchronousFlow => write!(f, "asynchronous flow"),
        }
    }
}

/// Classification used to match escalations against handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EscalationKind {
    /// Raised by function logic, named by the application
    Application(Cow<'static, str>),
    /// A managed object source reported a failure
    ManagedObjectSource,
    Timeout(TimeoutKind),
    /// A pre or post administration hook failed
    Administration,
    /// A governance hook failed
    Governance,
    /// Function logic panicked
    Panic,
    /// A team refused a job because it is no longer working
    TeamRejected,
    /// Access to something the function never declared
    InvalidAccess,
    Cancelled,
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationKind::Application(name) => write!(f, "application({name})"),
            EscalationKind::ManagedObjectSource => write!(f, "managed object source"),
            EscalationKind::Timeout(kind) => write!(f, "timeout({kind})"),
            EscalationKind::Administration => write!(f, "administration"),
            EscalationKind::Governance => write!(f, "governance"),
            EscalationKind::Panic => write!(f, "panic"),
            EscalationKind::TeamRejected => write!(f, "team rejected"),
            EscalationKind::InvalidAccess => write!(f, "invalid access"),
            EscalationKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failure travelling through a continuation chain.
///
/// Cheap to clone: the optional underlying error is shared.
#[derive(Clone)]
pub struct Escalation {
    kind: EscalationKind,
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl Escalation {
    pub fn new(kind: EscalationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Application escalation matched by `name`
    pub fn application(name: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(EscalationKind::Application(name.into()), message)
    }

    pub fn timeout(kind: TimeoutKind, message: impl Into<String>) -> Self {
        Self::new(EscalationKind::Timeout(kind), message)
    }

    /// Wraps an arbitrary error, keeping it reachable through `source()`
    pub fn with_source<E>(kind: EscalationKind, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            message: source.to_string(),
            source: Some(Arc::new(source)),
        }
    }

    /// Converts a caught panic payload
    pub fn panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "function panicked".to_string()
        };
        Self::new(EscalationKind::Panic, message)
    }

    pub fn kind(&self) -> &EscalationKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, EscalationKind::Timeout(_))
    }
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalation")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} escalation: {}", self.kind, self.message)
    }
}

impl StdError for Escalation {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<anyhow::Error> for Escalation {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let source: Box<dyn StdError + Send + Sync + 'static> = err.into();
        Self {
            kind: EscalationKind::Application(Cow::Borrowed("anyhow")),
            message,
            source: Some(Arc::from(source)),
        }
    }
}

/// An escalation raised while cleaning up a managed object.
///
/// Cleanup escalations are never propagated up a chain. They are handed to
/// the recycle functions of the objects unloaded after the failing one and
/// are reported on the process outcome.
#[derive(Debug, Clone)]
pub struct CleanupEscalation {
    object_name: String,
    escalation: Escalation,
}

impl CleanupEscalation {
    pub fn new(object_name: impl Into<String>, escalation: Escalation) -> Self {
        Self {
            object_name: object_name.into(),
            escalation,
        }
    }

    /// Name of the managed object whose cleanup failed
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn escalation(&self) -> &Escalation {
        &self.escalation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_panic_payloads() {
        let escalation = Escalation::panic(Box::new("boom"));
        assert_eq!(escalation.kind(), &EscalationKind::Panic);
        assert_eq!(escalation.message(), "boom");

        let escalation = Escalation::panic(Box::new(String::from("owned boom")));
        assert_eq!(escalation.message(), "owned boom");

        let escalation = Escalation::panic(Box::new(42_u32));
        assert_eq!(escalation.message(), "function panicked");
    }

    #[test]
    fn test_source_is_preserved() {
        let escalation = Escalation::with_source(EscalationKind::ManagedObjectSource, io::Error::other("connection refused"));
        assert_eq!(escalation.message(), "connection refused");
        assert!(escalation.source().is_some());
        assert!(!escalation.is_timeout());
    }

    #[test]
    fn test_from_anyhow() {
        let escalation: Escalation = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(escalation.kind(), &EscalationKind::Application(Cow::Borrowed("anyhow")));
        assert_eq!(escalation.message(), "outer: inner");
        assert!(escalation.source().is_some());
    }

    #[test]
    fn test_display() {
        let escalation = Escalation::timeout(TimeoutKind::AsynchronousFlow, "not completed within 10ms");
        assert!(escalation.is_timeout());
        assert_eq!(escalation.to_string(), "timeout(asynchronous flow) escalation: not completed within 10ms");
    }
}
