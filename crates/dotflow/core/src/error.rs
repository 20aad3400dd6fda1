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

//! Kernel-level errors.
//!
//! These are returned from configuration, lifecycle and asynchronous flow
//! operations. Failures raised while a continuation chain executes are
//! [`Escalation`](crate::escalation::Escalation)s instead and are routed
//! through the escalation procedures, never returned to a caller.

use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Unknown team: {name}")]
    UnknownTeam { name: String },

    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Team {team} failed: {message}")]
    TeamFailure { team: String, message: String },

    #[error("Managed object source {name} failed: {message}")]
    ManagedObjectSource { name: String, message: String },

    #[error("Kernel is not open")]
    NotOpen,

    #[error("Kernel is already open")]
    AlreadyOpen,

    #[error("Asynchronous flow already completed")]
    AsynchronousFlowAlreadyCompleted,

    #[error("Asynchronous flow timed out before completion")]
    AsynchronousFlowTimedOut,
}

impl KernelError {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration { message: message.into() }
    }

    pub fn team_failure(team: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TeamFailure {
            team: team.into(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for KernelError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = KernelError::UnknownFunction { name: "servicing".into() };
        assert_eq!(err.to_string(), "Unknown function: servicing");

        let err = KernelError::team_failure("io", "worker spawn failed");
        assert_eq!(err.to_string(), "Team io failed: worker spawn failed");

        let err = KernelError::DuplicateName { kind: "team", name: "io".into() };
        assert_eq!(err.to_string(), "Duplicate team name: io");
    }

    #[test]
    fn test_toml_error_conversion() {
        let err: KernelError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert!(matches!(err, KernelError::InvalidConfiguration { .. }));
    }
}
