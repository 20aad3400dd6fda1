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

//! Kernel configuration

use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Name of the team every kernel registers, running jobs inline
pub const PASSIVE_TEAM: &str = "passive";

fn default_idle_timeout_ms() -> u64 {
    60_000
}

/// Built-in team implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamKind {
    Passive,
    Fixed {
        size: usize,
    },
    Cached {
        min: usize,
        max: usize,
        #[serde(default = "default_idle_timeout_ms")]
        idle_timeout_ms: u64,
    },
    WorkerPerJob,
    Tokio {
        worker_threads: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: TeamKind,
}

impl TeamConfig {
    pub fn new(name: impl Into<String>, kind: TeamKind) -> Self {
        Self { name: name.into(), kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// How often the asset manager checks for timed out assets
    pub asset_check_interval_ms: u64,
    /// Timeout for asynchronous flows and asynchronous sourcing without an explicit timeout
    pub default_asynchronous_timeout_ms: u64,
    /// Team for functions that do not name one
    pub default_team: String,
    pub teams: Vec<TeamConfig>,
    /// How long closing waits for each team to drain
    pub stop_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            asset_check_interval_ms: 100,
            default_asynchronous_timeout_ms: 10_000,
            default_team: PASSIVE_TEAM.to_string(),
            teams: Vec::new(),
            stop_timeout_ms: 5_000,
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(interval) = env_millis("DOTFLOW_ASSET_CHECK_INTERVAL_MS") {
            config.asset_check_interval_ms = interval;
        }

        if let Some(timeout) = env_millis("DOTFLOW_ASYNC_TIMEOUT_MS") {
            config.default_asynchronous_timeout_ms = timeout;
        }

        if let Ok(team) = std::env::var("DOTFLOW_DEFAULT_TEAM") {
            if team.trim().is_empty() {
                warn!("Ignoring empty DOTFLOW_DEFAULT_TEAM");
            } else {
                config.default_team = team;
            }
        }

        if let Some(timeout) = env_millis("DOTFLOW_STOP_TIMEOUT_MS") {
            config.stop_timeout_ms = timeout;
        }

        config
    }

    pub fn from_toml_str(source: &str) -> KernelResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.asset_check_interval_ms == 0 {
            return Err(KernelError::invalid_configuration("asset_check_interval_ms must be positive"));
        }
        for team in &self.teams {
            if team.name.trim().is_empty() {
                return Err(KernelError::invalid_configuration("team names must not be empty"));
            }
            if team.name == PASSIVE_TEAM {
                return Err(KernelError::DuplicateName {
                    kind: "team",
                    name: team.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Adds a team, replacing any configured team of the same name
    pub fn with_team(mut self, name: impl Into<String>, kind: TeamKind) -> Self {
        let team = TeamConfig::new(name, kind);
        self.teams.retain(|existing| existing.name != team.name);
        self.teams.push(team);
        self
    }

    pub fn with_default_team(mut self, name: impl Into<String>) -> Self {
        self.default_team = name.into();
        self
    }

    pub fn with_asset_check_interval(mut self, interval: Duration) -> Self {
        self.asset_check_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn with_default_asynchronous_timeout(mut self, timeout: Duration) -> Self {
        self.default_asynchronous_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn asset_check_interval(&self) -> Duration {
        Duration::from_millis(self.asset_check_interval_ms)
    }

    pub fn default_asynchronous_timeout(&self) -> Duration {
        Duration::from_millis(self.default_asynchronous_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn env_millis(key: &str) -> Option<u64> {
    let value = std::env::var(key).ok()?;
    match value.parse::<u64>() {
        Ok(millis) => Some(millis),
        Err(_) => {
            warn!("Invalid {key} '{value}', using default");
            None
        }
    }
}
