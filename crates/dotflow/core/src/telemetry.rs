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

//! Metric names emitted through the `metrics` facade.
//!
//! Nothing is recorded unless the embedding application installs a recorder.

/// Jobs handed to a team
pub const JOBS_ASSIGNED: &str = "dotflow_jobs_assigned";
/// Jobs refused by a team that stopped working
pub const JOBS_REJECTED: &str = "dotflow_jobs_rejected";
/// Managed function logic invocations
pub const FUNCTIONS_EXECUTED: &str = "dotflow_functions_executed";
pub const ESCALATIONS_HANDLED: &str = "dotflow_escalations_handled";
/// Escalations that reached the process level handler
pub const ESCALATIONS_UNHANDLED: &str = "dotflow_escalations_unhandled";
pub const CLEANUP_ESCALATIONS: &str = "dotflow_cleanup_escalations";
pub const ASSET_TIMEOUTS: &str = "dotflow_asset_timeouts";
pub const MANAGED_OBJECTS_LOADED: &str = "dotflow_managed_objects_loaded";
pub const MANAGED_OBJECTS_REUSED: &str = "dotflow_managed_objects_reused";
pub const MANAGED_OBJECTS_UNLOADED: &str = "dotflow_managed_objects_unloaded";
pub const PROCESSES_COMPLETED: &str = "dotflow_processes_completed";
/// Gauge of assets currently monitored for timeouts
pub const REGISTERED_ASSETS: &str = "dotflow_registered_assets";
