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

//! Teams: named worker pools that execute jobs.
//!
//! A [`Job`] carries the remainder of a continuation chain. Whichever team
//! receives it runs the function loop until the chain completes, parks on an
//! asset, or reaches a state owned by another team.

mod executor;
mod passive;
mod tokio_team;
mod worker_per_job;

pub use executor::ExecutorTeam;
pub use passive::PassiveTeam;
pub use tokio_team::TokioTeam;
pub use worker_per_job::WorkerPerJobTeam;

use crate::config::TeamKind;
use crate::error::{KernelError, KernelResult};
use crate::escalation::{Escalation, EscalationKind};
use crate::function::BoxedFunctionState;
use crate::telemetry;
use crate::thread::{self, ThreadState};
use dashmap::DashMap;
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_TEAM_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Identity of a team instance.
///
/// Two kernels registering a team under the same name still get distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TeamId {
    name: Arc<str>,
    serial: u64,
}

impl TeamId {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            serial: NEXT_TEAM_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.serial)
    }
}

/// Remainder of a continuation chain handed to a team.
///
/// A job dropped without being run or abandoned (a team shut down with work
/// still queued) is abandoned on drop, so its thread still completes.
pub struct Job {
    chain: Option<BoxedFunctionState>,
    thread: Arc<ThreadState>,
    assigned_at: Instant,
}

impl Job {
    pub fn new(chain: BoxedFunctionState) -> Self {
        Self {
            thread: Arc::clone(chain.thread_state()),
            chain: Some(chain),
            assigned_at: Instant::now(),
        }
    }

    /// Name of the first state the job will execute
    pub fn name(&self) -> &str {
        self.chain.as_ref().map_or("", |chain| chain.name())
    }

    pub fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    /// Time the job has waited since assignment
    pub fn queued_for(&self) -> Duration {
        self.assigned_at.elapsed()
    }

    /// Runs the function loop on the calling worker of team `team`
    pub fn run(mut self, team: &TeamId) {
        let queued = self.queued_for();
        if let Some(chain) = self.chain.take() {
            debug!(team = %team, function = chain.name(), queued = ?queued, "running job");
            thread::run_function_loop(chain, Some(team.clone()));
        }
    }

    /// Unwinds the chain of a job that will never run.
    ///
    /// The escalation goes through the thread's procedures like any other and
    /// the resulting cleanup runs on the calling thread.
    pub fn abandon(mut self, reason: impl Into<String>) {
        if let Some(chain) = self.chain.take() {
            thread::abandon_chain(chain, Escalation::new(EscalationKind::TeamRejected, reason));
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(chain) = self.chain.take() {
            warn!(function = chain.name(), thread = self.thread.id(), "job dropped before it ran");
            thread::abandon_chain(chain, Escalation::new(EscalationKind::TeamRejected, "job dropped before it ran"));
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("function", &self.name())
            .field("thread", &self.thread_state().id())
            .finish()
    }
}

/// A job the team refused, handed back to the caller.
pub struct JobRejected {
    pub job: Job,
    pub reason: String,
}

impl JobRejected {
    pub fn new(job: Job, reason: impl Into<String>) -> Self {
        Self { job, reason: reason.into() }
    }
}

impl fmt::Debug for JobRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRejected").field("job", &self.job).field("reason", &self.reason).finish()
    }
}

/// A pool of workers executing jobs.
pub trait Team: Send + Sync + 'static {
    fn start_working(&self) -> KernelResult<()>;

    /// Queues `job`, or hands it back once the team has stopped
    fn assign_job(&self, job: Job) -> Result<(), JobRejected>;

    /// Drains queued jobs and halts the workers
    fn stop_working(&self) -> KernelResult<()>;
}

/// A team together with its identity.
#[derive(Clone)]
pub struct TeamManagement {
    id: TeamId,
    team: Arc<dyn Team>,
}

impl TeamManagement {
    pub fn new(id: TeamId, team: Arc<dyn Team>) -> Self {
        Self { id, team }
    }

    pub fn id(&self) -> &TeamId {
        &self.id
    }

    pub fn team(&self) -> &Arc<dyn Team> {
        &self.team
    }

    /// Assigns `job`, unwinding it on the calling thread if the team refuses it
    pub fn assign(&self, job: Job) {
        counter!(telemetry::JOBS_ASSIGNED, 1);
        if let Err(rejected) = self.team.assign_job(job) {
            counter!(telemetry::JOBS_REJECTED, 1);
            warn!(team = %self.id, function = rejected.job.name(), reason = %rejected.reason, "job rejected");
            rejected.job.abandon(format!("team {} rejected job: {}", self.id.name(), rejected.reason));
        }
    }
}

impl fmt::Debug for TeamManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamManagement").field("id", &self.id).finish()
    }
}

/// Inputs available while creating a team.
#[derive(Debug, Clone)]
pub struct TeamSourceContext {
    team_id: TeamId,
    stop_timeout: Duration,
}

impl TeamSourceContext {
    pub fn new(team_id: TeamId, stop_timeout: Duration) -> Self {
        Self { team_id, stop_timeout }
    }

    pub fn team_id(&self) -> &TeamId {
        &self.team_id
    }

    pub fn team_name(&self) -> &str {
        self.team_id.name()
    }

    /// How long `stop_working` may wait for workers to drain
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }
}

/// Factory for a team.
pub trait TeamSource: Send + Sync + 'static {
    fn create_team(&self, context: &TeamSourceContext) -> KernelResult<Arc<dyn Team>>;
}

impl TeamSource for TeamKind {
    fn create_team(&self, context: &TeamSourceContext) -> KernelResult<Arc<dyn Team>> {
        let id = context.team_id().clone();
        let stop_timeout = context.stop_timeout();
        let team: Arc<dyn Team> = match *self {
            TeamKind::Passive => Arc::new(PassiveTeam::new(id)),
            TeamKind::Fixed { size } => Arc::new(ExecutorTeam::fixed(id, size, stop_timeout)?),
            TeamKind::Cached { min, max, idle_timeout_ms } => {
                Arc::new(ExecutorTeam::cached(id, min, max, Duration::from_millis(idle_timeout_ms), stop_timeout)?)
            }
            TeamKind::WorkerPerJob => Arc::new(WorkerPerJobTeam::new(id, stop_timeout)),
            TeamKind::Tokio { worker_threads } => Arc::new(TokioTeam::new(id, worker_threads, stop_timeout)?),
        };
        Ok(team)
    }
}

/// Teams of one kernel, by name.
#[derive(Default)]
pub struct TeamRegistry {
    teams: DashMap<String, TeamManagement>,
}

impl TeamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a team from `source` and registers it under `name`
    pub fn create(&self, name: &str, source: &dyn TeamSource, stop_timeout: Duration) -> KernelResult<TeamManagement> {
        if self.teams.contains_key(name) {
            return Err(KernelError::DuplicateName { kind: "team", name: name.to_string() });
        }
        let context = TeamSourceContext::new(TeamId::new(name), stop_timeout);
        let team = source.create_team(&context)?;
        let management = TeamManagement::new(context.team_id, team);
        self.teams.insert(name.to_string(), management.clone());
        debug!(team = name, "team registered");
        Ok(management)
    }

    pub fn get(&self, name: &str) -> Option<TeamManagement> {
        self.teams.get(name).map(|entry| entry.value().clone())
    }

    pub fn require(&self, name: &str) -> KernelResult<TeamManagement> {
        self.get(name).ok_or_else(|| KernelError::UnknownTeam { name: name.to_string() })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.teams.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    fn snapshot(&self) -> Vec<TeamManagement> {
        self.teams.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn start_all(&self) -> KernelResult<()> {
        for management in self.snapshot() {
            management.team().start_working()?;
            info!(team = %management.id(), "team started");
        }
        Ok(())
    }

    /// Stops every team, returning the first failure once all were asked to stop
    pub fn stop_all(&self) -> KernelResult<()> {
        let mut first_error = None;
        for management in self.snapshot() {
            match management.team().stop_working() {
                Ok(()) => info!(team = %management.id(), "team stopped"),
                Err(err) => {
                    warn!(team = %management.id(), error = %err, "team did not stop cleanly");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Recorder, detached_thread};

    #[test]
    fn test_team_ids_are_unique_per_instance() {
        let a = TeamId::new("io");
        let b = TeamId::new("io");
        assert_eq!(a.name(), b.name());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = TeamRegistry::new();
        registry.create("io", &TeamKind::Passive, Duration::from_secs(1)).unwrap();

        let err = registry.create("io", &TeamKind::Passive, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, KernelError::DuplicateName { kind: "team", name: "io".into() });
        assert!(matches!(registry.require("cpu"), Err(KernelError::UnknownTeam { .. })));
        assert_eq!(registry.names(), vec!["io".to_string()]);
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = TeamRegistry::new();
        registry.create("passive", &TeamKind::Passive, Duration::from_secs(1)).unwrap();
        registry.create("pool", &TeamKind::Fixed { size: 2 }, Duration::from_secs(1)).unwrap();
        assert_eq!(registry.len(), 2);

        registry.start_all().unwrap();
        registry.stop_all().unwrap();
    }

    #[test]
    fn test_dropped_job_is_abandoned() {
        let thread = detached_thread();
        let recorder = Recorder::default();

        let job = Job::new(recorder.cancellable_state(&thread, "orphan"));
        assert_eq!(job.name(), "orphan");
        drop(job);

        assert_eq!(recorder.entries(), vec!["cancel:orphan", "cleanup:orphan"]);
        assert!(thread.is_failed());
    }

    #[test]
    fn test_run_job_is_not_abandoned_on_drop() {
        let thread = detached_thread();
        let recorder = Recorder::default();

        Job::new(recorder.cancellable_state(&thread, "ran")).run(&TeamId::new("cpu"));

        assert_eq!(recorder.entries(), vec!["ran"]);
        assert!(!thread.is_failed());
    }
}
