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

//! Thread pool team backed by a shared injector queue.
//!
//! Workers are named `{team}-{n}`. A fixed team keeps exactly `min` workers;
//! a cached team grows up to `max` while jobs wait and retires workers above
//! `min` once they have been idle for the idle timeout.

use super::{Job, JobRejected, Team, TeamId};
use crate::error::{KernelError, KernelResult};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Working,
    Stopping,
    Stopped,
}

struct ExecutorInner {
    id: TeamId,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Option<Duration>,
    stop_timeout: Duration,
    queue: Injector<Job>,
    pending: AtomicUsize,
    active_workers: AtomicUsize,
    busy_workers: AtomicUsize,
    next_worker: AtomicUsize,
    state: Mutex<RunState>,
    signal: Condvar,
}

impl ExecutorInner {
    fn notify_one(&self) {
        let _state = self.state.lock();
        self.signal.notify_one();
    }

    /// Decrements the worker count unless that would drop below `min`
    fn try_retire(&self) -> bool {
        self.active_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| (active > self.min_workers).then(|| active - 1))
            .is_ok()
    }
}

/// Thread pool team.
pub struct ExecutorTeam {
    inner: Arc<ExecutorInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorTeam {
    /// Team with exactly `size` workers
    pub fn fixed(id: TeamId, size: usize, stop_timeout: Duration) -> KernelResult<Self> {
        if size == 0 {
            return Err(KernelError::invalid_configuration(format!("team {} needs at least one worker", id.name())));
        }
        Ok(Self::with_bounds(id, size, size, None, stop_timeout))
    }

    /// Team growing from `min` to `max` workers, retiring idle workers above `min`
    pub fn cached(id: TeamId, min: usize, max: usize, idle_timeout: Duration, stop_timeout: Duration) -> KernelResult<Self> {
        if max == 0 || min > max {
            return Err(KernelError::invalid_configuration(format!("team {} has invalid worker bounds {min}..{max}", id.name())));
        }
        Ok(Self::with_bounds(id, min, max, Some(idle_timeout), stop_timeout))
    }

    fn with_bounds(id: TeamId, min_workers: usize, max_workers: usize, idle_timeout: Option<Duration>, stop_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                id,
                min_workers,
                max_workers,
                idle_timeout,
                stop_timeout,
                queue: Injector::new(),
                pending: AtomicUsize::new(0),
                active_workers: AtomicUsize::new(0),
                busy_workers: AtomicUsize::new(0),
                next_worker: AtomicUsize::new(0),
                state: Mutex::new(RunState::Idle),
                signal: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::Acquire)
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    fn spawn_worker(&self) -> KernelResult<()> {
        self.inner.active_workers.fetch_add(1, Ordering::AcqRel);
        self.launch_worker()
    }

    /// Starts a worker for a slot already counted in `active_workers`
    fn launch_worker(&self) -> KernelResult<()> {
        let inner = Arc::clone(&self.inner);
        let number = inner.next_worker.fetch_add(1, Ordering::Relaxed);

        let name = format!("{}-{}", inner.id.name(), number);
        let worker_inner = Arc::clone(&inner);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || worker_loop(&worker_inner));
        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
                debug!(team = %inner.id, worker = %name, "worker spawned");
                Ok(())
            }
            Err(err) => {
                inner.active_workers.fetch_sub(1, Ordering::AcqRel);
                Err(KernelError::team_failure(inner.id.name(), format!("failed to spawn worker {name}: {err}")))
            }
        }
    }

    /// Adds a worker when every current worker is busy and the bound allows
    fn maybe_spawn_worker(&self) {
        let max_workers = self.inner.max_workers;
        let reserved = self.inner.active_workers.fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
            let busy = self.inner.busy_workers.load(Ordering::Acquire);
            let pending = self.inner.pending.load(Ordering::Acquire);
            (active < max_workers && (active == 0 || busy + pending > active)).then(|| active + 1)
        });
        if reserved.is_ok() {
            if let Err(err) = self.launch_worker() {
                warn!(team = %self.inner.id, error = %err, "could not grow team");
            }
        }
    }

    /// Abandons whatever is still queued once no worker will take it
    fn abandon_queued(&self) {
        loop {
            match self.inner.queue.steal() {
                Steal::Success(job) => {
                    self.inner.pending.fetch_sub(1, Ordering::AcqRel);
                    warn!(team = %self.inner.id, function = job.name(), "abandoning queued job");
                    job.abandon(format!("team {} stopped before running the job", self.inner.id.name()));
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }
}

impl Team for ExecutorTeam {
    fn start_working(&self) -> KernelResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == RunState::Working {
                return Ok(());
            }
            *state = RunState::Working;
        }
        while self.active_workers() < self.inner.min_workers {
            self.spawn_worker()?;
        }
        if self.pending_jobs() > 0 {
            self.maybe_spawn_worker();
            self.inner.notify_one();
        }
        Ok(())
    }

    fn assign_job(&self, job: Job) -> Result<(), JobRejected> {
        // Workers only exit after seeing an empty queue under this lock
        let state = {
            let state = self.inner.state.lock();
            if matches!(*state, RunState::Stopping | RunState::Stopped) {
                return Err(JobRejected::new(job, "team stopped"));
            }
            self.inner.pending.fetch_add(1, Ordering::AcqRel);
            self.inner.queue.push(job);
            *state
        };

        if state == RunState::Working {
            self.maybe_spawn_worker();
            self.inner.notify_one();
        }
        Ok(())
    }

    /// Lets workers drain the queue, then joins them within the stop timeout.
    ///
    /// Jobs no worker picked up (a team never started, or one that never grew
    /// a worker) are abandoned before the team reports stopped.
    fn stop_working(&self) -> KernelResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == RunState::Stopped {
                return Ok(());
            }
            *state = RunState::Stopping;
            self.inner.signal.notify_all();
        }

        let deadline = Instant::now() + self.inner.stop_timeout;
        while self.active_workers() > 0 {
            if Instant::now() >= deadline {
                return Err(KernelError::team_failure(
                    self.inner.id.name(),
                    format!("{} workers still busy after {:?}", self.active_workers(), self.inner.stop_timeout),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!(team = %self.inner.id, "worker panicked");
            }
        }
        *self.inner.state.lock() = RunState::Stopped;
        self.abandon_queued();
        Ok(())
    }
}

impl Drop for ExecutorTeam {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            if *state != RunState::Stopped {
                *state = RunState::Stopping;
                self.inner.signal.notify_all();
            }
        }
        if self.inner.active_workers.load(Ordering::Acquire) == 0 {
            self.abandon_queued();
        }
    }
}

fn worker_loop(inner: &ExecutorInner) {
    loop {
        match inner.queue.steal() {
            Steal::Success(job) => {
                inner.pending.fetch_sub(1, Ordering::AcqRel);
                inner.busy_workers.fetch_add(1, Ordering::AcqRel);
                job.run(&inner.id);
                inner.busy_workers.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            Steal::Retry => continue,
            Steal::Empty => {}
        }

        let mut state = inner.state.lock();
        if !inner.queue.is_empty() {
            continue;
        }
        if matches!(*state, RunState::Stopping | RunState::Stopped) {
            break;
        }

        match inner.idle_timeout {
            Some(idle_timeout) if inner.active_workers.load(Ordering::Acquire) > inner.min_workers => {
                let timed_out = inner.signal.wait_for(&mut state, idle_timeout).timed_out();
                if timed_out && inner.queue.is_empty() && *state == RunState::Working && inner.try_retire() {
                    debug!(team = %inner.id, "idle worker retired");
                    return;
                }
            }
            _ => inner.signal.wait(&mut state),
        }
    }
    inner.active_workers.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Recorder, detached_thread, wait_until};

    #[test]
    fn test_fixed_team_runs_on_named_workers() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let team = ExecutorTeam::fixed(TeamId::new("cpu"), 2, Duration::from_secs(5)).unwrap();
        team.start_working().unwrap();
        assert_eq!(team.active_workers(), 2);

        for index in 0..8 {
            team.assign_job(Job::new(recorder.thread_name_state(&thread, &format!("job{index}")))).unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || recorder.entries().len() == 8));
        team.stop_working().unwrap();

        for entry in recorder.entries() {
            let worker = entry.split('@').nth(1).unwrap();
            assert!(worker.starts_with("cpu-"), "job ran on {worker}");
        }
        assert_eq!(team.active_workers(), 0);
    }

    #[test]
    fn test_cached_team_grows_and_retires() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let team = ExecutorTeam::cached(TeamId::new("io"), 0, 4, Duration::from_millis(20), Duration::from_secs(5)).unwrap();
        team.start_working().unwrap();
        assert_eq!(team.active_workers(), 0);

        for index in 0..4 {
            team.assign_job(Job::new(recorder.sleeping_state(&thread, &format!("slow{index}"), Duration::from_millis(50)))).unwrap();
        }
        assert!(team.active_workers() >= 1);
        assert!(wait_until(Duration::from_secs(5), || recorder.entries().len() == 4));
        assert!(wait_until(Duration::from_secs(5), || team.active_workers() == 0));
        team.stop_working().unwrap();
    }

    #[test]
    fn test_jobs_queued_before_start_run_once_started() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let team = ExecutorTeam::fixed(TeamId::new("late"), 1, Duration::from_secs(5)).unwrap();

        team.assign_job(Job::new(recorder.state(&thread, "queued"))).unwrap();
        assert_eq!(team.pending_jobs(), 1);
        team.start_working().unwrap();

        assert!(wait_until(Duration::from_secs(5), || recorder.entries().len() == 1));
        team.stop_working().unwrap();
    }

    #[test]
    fn test_stop_drains_then_rejects() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let team = ExecutorTeam::fixed(TeamId::new("drain"), 1, Duration::from_secs(5)).unwrap();
        team.start_working().unwrap();

        for index in 0..5 {
            team.assign_job(Job::new(recorder.state(&thread, &format!("job{index}")))).unwrap();
        }
        team.stop_working().unwrap();
        assert_eq!(recorder.entries().len(), 5);

        let rejected = team.assign_job(Job::new(recorder.state(&thread, "after"))).unwrap_err();
        assert_eq!(rejected.reason, "team stopped");
    }

    #[test]
    fn test_assign_racing_stop_runs_or_abandons_every_job() {
        let thread = detached_thread();
        for round in 0..50 {
            let recorder = Recorder::default();
            let team = Arc::new(ExecutorTeam::cached(TeamId::new("race"), 0, 2, Duration::from_secs(5), Duration::from_secs(5)).unwrap());
            team.start_working().unwrap();

            let assigner = {
                let team = Arc::clone(&team);
                let recorder = recorder.clone();
                let thread = Arc::clone(&thread);
                std::thread::spawn(move || {
                    let mut rejected = 0;
                    for index in 0..20 {
                        let job = Job::new(recorder.cancellable_state(&thread, &format!("job{index}")));
                        if let Err(refused) = team.assign_job(job) {
                            refused.job.abandon("refused");
                            rejected += 1;
                        }
                    }
                    rejected
                })
            };
            team.stop_working().unwrap();
            let rejected = assigner.join().unwrap();

            let resolved = |entries: &[String], index: usize| {
                entries.contains(&format!("job{index}")) || entries.contains(&format!("cleanup:job{index}"))
            };
            assert!(wait_until(Duration::from_secs(5), || {
                let entries = recorder.entries();
                (0..20).all(|index| resolved(&entries, index))
            }));
            let entries = recorder.entries();
            for index in 0..20 {
                let ran = entries.contains(&format!("job{index}"));
                let abandoned = entries.contains(&format!("cleanup:job{index}"));
                assert!(ran ^ abandoned, "round {round}: job{index} ran={ran} abandoned={abandoned}");
            }
            assert!(entries.iter().filter(|entry| entry.starts_with("cleanup:")).count() >= rejected);
            assert_eq!(team.pending_jobs(), 0);
        }
    }

    #[test]
    fn test_concurrent_assign_respects_max_workers() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let team = Arc::new(ExecutorTeam::cached(TeamId::new("bounded"), 0, 2, Duration::from_secs(5), Duration::from_secs(5)).unwrap());
        team.start_working().unwrap();

        let assigners: Vec<_> = (0..8)
            .map(|assigner| {
                let team = Arc::clone(&team);
                let recorder = recorder.clone();
                let thread = Arc::clone(&thread);
                std::thread::spawn(move || {
                    for index in 0..4 {
                        let name = format!("job{assigner}-{index}");
                        team.assign_job(Job::new(recorder.sleeping_state(&thread, &name, Duration::from_millis(5)))).unwrap();
                        assert!(team.active_workers() <= 2);
                    }
                })
            })
            .collect();
        for assigner in assigners {
            assigner.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(10), || recorder.entries().len() == 32));
        assert!(team.active_workers() <= 2);
        assert!(team.inner.next_worker.load(Ordering::Relaxed) <= 2);
        team.stop_working().unwrap();
    }

    #[test]
    fn test_stop_before_start_abandons_queued_jobs() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let team = ExecutorTeam::fixed(TeamId::new("never"), 1, Duration::from_secs(5)).unwrap();

        team.assign_job(Job::new(recorder.cancellable_state(&thread, "queued"))).unwrap();
        team.stop_working().unwrap();

        assert_eq!(recorder.entries(), vec!["cancel:queued", "cleanup:queued"]);
        assert_eq!(team.pending_jobs(), 0);
    }

    #[test]
    fn test_dropping_unstarted_team_abandons_queued_jobs() {
        let thread = detached_thread();
        let recorder = Recorder::default();
        let team = ExecutorTeam::fixed(TeamId::new("dropped"), 1, Duration::from_secs(5)).unwrap();

        team.assign_job(Job::new(recorder.cancellable_state(&thread, "queued"))).unwrap();
        drop(team);

        assert_eq!(recorder.entries(), vec!["cancel:queued", "cleanup:queued"]);
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(ExecutorTeam::fixed(TeamId::new("zero"), 0, Duration::from_secs(1)).is_err());
        assert!(ExecutorTeam::cached(TeamId::new("inverted"), 3, 2, Duration::from_secs(1), Duration::from_secs(1)).is_err());
    }
}
