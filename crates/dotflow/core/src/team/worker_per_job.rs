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

use super::{Job, JobRejected, Team, TeamId};
use crate::error::{KernelError, KernelResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Spawns a dedicated thread for every job.
pub struct WorkerPerJobTeam {
    id: TeamId,
    stop_timeout: Duration,
    stopped: AtomicBool,
    running: Arc<AtomicUsize>,
    spawned: AtomicUsize,
}

impl WorkerPerJobTeam {
    pub fn new(id: TeamId, stop_timeout: Duration) -> Self {
        Self {
            id,
            stop_timeout,
            stopped: AtomicBool::new(false),
            running: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn running_jobs(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }
}

impl Team for WorkerPerJobTeam {
    fn start_working(&self) -> KernelResult<()> {
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    fn assign_job(&self, job: Job) -> Result<(), JobRejected> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(JobRejected::new(job, "team stopped"));
        }

        let number = self.spawned.fetch_add(1, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let id = self.id.clone();
        running.fetch_add(1, Ordering::AcqRel);

        // The job comes back through the channel if the thread never starts
        let (tx, rx) = std::sync::mpsc::channel::<Job>();
        let spawned = thread::Builder::new().name(format!("{}-job-{number}", self.id.name())).spawn(move || {
            if let Ok(job) = rx.recv() {
                job.run(&id);
            }
            running.fetch_sub(1, Ordering::AcqRel);
        });
        match spawned {
            Ok(_) => match tx.send(job) {
                Ok(()) => Ok(()),
                Err(returned) => Err(JobRejected::new(returned.0, "job thread exited before receiving its job")),
            },
            Err(err) => {
                self.running.fetch_sub(1, Ordering::AcqRel);
                Err(JobRejected::new(job, format!("failed to spawn job thread: {err}")))
            }
        }
    }

    fn stop_working(&self) -> KernelResult<()> {
        self.stopped.store(true, Ordering::Release);
        let deadline = Instant::now() + self.stop_timeout;
        while self.running_jobs() > 0 {
            if Instant::now() >= deadline {
                return Err(KernelError::team_failure(self.id.name(), format!("{} jobs still running", self.running_jobs())));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}
