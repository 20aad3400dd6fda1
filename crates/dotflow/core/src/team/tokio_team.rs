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
use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Team owning a dedicated tokio runtime.
///
/// Function states block, so jobs go to the runtime's blocking pool. Threads
/// are named `{team}-worker`.
pub struct TokioTeam {
    id: TeamId,
    worker_threads: usize,
    stop_timeout: Duration,
    runtime: Mutex<Option<Runtime>>,
}

impl TokioTeam {
    pub fn new(id: TeamId, worker_threads: usize, stop_timeout: Duration) -> KernelResult<Self> {
        if worker_threads == 0 {
            return Err(KernelError::invalid_configuration(format!("team {} needs at least one worker thread", id.name())));
        }
        Ok(Self {
            id,
            worker_threads,
            stop_timeout,
            runtime: Mutex::new(None),
        })
    }
}

impl Team for TokioTeam {
    fn start_working(&self) -> KernelResult<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }
        let built = Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .max_blocking_threads(self.worker_threads)
            .thread_name(format!("{}-worker", self.id.name()))
            .enable_all()
            .build()
            .map_err(|err| KernelError::team_failure(self.id.name(), format!("failed to build runtime: {err}")))?;
        *runtime = Some(built);
        Ok(())
    }

    fn assign_job(&self, job: Job) -> Result<(), JobRejected> {
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(runtime) => {
                let id = self.id.clone();
                runtime.spawn_blocking(move || job.run(&id));
                Ok(())
            }
            None => Err(JobRejected::new(job, "team not working")),
        }
    }

    fn stop_working(&self) -> KernelResult<()> {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(self.stop_timeout);
        }
        Ok(())
    }
}
