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
use crate::error::KernelResult;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs every job inline on the thread assigning it.
#[derive(Debug)]
pub struct PassiveTeam {
    id: TeamId,
    stopped: AtomicBool,
}

impl PassiveTeam {
    pub fn new(id: TeamId) -> Self {
        Self {
            id,
            stopped: AtomicBool::new(false),
        }
    }
}

impl Team for PassiveTeam {
    fn start_working(&self) -> KernelResult<()> {
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    fn assign_job(&self, job: Job) -> Result<(), JobRejected> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(JobRejected::new(job, "team stopped"));
        }
        job.run(&self.id);
        Ok(())
    }

    fn stop_working(&self) -> KernelResult<()> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }
}
