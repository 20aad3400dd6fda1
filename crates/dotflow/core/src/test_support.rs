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

//! Shared fixtures for unit tests.

use crate::asset::AssetManager;
use crate::escalation::LoggingEscalationHandler;
use crate::function::{BoxedFunctionState, ClosureFunctionState};
use crate::managed_object::{ManagedObjectMetaData, ManagedObjectScope, ManagedObjectSource, SourcingMode};
use crate::office::OfficeMetaData;
use crate::team::{PassiveTeam, TeamId, TeamManagement};
use crate::thread::{ProcessState, ThreadState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ordered log shared between test states.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub(crate) fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// State recording `name` when executed
    pub(crate) fn state(&self, thread: &Arc<ThreadState>, name: &str) -> BoxedFunctionState {
        let log = self.clone();
        let entry = name.to_string();
        ClosureFunctionState::new(name.to_string(), thread, move |_| {
            log.record(entry);
            Ok(None)
        })
        .boxed()
    }

    /// State recording `cancel:name` when cancelled, whose cleanup records `cleanup:name`
    pub(crate) fn cancellable_state(&self, thread: &Arc<ThreadState>, name: &str) -> BoxedFunctionState {
        let log = self.clone();
        let cancel_log = self.clone();
        let cleanup_thread = Arc::clone(thread);
        let entry = name.to_string();
        let cancelled = name.to_string();
        ClosureFunctionState::new(name.to_string(), thread, move |_| {
            log.record(entry);
            Ok(None)
        })
        .on_cancel(move || {
            cancel_log.record(format!("cancel:{cancelled}"));
            Some(cancel_log.state(&cleanup_thread, &format!("cleanup:{cancelled}")))
        })
        .boxed()
    }

    /// State recording `name@<worker thread name>`
    pub(crate) fn thread_name_state(&self, thread: &Arc<ThreadState>, name: &str) -> BoxedFunctionState {
        let log = self.clone();
        let entry = name.to_string();
        ClosureFunctionState::new(name.to_string(), thread, move |_| {
            let worker = std::thread::current().name().map(str::to_string).unwrap_or_default();
            log.record(format!("{entry}@{worker}"));
            Ok(None)
        })
        .boxed()
    }

    /// State sleeping for `duration` before recording `name`
    pub(crate) fn sleeping_state(&self, thread: &Arc<ThreadState>, name: &str, duration: Duration) -> BoxedFunctionState {
        let log = self.clone();
        let entry = name.to_string();
        ClosureFunctionState::new(name.to_string(), thread, move |_| {
            std::thread::sleep(duration);
            log.record(entry);
            Ok(None)
        })
        .boxed()
    }
}

/// Process over an empty office, defaulting to a passive team
pub(crate) fn detached_process() -> Arc<ProcessState> {
    let team_id = TeamId::new("passive");
    let team = TeamManagement::new(team_id.clone(), Arc::new(PassiveTeam::new(team_id)));
    ProcessState::new(
        Arc::new(OfficeMetaData::empty()),
        team,
        Arc::new(AssetManager::new(Duration::from_millis(10))),
        Arc::new(LoggingEscalationHandler),
    )
}

pub(crate) fn detached_thread() -> Arc<ThreadState> {
    ThreadState::new(detached_process())
}

/// Polls `condition` until it holds or `timeout` passes
pub(crate) fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Synchronous thread scoped object at index 0, adjusted by `configure`
pub(crate) fn object_meta(
    name: &str,
    source: Arc<dyn ManagedObjectSource>,
    configure: impl FnOnce(&mut ManagedObjectMetaData),
) -> Arc<ManagedObjectMetaData> {
    let mut meta = ManagedObjectMetaData {
        name: name.to_string(),
        scope: ManagedObjectScope::Thread,
        index: 0,
        source,
        sourcing: SourcingMode::Synchronous,
        pool: None,
        recycle: None,
        recycle_team: None,
        pre_administration: Vec::new(),
        post_administration: Vec::new(),
        governance: Vec::new(),
    };
    configure(&mut meta);
    Arc::new(meta)
}
