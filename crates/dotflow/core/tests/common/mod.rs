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

#![allow(dead_code)]

use dotflow_core::managed_object::{ManagedObject, ManagedObjectSource, ManagedObjectUser, UnloadReason};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Ordered log shared between functions, sources and the test body.
#[derive(Clone, Default)]
pub struct Log {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Log {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.lock().iter().any(|existing| existing == entry)
    }

    /// Records `entry@<current worker thread name>`
    pub fn record_worker(&self, entry: &str) {
        let worker = std::thread::current().name().map(str::to_string).unwrap_or_default();
        self.record(format!("{entry}@{worker}"));
    }
}

/// Object that logs its unload reason.
pub struct Tracked {
    pub label: String,
    log: Log,
}

impl Tracked {
    pub fn new(label: &str, log: &Log) -> Self {
        Self {
            label: label.to_string(),
            log: log.clone(),
        }
    }
}

impl ManagedObject for Tracked {
    fn object(&self) -> &(dyn Any + Send + Sync) {
        &self.label
    }

    fn unload(&self, reason: UnloadReason) {
        self.log.record(format!("unload:{}:{reason:?}", self.label));
    }
}

/// Synchronous source of [`Tracked`] objects, counting how often it is asked.
pub struct TrackedSource {
    label: String,
    log: Log,
    sourced: AtomicUsize,
}

impl TrackedSource {
    pub fn new(label: &str, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            log: log.clone(),
            sourced: AtomicUsize::new(0),
        })
    }

    pub fn sourced(&self) -> usize {
        self.sourced.load(Ordering::SeqCst)
    }
}

impl ManagedObjectSource for TrackedSource {
    fn source_managed_object(&self, user: ManagedObjectUser) {
        self.sourced.fetch_add(1, Ordering::SeqCst);
        user.set_managed_object(Arc::new(Tracked::new(&self.label, &self.log)));
    }
}

pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
