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

use super::{ManagedObject, ManagedObjectSource, ManagedObjectUser, UnloadReason};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Pool sitting between a container and its source.
pub trait ManagedObjectPool: Send + Sync + 'static {
    /// Supplies a pooled object through `user`, or asks `source` for a new one
    fn source_managed_object(&self, source: &dyn ManagedObjectSource, user: ManagedObjectUser);

    /// Takes back an object its recycle function chose to reuse
    fn reuse_managed_object(&self, object: Arc<dyn ManagedObject>);

    /// Notified after an object has been unloaded for good
    fn discard_managed_object(&self, _object: &Arc<dyn ManagedObject>, _reason: UnloadReason) {}
}

/// FIFO pool keeping at most `capacity` idle objects.
pub struct BoundedManagedObjectPool {
    capacity: usize,
    idle: Mutex<VecDeque<Arc<dyn ManagedObject>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl BoundedManagedObjectPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Requests served from the pool
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Requests passed through to the source
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl ManagedObjectPool for BoundedManagedObjectPool {
    fn source_managed_object(&self, source: &dyn ManagedObjectSource, user: ManagedObjectUser) {
        let pooled = self.idle.lock().pop_front();
        match pooled {
            Some(object) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                user.set_managed_object(object);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                source.source_managed_object(user);
            }
        }
    }

    fn reuse_managed_object(&self, object: Arc<dyn ManagedObject>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push_back(object);
            return;
        }
        drop(idle);
        debug!(capacity = self.capacity, "pool full, unloading reused object");
        self.discarded.fetch_add(1, Ordering::Relaxed);
        object.unload(UnloadReason::NotReused);
    }

    fn discard_managed_object(&self, _object: &Arc<dyn ManagedObject>, _reason: UnloadReason) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }
}
