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

//! Assets: resources that may take time to become ready.
//!
//! Chains waiting on an asset park on an [`AssetLatch`]. Assets with a
//! deadline register with the [`AssetManager`], whose background sweeper
//! fails them through [`Asset::fail_asset`] once the deadline passes.

use crate::error::{KernelError, KernelResult};
use crate::escalation::{Escalation, TimeoutKind};
use crate::function::BoxedFunctionState;
use crate::telemetry;
use metrics::{counter, gauge};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Parking spot for chains waiting on an asset.
///
/// Once released, the latch stays released: chains parked afterwards are
/// handed straight back to the caller.
pub struct AssetLatch {
    inner: Mutex<LatchInner>,
}

#[derive(Default)]
struct LatchInner {
    released: bool,
    waiting: Vec<BoxedFunctionState>,
}

impl AssetLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LatchInner::default()),
        })
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Parks `chain` until release.
    ///
    /// Returns the chain unchanged if the latch has already been released.
    pub fn park(&self, chain: BoxedFunctionState) -> Option<BoxedFunctionState> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Some(chain);
        }
        debug!(function = chain.name(), "parking chain on asset latch");
        inner.waiting.push(chain);
        None
    }

    /// Releases the latch and reactivates every parked chain
    pub fn release(&self) {
        let waiting = {
            let mut inner = self.inner.lock();
            inner.released = true;
            std::mem::take(&mut inner.waiting)
        };
        for chain in waiting {
            crate::thread::activate(chain);
        }
    }
}

impl fmt::Debug for AssetLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AssetLatch")
            .field("released", &inner.released)
            .field("waiting", &inner.waiting.len())
            .finish()
    }
}

/// Result of checking on an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetCheck {
    /// The asset no longer needs monitoring
    Resolved,
    Pending,
}

/// Timing information for one asset check.
#[derive(Debug, Clone, Copy)]
pub struct CheckAssetContext {
    time: Instant,
    registered_at: Instant,
    deadline: Instant,
}

impl CheckAssetContext {
    /// Time of the check
    pub fn time(&self) -> Instant {
        self.time
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.time.saturating_duration_since(self.registered_at)
    }

    pub fn is_past_deadline(&self) -> bool {
        self.time >= self.deadline
    }
}

/// Something monitored by the [`AssetManager`].
pub trait Asset: Send + Sync + 'static {
    fn check_on_asset(&self, context: &CheckAssetContext) -> AssetCheck;

    /// Fails the asset, waking anything waiting on it
    fn fail_asset(&self, escalation: Escalation);
}

/// Handle to a registration, used to stop monitoring an asset early.
#[derive(Debug)]
pub struct AssetRegistration {
    id: u64,
    manager: Weak<AssetManagerInner>,
}

impl AssetRegistration {
    pub fn unregister(self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self.id);
        }
    }
}

struct Registered {
    asset: Arc<dyn Asset>,
    registered_at: Instant,
    deadline: Instant,
    kind: TimeoutKind,
}

struct AssetManagerInner {
    assets: Mutex<HashMap<u64, Registered>>,
    next_id: AtomicU64,
    interval: Duration,
    running: Mutex<bool>,
    wakeup: Condvar,
}

impl AssetManagerInner {
    fn remove(&self, id: u64) {
        let mut assets = self.assets.lock();
        if assets.remove(&id).is_some() {
            gauge!(telemetry::REGISTERED_ASSETS, assets.len() as f64);
        }
    }

    /// Checks every registered asset as of `time`.
    ///
    /// # Workflow
    /// 1. Snapshot registrations so asset code never runs under the map lock
    /// 2. Drop resolved assets
    /// 3. Remove and fail pending assets past their deadline
    fn check(&self, time: Instant) -> usize {
        let snapshot: Vec<(u64, Arc<dyn Asset>, CheckAssetContext, TimeoutKind)> = {
            let assets = self.assets.lock();
            assets
                .iter()
                .map(|(id, registered)| {
                    let context = CheckAssetContext {
                        time,
                        registered_at: registered.registered_at,
                        deadline: registered.deadline,
                    };
                    (*id, Arc::clone(&registered.asset), context, registered.kind.clone())
                })
                .collect()
        };

        let mut failed = 0;
        for (id, asset, context, kind) in snapshot {
            match asset.check_on_asset(&context) {
                AssetCheck::Resolved => self.remove(id),
                AssetCheck::Pending if context.is_past_deadline() => {
                    // Only the caller that removes the registration fails the asset
                    let removed = self.assets.lock().remove(&id).is_some();
                    if !removed {
                        continue;
                    }
                    failed += 1;
                    counter!(telemetry::ASSET_TIMEOUTS, 1);
                    warn!(asset = id, kind = %kind, elapsed = ?context.elapsed(), "asset timed out");
                    asset.fail_asset(Escalation::timeout(kind.clone(), format!("{kind} timed out after {:?}", context.elapsed())));
                }
                AssetCheck::Pending => {}
            }
        }
        if failed > 0 {
            gauge!(telemetry::REGISTERED_ASSETS, self.assets.lock().len() as f64);
        }
        failed
    }
}

/// Monitors assets against their deadlines.
///
/// # Concurrency
/// A single background thread wakes every check interval. The map of
/// registrations is only locked long enough to snapshot or remove entries.
pub struct AssetManager {
    inner: Arc<AssetManagerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AssetManager {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            inner: Arc::new(AssetManagerInner {
                assets: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                interval: check_interval,
                running: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.inner.interval
    }

    /// Monitors `asset`, failing it with a `kind` timeout after `timeout`
    pub fn register(&self, asset: Arc<dyn Asset>, timeout: Duration, kind: TimeoutKind) -> AssetRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registered_at = Instant::now();
        let mut assets = self.inner.assets.lock();
        assets.insert(
            id,
            Registered {
                asset,
                registered_at,
                deadline: registered_at + timeout,
                kind,
            },
        );
        gauge!(telemetry::REGISTERED_ASSETS, assets.len() as f64);
        AssetRegistration {
            id,
            manager: Arc::downgrade(&self.inner),
        }
    }

    pub fn registered(&self) -> usize {
        self.inner.assets.lock().len()
    }

    /// Runs one check pass now, returning how many assets timed out
    pub fn check_assets(&self) -> usize {
        self.inner.check(Instant::now())
    }

    /// Runs one check pass as if the current time were `time`
    pub fn check_assets_at(&self, time: Instant) -> usize {
        self.inner.check(time)
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.lock()
    }

    /// Starts the background sweeper
    pub fn start(&self) -> KernelResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        *self.inner.running.lock() = true;

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("dotflow-asset-manager".to_string())
            .spawn(move || {
                loop {
                    {
                        let mut running = inner.running.lock();
                        if !*running {
                            break;
                        }
                        inner.wakeup.wait_for(&mut running, inner.interval);
                        if !*running {
                            break;
                        }
                    }
                    inner.check(Instant::now());
                }
            })
            .map_err(|err| {
                *self.inner.running.lock() = false;
                KernelError::invalid_configuration(format!("failed to spawn asset manager: {err}"))
            })?;
        *worker = Some(handle);
        info!(interval = ?self.inner.interval, "asset manager started");
        Ok(())
    }

    /// Stops the sweeper. Registered assets are left untouched.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        {
            let mut running = self.inner.running.lock();
            *running = false;
            self.inner.wakeup.notify_all();
        }
        if let Some(handle) = handle {
            // The last owner may be dropped by the sweeper itself while it fails an asset
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("asset manager thread panicked");
            }
            info!("asset manager stopped");
        }
    }
}

impl Drop for AssetManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for AssetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetManager")
            .field("interval", &self.inner.interval)
            .field("registered", &self.registered())
            .field("running", &self.is_running())
            .finish()
    }
}
