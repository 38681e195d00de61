//! Maintenance Sweep
//!
//! Periodically walks the registry and evicts entries that are no longer
//! wanted: handlers that report inactive are removed and disposed, and
//! handlers older than the configured maximum age are stopped, removed, and
//! disposed. While the registry is empty the loop parks on the registry's
//! insert signal instead of ticking.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::{Registry, RegistryEntry};
use crate::server::Counters;

enum Eviction {
    Inactive,
    Expired,
}

/// What a single sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_inactive: u64,
    pub evicted_expired: u64,
    pub faults: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.evicted_inactive + self.evicted_expired + self.faults
    }
}

/// Periodic eviction of dead and over-age connections.
pub struct Reaper {
    registry: Arc<Registry>,
    max_client_age: Duration,
    maintenance_interval: Duration,
    counters: Arc<Counters>,
}

impl Reaper {
    pub fn new(
        registry: Arc<Registry>,
        max_client_age: Duration,
        maintenance_interval: Duration,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            registry,
            max_client_age,
            maintenance_interval,
            counters,
        }
    }

    /// Maintenance loop. Runs until the shutdown channel fires.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            interval = ?self.maintenance_interval,
            max_client_age = ?self.max_client_age,
            "maintenance loop started"
        );

        loop {
            if self.registry.is_empty() {
                tokio::select! {
                    _ = self.registry.wait_for_entry() => {
                        // Entries exist again; resume the cadence from now.
                        ticker.reset();
                        continue;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once();
                    if report.total() > 0 {
                        debug!(
                            evicted_inactive = report.evicted_inactive,
                            evicted_expired = report.evicted_expired,
                            faults = report.faults,
                            remaining = self.registry.len(),
                            "maintenance sweep"
                        );
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("maintenance loop stopped");
    }

    /// Walk a snapshot of the registry once, applying the eviction policies
    /// to each entry. A handler that panics is forcibly removed so one bad
    /// collaborator cannot wedge the sweep or leak its slot.
    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (key, entry) in self.registry.snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| self.sweep_entry(key, &entry))) {
                Ok(Some(Eviction::Inactive)) => report.evicted_inactive += 1,
                Ok(Some(Eviction::Expired)) => report.evicted_expired += 1,
                Ok(None) => {}
                Err(_) => {
                    report.faults += 1;
                    warn!(key, peer = %entry.peer, "handler fault during sweep, forcing removal");
                    if let Some(removed) = self.registry.remove(key) {
                        // Best effort: the handler already panicked once.
                        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                            removed.handler.dispose();
                        }));
                    }
                }
            }
        }

        if report.evicted_inactive > 0 {
            self.counters.record_evicted_inactive(report.evicted_inactive);
        }
        if report.evicted_expired > 0 {
            self.counters.record_evicted_expired(report.evicted_expired);
        }
        if report.faults > 0 {
            self.counters.record_sweep_faults(report.faults);
        }

        report
    }

    fn sweep_entry(&self, key: u64, entry: &RegistryEntry) -> Option<Eviction> {
        if !entry.handler.is_active() {
            // remove() returning None means another path won the race and
            // owns teardown; never dispose an entry we did not remove.
            if let Some(removed) = self.registry.remove(key) {
                removed.handler.dispose();
                debug!(key, peer = %entry.peer, "evicted inactive connection");
                return Some(Eviction::Inactive);
            }
            return None;
        }

        if entry.admitted_at.elapsed() > self.max_client_age {
            entry.handler.stop();
            if let Some(removed) = self.registry.remove(key) {
                removed.handler.dispose();
                info!(
                    key,
                    peer = %entry.peer,
                    age = ?entry.admitted_at.elapsed(),
                    "evicted over-age connection"
                );
                return Some(Eviction::Expired);
            }
            return None;
        }

        None
    }
}
