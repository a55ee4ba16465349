//! Concurrent workload driving every registry operation from several threads.
//!
//! Each worker repeatedly creates nodes, mutates their payload under the object lock, looks
//! them up again by id, spins up short-lived bookkeeping objects, and bumps a counter on one
//! object shared by all workers. Handles beyond the configured working set are destroyed and
//! released oldest-first. Once every worker is done the registry must be empty again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use flash_registry::{Handle, ObjectId, ObjectKind, PoolStats, Registry, RegistryError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span};

use crate::app_config::ChurnConfig;

/// Stand-in for the flash filesystem's per-inode state.
#[derive(Debug, Default)]
pub struct InodeInfo {
    pub version: u64,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum ChurnError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("{threads} threads times {iterations} iterations overflows the update counter.")]
    WorkloadTooLarge { threads: usize, iterations: usize },

    #[error("A churn worker panicked.")]
    WorkerPanicked,

    #[error("Shared object saw {found} updates, expected {expected}.")]
    LostUpdates { expected: u64, found: u64 },

    #[error("{remaining} objects are still indexed after the workload finished.")]
    Leaked { remaining: usize },
}

/// Outcome of a churn run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChurnReport {
    pub created: u64,
    pub destroyed: u64,
    pub lookups: u64,
    pub contended_locks: u64,
    /// Pool counters right before the shared object was destroyed.
    pub stats_before_drain: PoolStats,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    lookups: AtomicU64,
    contended_locks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs the workload described by `config` against `registry`.
pub fn run(
    registry: &Registry<InodeInfo>,
    config: &ChurnConfig,
) -> Result<ChurnReport, ChurnError> {
    let expected = config
        .threads
        .checked_mul(config.iterations)
        .and_then(|rounds| u64::try_from(rounds).ok())
        .ok_or(ChurnError::WorkloadTooLarge {
            threads: config.threads,
            iterations: config.iterations,
        })?;

    let counters = Counters::default();
    let shared = registry.create_with(ObjectKind::Node, InodeInfo::default())?;
    let shared_id = shared.id();
    debug!(id = %shared_id, threads = config.threads, "starting churn");

    thread::scope(|s| -> Result<(), ChurnError> {
        let workers: Vec<_> = (0..config.threads)
            .map(|worker| {
                let counters = &counters;
                s.spawn(move || worker_loop(registry, shared_id, worker, config, counters))
            })
            .collect();
        for worker in workers {
            worker.join().map_err(|_| ChurnError::WorkerPanicked)??;
        }
        Ok(())
    })?;

    let found = shared
        .lock()?
        .payload()
        .map_or(0, |info| info.version);
    if found != expected {
        return Err(ChurnError::LostUpdates { expected, found });
    }

    let stats_before_drain = registry.stats();
    registry.destroy(&shared);
    registry.put(shared);

    let remaining = registry.len();
    if remaining != 0 {
        return Err(ChurnError::Leaked { remaining });
    }

    Ok(ChurnReport {
        created: counters.created.load(Ordering::Relaxed),
        destroyed: counters.destroyed.load(Ordering::Relaxed),
        lookups: counters.lookups.load(Ordering::Relaxed),
        contended_locks: counters.contended_locks.load(Ordering::Relaxed),
        stats_before_drain,
    })
}

fn worker_loop(
    registry: &Registry<InodeInfo>,
    shared_id: ObjectId,
    worker: usize,
    config: &ChurnConfig,
    counters: &Counters,
) -> Result<(), ChurnError> {
    let _span = info_span!("worker", worker).entered();
    let mut open: VecDeque<Handle<InodeInfo>> = VecDeque::with_capacity(config.working_set + 1);

    for round in 0..config.iterations {
        let handle = registry.create_with(ObjectKind::Node, InodeInfo::default())?;
        Counters::bump(&counters.created);
        {
            let mut guard = handle.lock()?;
            if let Some(info) = guard.payload_mut() {
                info.size += round as u64;
                info.version += 1;
            }
        }

        let again = registry.get(handle.id())?;
        Counters::bump(&counters.lookups);
        registry.put(again);

        let scratch = registry.create(ObjectKind::Bookkeeping)?;
        Counters::bump(&counters.created);
        registry.put(scratch);

        let hot = registry.get(shared_id)?;
        Counters::bump(&counters.lookups);
        let mut guard = match hot.try_lock()? {
            Some(guard) => guard,
            None => {
                Counters::bump(&counters.contended_locks);
                hot.lock()?
            }
        };
        if let Some(info) = guard.payload_mut() {
            info.version += 1;
        }
        guard.unlock();
        registry.put(hot);

        open.push_back(handle);
        if open.len() > config.working_set {
            if let Some(oldest) = open.pop_front() {
                retire(registry, oldest, counters);
            }
        }
    }

    for handle in open.drain(..) {
        retire(registry, handle, counters);
    }
    Ok(())
}

fn retire(registry: &Registry<InodeInfo>, handle: Handle<InodeInfo>, counters: &Counters) {
    registry.destroy(&handle);
    registry.put(handle);
    Counters::bump(&counters.destroyed);
}
