//! Bounded-parallelism gate for command execution.
//!
//! Only scripts that actually spawn a command hold a slot; fingerprint-only
//! and no-command scripts pass the pool by. Waiters re-inspect the run's
//! abort flag before taking a freed slot, so no new command starts after a
//! fatal failure under the `no-new` failure mode.

use std::sync::{Arc, Mutex};

use derive_more::{Display, Error};
use tokio::sync::Notify;
use tracing::{instrument, trace};

use crate::executor::AbortSignal;

/// How many commands may run concurrently.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Bounded(usize),
    Unbounded,
}

impl Parallelism {
    /// The default bound: twice the logical CPU count.
    pub fn default_bound() -> usize {
        2 * num_cpus::get().max(1)
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Bounded(Self::default_bound())
    }
}

/// The run was aborted while waiting for a worker slot.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display("run aborted")]
pub struct RunAborted;

#[derive(Debug)]
struct Inner {
    capacity: Option<usize>,
    available: Mutex<usize>,
    freed: Notify,
}

/// Counter of concurrently running commands. Cheap to clone; clones share
/// the same slots, which is how watch iterations share one pool.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(parallelism: Parallelism) -> Self {
        let capacity = match parallelism {
            Parallelism::Bounded(bound) => Some(bound.max(1)),
            Parallelism::Unbounded => None,
        };
        Self {
            inner: Arc::new(Inner {
                capacity,
                available: Mutex::new(capacity.unwrap_or(0)),
                freed: Notify::new(),
            }),
        }
    }

    /// Take a slot, suspending until one frees. Fails if the run aborts
    /// first, and checks the abort flag again whenever a slot frees.
    #[instrument(skip_all)]
    pub async fn acquire(&self, abort: &AbortSignal) -> Result<WorkerSlot, RunAborted> {
        loop {
            if abort.is_aborted() {
                return Err(RunAborted);
            }
            if self.try_take() {
                trace!("acquired worker slot");
                return Ok(WorkerSlot { pool: Some(self.clone()) });
            }
            tokio::select! {
                _ = self.inner.freed.notified() => {}
                _ = abort.aborted() => {}
            }
        }
    }

    fn try_take(&self) -> bool {
        if self.inner.capacity.is_none() {
            return true;
        }
        let mut available = self.inner.available.lock().expect("pool poisoned");
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        if self.inner.capacity.is_none() {
            return;
        }
        {
            let mut available = self.inner.available.lock().expect("pool poisoned");
            *available += 1;
        }
        // notify_one stores a permit when nobody is waiting yet, so a
        // release racing a fresh waiter is not lost.
        self.inner.freed.notify_one();
        trace!("released worker slot");
    }
}

/// One held slot; releasing is dropping.
#[derive(Debug)]
pub struct WorkerSlot {
    pool: Option<WorkerPool>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}
