//! Bookkeeping for in-flight connection workers.
//!
//! Owned by the accept loop alone. Entries are appended on spawn and removed
//! once their thread is seen finished; workers are never addressed by id.

use crate::runtime::worker::ExitReason;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Interval between completion checks during a bounded drain.
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// A spawned worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    thread: JoinHandle<ExitReason>,
}

impl WorkerHandle {
    pub fn new(id: u64, peer: Option<SocketAddr>, thread: JoinHandle<ExitReason>) -> Self {
        Self { id, peer, thread }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    fn join(self) {
        match self.thread.join() {
            Ok(reason) => debug!(worker = self.id, peer = ?self.peer, ?reason, "Worker joined"),
            Err(_) => error!(worker = self.id, peer = ?self.peer, "Worker panicked"),
        }
    }
}

/// Ordered collection of running workers.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: WorkerHandle) {
        self.workers.push(handle);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Join every worker that has already finished, leaving running ones in
    /// place. Never blocks on a running worker.
    ///
    /// Returns the number of workers removed.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].is_finished() {
                self.workers.remove(i).join();
                reaped += 1;
            } else {
                i += 1;
            }
        }
        reaped
    }

    /// Wait for every remaining worker.
    ///
    /// With a `limit`, workers still running when it expires are detached
    /// and their count is returned; without one this returns 0.
    pub fn drain(&mut self, limit: Option<Duration>) -> usize {
        let Some(limit) = limit else {
            for handle in self.workers.drain(..) {
                handle.join();
            }
            return 0;
        };

        let deadline = Instant::now() + limit;
        loop {
            self.reap();
            if self.is_empty() {
                return 0;
            }
            if Instant::now() >= deadline {
                let stragglers = self.workers.len();
                warn!(stragglers, "Drain timeout expired, detaching workers");
                self.workers.clear();
                return stragglers;
            }
            thread::sleep(DRAIN_CHECK_INTERVAL);
        }
    }
}
