//! Fixed-size pool of worker threads.
//!
//! Each slot runs at most one job at a time on its own thread. Slots are
//! scanned for an idle one; there is no blocking wait primitive, a caller
//! that gets its job back from [`ThreadPool::try_add`] retries later.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

struct Slot {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

// Marks the slot idle when the job returns or unwinds.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ThreadPool {
    slots: Vec<Slot>,
}

impl ThreadPool {
    /// Creates a pool with `count` slots, or one per hardware thread.
    ///
    /// # Arguments
    /// * `count` - Explicit slot count; `None` uses the available parallelism
    ///
    /// There is always at least one slot.
    pub fn new(count: Option<usize>) -> Self {
        let default = thread::available_parallelism().map_or(1, |n| n.get());
        let count = count.unwrap_or(default).max(1);

        let slots = (0..count)
            .map(|_| Slot {
                running: Arc::new(AtomicBool::new(false)),
                thread: None,
            })
            .collect();

        Self { slots }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently running a job.
    pub fn busy(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.running.load(Ordering::Acquire))
            .count()
    }

    /// Starts `job` on an idle slot.
    ///
    /// # Returns
    /// `Ok(None)` if the job was started, `Ok(Some(job))` if every slot is
    /// busy, or an error if the worker thread couldn't be created.
    pub fn try_add<F>(&mut self, job: F) -> Result<Option<F>>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some((index, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.running.load(Ordering::Acquire))
        else {
            return Ok(Some(job));
        };

        if let Some(finished) = slot.thread.take() {
            // a panic was already reported by the job itself
            let _ = finished.join();
        }

        slot.running.store(true, Ordering::Release);
        let guard = RunningGuard(slot.running.clone());

        let spawned = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                let _guard = guard;
                job();
            });

        match spawned {
            Ok(handle) => {
                slot.thread = Some(handle);
                Ok(None)
            }
            Err(e) => {
                // the closure, and the guard with it, were dropped
                Err(Error::os("failed to start worker thread", e))
            }
        }
    }

    /// Waits for every running job.
    pub fn join(&mut self) {
        for slot in &mut self.slots {
            if let Some(thread) = slot.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join();
    }
}
