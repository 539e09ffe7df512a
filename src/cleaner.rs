//! Epoch-based reclamation of unlinked nodes and superseded values.
//!
//! Workers publish the epoch they observed when their current RPC began;
//! a worker with no RPC publishes `u64::MAX`. Every retired object is
//! stamped with the epoch current at retirement. The collector may destroy
//! an object once its stamp is strictly below the minimum published epoch:
//! at that point no worker's current RPC can have seen the object while it
//! was reachable, and nothing acquired later can reach it at all.
//!
//! Retirement queues are plain mutex-guarded FIFOs; stamps are monotone
//! within each queue, so the collector only ever needs to examine the
//! front.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::skiplist::{destroy_node, destroy_value, RetiredNode, RetiredValue};

/// Sweep idle backoff ceiling, in microseconds.
const POLL_USEC: u64 = 10_000;

/// One published-epoch slot per worker thread.
pub struct EpochRegistry {
    slots: Box<[AtomicU64]>,
}

impl EpochRegistry {
    pub fn new(workers: usize) -> Arc<Self> {
        let slots = (0..workers).map(|_| AtomicU64::new(u64::MAX)).collect();
        Arc::new(Self { slots })
    }

    /// Publishes the epoch a worker observed at the start of its RPC.
    pub fn publish(&self, slot: usize, epoch: u64) {
        self.slots[slot].store(epoch, Ordering::SeqCst);
    }

    /// Marks a worker as having no RPC in flight.
    pub fn clear(&self, slot: usize) {
        self.slots[slot].store(u64::MAX, Ordering::SeqCst);
    }

    /// Minimum epoch any worker could still be observing.
    pub fn min_published(&self) -> u64 {
        self.slots.iter().map(|slot| slot.load(Ordering::SeqCst)).min().unwrap_or(u64::MAX)
    }
}

struct CleanerShared {
    removals: Mutex<Vec<(u64, RetiredNode)>>,
    objects: Mutex<Vec<(u64, RetiredValue)>>,
    registry: Arc<EpochRegistry>,
    shutdown: AtomicBool,
}

impl CleanerShared {
    /// Destroys at most one node and one value whose stamps have fallen
    /// below `min_epoch`. Returns whether anything was destroyed.
    fn clean(&self, min_epoch: u64) -> bool {
        let node = {
            let mut removals = self.removals.lock();
            match removals.first() {
                Some((stamp, _)) if *stamp < min_epoch => Some(removals.remove(0).1),
                _ => None,
            }
        };
        let value = {
            let mut objects = self.objects.lock();
            match objects.first() {
                Some((stamp, _)) if *stamp < min_epoch => Some(objects.remove(0).1),
                _ => None,
            }
        };
        let worked = node.is_some() || value.is_some();
        if let Some(node) = node {
            unsafe { destroy_node(node) };
        }
        if let Some(value) = value {
            unsafe { destroy_value(value) };
        }
        worked
    }

    fn drain(&self) {
        for (_, node) in self.removals.lock().drain(..) {
            unsafe { destroy_node(node) };
        }
        for (_, value) in self.objects.lock().drain(..) {
            unsafe { destroy_value(value) };
        }
    }
}

/// Background collector for deferred destruction.
pub struct Cleaner {
    shared: Arc<CleanerShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Cleaner {
    /// Starts the collector thread against the workers' epoch slots.
    pub fn start(registry: Arc<EpochRegistry>) -> Cleaner {
        let shared = Arc::new(CleanerShared {
            removals: Mutex::new(Vec::new()),
            objects: Mutex::new(Vec::new()),
            registry,
            shutdown: AtomicBool::new(false),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("gungnir-cleaner".into())
                .spawn(move || cleaner_main(shared))
                .expect("failed to spawn cleaner thread")
        };
        Cleaner { shared, thread: Some(thread) }
    }

    /// Queues an unlinked node, stamped with `epoch`.
    pub fn collect_node(&self, epoch: u64, node: RetiredNode) {
        self.shared.removals.lock().push((epoch, node));
    }

    /// Queues a superseded value object, stamped with `epoch`.
    pub fn collect_value(&self, epoch: u64, value: RetiredValue) {
        self.shared.objects.lock().push((epoch, value));
    }

    /// Objects currently awaiting destruction.
    pub fn pending(&self) -> usize {
        self.shared.removals.lock().len() + self.shared.objects.lock().len()
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // Workers are gone by teardown; nothing can observe the leftovers.
        self.shared.drain();
    }
}

fn cleaner_main(shared: Arc<CleanerShared>) {
    let mut rng = SmallRng::from_entropy();
    loop {
        let min_epoch = shared.registry.min_published();
        while shared.clean(min_epoch) {}
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        std::thread::sleep(Duration::from_micros(rng.gen_range(0..POLL_USEC / 10 + 1)));
    }
}
