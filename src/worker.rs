//! Worker threads and the manager that feeds them.
//!
//! Each worker owns a cooperative task queue and advertises its state in a
//! single atomic word. The dispatch thread hands an RPC to an idle worker
//! by storing it in the worker's inbox and exchanging the state to
//! WORKING; the exchange doubles as the wakeup decision, since only an
//! exchange that observes SLEEPING needs to unpark the thread. No system
//! call is made on the hot path.
//!
//! Worker states:
//!
//! ```text
//! POLLING --------> WORKING ----------> POSTPROCESSING
//!    ^  \              |  (send_reply)        |
//!    |   \ (idle too   |                      |
//!    |    \  long)     +----------------------+
//!    |     v                      | (task queue idle)
//!    | SLEEPING                   v
//!    +<---------------------- POLLING
//! ```
//!
//! The manager is a dispatch [`Poller`]: once per pass it harvests replies
//! from workers that left WORKING, immediately re-feeds them from the
//! waiting queue, and returns idle workers to the idle list with a
//! swap-with-back removal. Requests that arrive with no idle worker are
//! queued, up to a bound past which the client is told to back off with a
//! RETRY response.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cleaner::EpochRegistry;
use crate::dispatch::{Poller, Reactor};
use crate::service;
use crate::store::Store;
use crate::transport::{send_reply, ServerRpc, TransportState};
use crate::wire::{build_retry_response, set_response_status, Opcode, Status};

pub const POLLING: u32 = 0;
pub const WORKING: u32 = 1;
pub const POSTPROCESSING: u32 = 2;
pub const SLEEPING: u32 = 3;

/// Backoff hints sent to clients when the waiting queue is full.
const RETRY_MIN_DELAY_MICROS: u32 = 100;
const RETRY_MAX_DELAY_MICROS: u32 = 2000;

pub struct Worker {
    state: AtomicU32,
    /// RPC handed off by the manager, consumed by the worker thread.
    inbox: Mutex<Option<Box<ServerRpc>>>,
    /// Finished reply traveling back to the dispatch thread.
    outbox: Mutex<Option<Box<ServerRpc>>>,
    registry: Arc<EpochRegistry>,
    store: Arc<Store>,
    slot: usize,
    poll_micros: u64,
    shutdown: AtomicBool,
    thread: OnceLock<std::thread::Thread>,
}

impl Worker {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<EpochRegistry>,
        slot: usize,
        poll_micros: u64,
    ) -> Arc<Worker> {
        Arc::new(Worker {
            state: AtomicU32::new(POLLING),
            inbox: Mutex::new(None),
            outbox: Mutex::new(None),
            registry,
            store,
            slot,
            poll_micros,
            shutdown: AtomicBool::new(false),
            thread: OnceLock::new(),
        })
    }

    pub fn start(worker: Arc<Worker>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("gungnir-worker-{}", worker.slot))
            .spawn(move || worker_main(worker))
            .expect("failed to spawn worker thread")
    }

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Hands an RPC to this worker, waking it only when the state exchange
    /// observes SLEEPING.
    pub fn handoff(&self, rpc: Box<ServerRpc>) {
        let mut inbox = self.inbox.lock();
        debug_assert!(inbox.is_none(), "handoff to a worker that still holds an RPC");
        *inbox = Some(rpc);
        drop(inbox);
        let prev = self.state.swap(WORKING, Ordering::AcqRel);
        if prev == SLEEPING {
            if let Some(thread) = self.thread.get() {
                thread.unpark();
            }
        }
    }

    /// Moves the finished RPC to the outbox and marks the remainder of the
    /// task queue as postprocessing. Called by service tasks.
    pub fn send_reply(&self, rpc: Box<ServerRpc>) {
        *self.outbox.lock() = Some(rpc);
        self.state.store(POSTPROCESSING, Ordering::Release);
    }

    pub fn reply_sent(&self) -> bool {
        self.state() == POSTPROCESSING
    }

    pub fn take_outbox(&self) -> Option<Box<ServerRpc>> {
        self.outbox.lock().take()
    }

    /// Asks the worker thread to exit once it observes the wakeup.
    fn request_exit(&self) {
        self.shutdown.store(true, Ordering::Release);
        let prev = self.state.swap(WORKING, Ordering::AcqRel);
        if prev == SLEEPING {
            if let Some(thread) = self.thread.get() {
                thread.unpark();
            }
        }
    }
}

fn worker_main(worker: Arc<Worker>) {
    worker.thread.set(std::thread::current()).expect("worker thread started twice");
    let poll_window = Duration::from_micros(worker.poll_micros);
    let mut last_idle = Instant::now();

    loop {
        // Wait for the manager to supply work, spinning through the poll
        // window and then parking. The SLEEPING transition must CAS from
        // POLLING: the manager may flip the state to WORKING at any moment.
        while worker.state.load(Ordering::Acquire) != WORKING {
            if worker.shutdown.load(Ordering::Acquire) {
                worker.registry.clear(worker.slot);
                return;
            }
            if last_idle.elapsed() >= poll_window
                && worker
                    .state
                    .compare_exchange(POLLING, SLEEPING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                while worker.state.load(Ordering::Acquire) == SLEEPING {
                    std::thread::park();
                }
                last_idle = Instant::now();
            }
            std::hint::spin_loop();
        }

        let rpc = worker.inbox.lock().take();
        let Some(rpc) = rpc else {
            if worker.shutdown.load(Ordering::Acquire) {
                worker.registry.clear(worker.slot);
                return;
            }
            worker.state.store(POLLING, Ordering::Release);
            continue;
        };

        // Publish the epoch this RPC begins at; everything the handlers
        // touch stays live until the slot clears.
        worker.registry.publish(worker.slot, worker.store.list.current_epoch());
        let mut queue = crate::task::TaskQueue::new();
        queue.schedule(service::dispatch_rpc(
            rpc,
            service::ServiceContext {
                store: Arc::clone(&worker.store),
                worker: Arc::clone(&worker),
            },
        ));
        queue.run_until_idle();
        worker.registry.clear(worker.slot);

        worker.state.store(POLLING, Ordering::Release);
        last_idle = Instant::now();
    }
}

/// Dispatch-side owner of the worker pool.
pub struct WorkerManager {
    workers: Vec<Arc<Worker>>,
    joins: Vec<std::thread::JoinHandle<()>>,
    idle: Vec<usize>,
    busy: Vec<usize>,
    waiting: VecDeque<Box<ServerRpc>>,
    transport: Option<Rc<RefCell<TransportState>>>,
    waiting_limit: usize,
}

impl WorkerManager {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<EpochRegistry>,
        worker_count: usize,
        poll_micros: u64,
        waiting_limit: usize,
    ) -> WorkerManager {
        let mut workers = Vec::with_capacity(worker_count);
        let mut joins = Vec::with_capacity(worker_count);
        let mut idle = Vec::with_capacity(worker_count);
        for slot in 0..worker_count {
            let worker = Worker::new(Arc::clone(&store), Arc::clone(&registry), slot, poll_micros);
            joins.push(Worker::start(Arc::clone(&worker)));
            workers.push(worker);
            idle.push(slot);
        }
        WorkerManager {
            workers,
            joins,
            idle,
            busy: Vec::new(),
            waiting: VecDeque::new(),
            transport: None,
            waiting_limit,
        }
    }

    /// Wires in the transport so replies can be transmitted.
    pub fn attach_transport(&mut self, transport: Rc<RefCell<TransportState>>) {
        self.transport = Some(transport);
    }

    pub fn idle(&self) -> bool {
        self.busy.is_empty() && self.waiting.is_empty()
    }

    /// Validates and routes one complete request.
    pub fn handle_rpc(&mut self, mut rpc: Box<ServerRpc>, reactor: &mut Reactor) {
        let opcode = rpc.request.get_range(0, 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
        match opcode {
            None => {
                tracing::warn!(
                    len = rpc.request.size(),
                    "incoming RPC too short for a request header"
                );
                set_response_status(&mut rpc.reply, Status::MessageError);
                self.reply(rpc, reactor);
                return;
            }
            Some(raw) if Opcode::try_from(raw).is_err() => {
                tracing::warn!(opcode = raw, "incoming RPC with unknown opcode");
                set_response_status(&mut rpc.reply, Status::UnimplementedRequest);
                self.reply(rpc, reactor);
                return;
            }
            Some(_) => {}
        }

        if self.idle.is_empty() {
            if self.waiting.len() >= self.waiting_limit {
                build_retry_response(
                    &mut rpc.reply,
                    RETRY_MIN_DELAY_MICROS,
                    RETRY_MAX_DELAY_MICROS,
                    "server overloaded; retry later",
                );
                self.reply(rpc, reactor);
            } else {
                self.waiting.push_back(rpc);
            }
            return;
        }

        let slot = self.idle.pop().unwrap();
        self.workers[slot].handoff(rpc);
        self.busy.push(slot);
    }

    /// One manager pass: harvest finished workers, re-feed them, send
    /// replies, reclaim idle ones.
    pub fn poll(&mut self, reactor: &mut Reactor) -> bool {
        let mut found_work = false;
        // Reverse iteration so swap-with-back removal leaves unvisited
        // entries in place.
        for i in (0..self.busy.len()).rev() {
            let slot = self.busy[i];
            let state = self.workers[slot].state();
            if state == WORKING {
                continue;
            }
            found_work = true;

            let rpc = self.workers[slot].take_outbox();

            // Highest priority: keep the worker busy.
            let mut started_new = false;
            if state != POSTPROCESSING {
                if let Some(waiting) = self.waiting.pop_front() {
                    self.workers[slot].handoff(waiting);
                    started_new = true;
                }
            }

            if let Some(rpc) = rpc {
                self.reply(rpc, reactor);
            }

            if !started_new && state != POSTPROCESSING {
                self.busy.swap_remove(i);
                self.idle.push(slot);
            }
        }
        found_work
    }

    /// Finishes in-flight RPCs, then stops and joins every worker thread.
    pub fn shutdown(&mut self, reactor: &mut Reactor) {
        while !self.idle() {
            self.poll(reactor);
            std::hint::spin_loop();
        }
        for worker in &self.workers {
            worker.request_exit();
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        tracing::debug!("worker pool stopped");
    }

    fn reply(&self, rpc: Box<ServerRpc>, reactor: &mut Reactor) {
        if let Some(transport) = &self.transport {
            send_reply(transport, reactor, rpc);
        }
        // With no transport attached (unit tests) the reply is dropped.
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        // Normal teardown goes through `shutdown`; this is the fallback for
        // error paths, so worker threads never outlive the pool. Queued but
        // unstarted RPCs are dropped.
        for worker in &self.workers {
            worker.request_exit();
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

/// Adapter registering the shared manager as a dispatch poller.
pub struct ManagerPoller(pub Rc<RefCell<WorkerManager>>);

impl Poller for ManagerPoller {
    fn poll(&mut self, reactor: &mut Reactor) -> bool {
        self.0.borrow_mut().poll(reactor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::config::Config;
    use crate::dispatch::Dispatch;
    use crate::tmpfs::NamedTempFile;

    fn test_store(file: &NamedTempFile) -> Arc<Store> {
        let config = Config::default().log_file_path(file.path());
        Arc::new(Store::open(&config, EpochRegistry::new(2)).unwrap())
    }

    fn get_request(key: u64) -> Buffer {
        let mut request = Buffer::new();
        request.append(&(Opcode::Get as u16).to_le_bytes());
        request.append(&key.to_le_bytes());
        request
    }

    fn wait_for<R>(mut probe: impl FnMut() -> Option<R>) -> R {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(result) = probe() {
                return result;
            }
            assert!(Instant::now() < deadline, "condition never became true");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn worker_executes_rpc_and_returns_to_polling() {
        let file = NamedTempFile::new().unwrap();
        let store = test_store(&file);
        let registry = EpochRegistry::new(1);
        let worker = Worker::new(store, Arc::clone(&registry), 0, 10_000);
        let join = Worker::start(Arc::clone(&worker));

        worker.handoff(ServerRpc::synthetic(get_request(5)));
        let rpc = wait_for(|| worker.take_outbox());
        // Missing key: status OBJECT_DOESNT_EXIST, zero length.
        assert_eq!(rpc.reply.to_vec()[..4], (Status::ObjectDoesntExist as u32).to_le_bytes());
        wait_for(|| (worker.state() == POLLING).then_some(()));
        // The epoch slot is clear again once the RPC retired.
        assert_eq!(registry.min_published(), u64::MAX);

        worker.request_exit();
        join.join().unwrap();
    }

    #[test]
    fn idle_worker_sleeps_and_wakes_on_handoff() {
        let file = NamedTempFile::new().unwrap();
        let store = test_store(&file);
        let worker = Worker::new(store, EpochRegistry::new(1), 0, 1_000);
        let join = Worker::start(Arc::clone(&worker));

        wait_for(|| (worker.state() == SLEEPING).then_some(()));
        worker.handoff(ServerRpc::synthetic(get_request(1)));
        wait_for(|| worker.take_outbox());

        worker.request_exit();
        join.join().unwrap();
    }

    #[test]
    fn manager_queues_when_all_workers_busy() {
        let file = NamedTempFile::new().unwrap();
        let store = test_store(&file);
        let mut dispatch = Dispatch::new().unwrap();
        let mut manager = WorkerManager::new(store, EpochRegistry::new(1), 1, 10_000, 4);

        for key in 0..3u64 {
            let rpc = ServerRpc::synthetic(get_request(key));
            manager.handle_rpc(rpc, dispatch.reactor());
        }
        // One worker: at most one in flight, the rest queued.
        assert_eq!(manager.busy.len(), 1);
        assert!(manager.waiting.len() >= 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !manager.idle() {
            manager.poll(dispatch.reactor());
            assert!(Instant::now() < deadline, "manager never drained");
        }
        assert_eq!(manager.idle.len(), 1);
        manager.shutdown(dispatch.reactor());
    }

    #[test]
    fn manager_rejects_bad_requests_without_workers() {
        let file = NamedTempFile::new().unwrap();
        let store = test_store(&file);
        let mut dispatch = Dispatch::new().unwrap();
        let mut manager = WorkerManager::new(store, EpochRegistry::new(1), 1, 10_000, 4);

        // Truncated header and unknown opcode never reach a worker.
        let mut short = Buffer::new();
        short.append(&[0x01]);
        manager.handle_rpc(ServerRpc::synthetic(short), dispatch.reactor());
        let mut unknown = Buffer::new();
        unknown.append(&999u16.to_le_bytes());
        unknown.append(&0u64.to_le_bytes());
        manager.handle_rpc(ServerRpc::synthetic(unknown), dispatch.reactor());
        assert!(manager.idle());
        manager.shutdown(dispatch.reactor());
    }
}
