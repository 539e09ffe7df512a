//! Single-threaded cooperative dispatch core.
//!
//! One thread owns all connection state and drives it through repeated
//! [`Dispatch::poll`] passes. A pass runs every registered [`Poller`]
//! unconditionally, then delivers at most one file event. File readiness
//! comes from a dedicated epoll thread: the dispatch thread must never
//! enter the kernel on its hot path, so the epoll thread blocks in
//! `epoll_wait` (with `EPOLLONESHOT` so a delivered fd stays quiet until
//! re-armed) and publishes each event through a single-slot atomic
//! handoff. The dispatch thread consumes the slot, invokes the handler
//! synchronously, and re-arms the fd unless the handler closed it.
//!
//! Handlers are stored per-fd and taken out of the table for the duration
//! of their invocation; a handler that closes its own fd (or any other)
//! simply leaves the table slot empty, which the post-invocation re-arm
//! detects. This is the safe-Rust rendition of invocation-id tracking.
//!
//! Other threads stop the dispatch thread at a known quiescent point with
//! [`DispatchHandle::lock`]: the requester raises a flag and spins until
//! the dispatch thread acknowledges at the top of its next pass, mutates
//! shared state, then releases. Acquisition on the dispatch thread itself
//! (or nested on the same thread) is a no-op.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex;

use crate::error::{Error, Result};

/// Event mask bit: the fd has readable data (or hangup/error to report).
pub const READABLE: u32 = 1;
/// Event mask bit: the fd accepts writes.
pub const WRITABLE: u32 = 2;

/// Invoked once per dispatch pass, whether or not any fd is ready.
pub trait Poller {
    /// Returns true when the poller found useful work this pass.
    fn poll(&mut self, reactor: &mut Reactor) -> bool;
}

/// What to do with a file handler after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Keep watching the fd with its current interest set.
    Keep,
    /// Deregister and close the fd; the handler is dropped.
    Close,
}

/// Callback attached to one file descriptor.
pub trait FileHandler {
    fn on_event(&mut self, events: u32, reactor: &mut Reactor) -> HandlerOutcome;
}

struct FileEntry {
    /// Taken out for the duration of an invocation.
    handler: Option<Box<dyn FileHandler>>,
    events: u32,
}

/// One-slot handoff from the epoll thread to the dispatch thread.
/// `fd == -1` means empty; events are published before the fd.
struct ReadySlot {
    fd: AtomicI32,
    events: AtomicU32,
}

/// The fd table and epoll machinery, passed to pollers and handlers so
/// they can register fds and adjust interest during invocations.
pub struct Reactor {
    epoll_fd: RawFd,
    files: Vec<Option<FileEntry>>,
    ready: Arc<ReadySlot>,
    exit: Arc<AtomicBool>,
    exit_pipe: [RawFd; 2],
    epoll_thread: Option<std::thread::JoinHandle<()>>,
}

impl Reactor {
    fn new() -> Result<Reactor> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::Io(err));
        }

        // The exit pipe's read end is registered with a sentinel tag so the
        // epoll thread knows a wakeup means "shut down".
        let mut event = libc::epoll_event { events: libc::EPOLLIN as u32, u64: u64::MAX };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut event) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(Error::Io(err));
        }

        let ready = Arc::new(ReadySlot { fd: AtomicI32::new(-1), events: AtomicU32::new(0) });
        let exit = Arc::new(AtomicBool::new(false));
        let epoll_thread = {
            let ready = Arc::clone(&ready);
            let exit = Arc::clone(&exit);
            std::thread::Builder::new()
                .name("gungnir-epoll".into())
                .spawn(move || epoll_main(epoll_fd, ready, exit))?
        };

        Ok(Reactor {
            epoll_fd,
            files: Vec::new(),
            ready,
            exit,
            exit_pipe: pipe_fds,
            epoll_thread: Some(epoll_thread),
        })
    }

    /// Starts watching `fd` with the given interest. Exactly one handler
    /// per fd.
    pub fn register_file(
        &mut self,
        fd: RawFd,
        events: u32,
        handler: Box<dyn FileHandler>,
    ) -> Result<()> {
        let slot = fd as usize;
        if slot >= self.files.len() {
            self.files.resize_with(slot + 1, || None);
        }
        if self.files[slot].is_some() {
            return Err(Error::Transport(format!("fd {fd} already has a file handler")));
        }
        let mut event =
            libc::epoll_event { events: epoll_mask(events) | libc::EPOLLONESHOT as u32, u64: fd as u64 };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        self.files[slot] = Some(FileEntry { handler: Some(handler), events });
        Ok(())
    }

    /// Changes the interest set for `fd`. During the fd's own invocation
    /// the change takes effect at re-arm time.
    pub fn set_events(&mut self, fd: RawFd, events: u32) {
        let Some(Some(entry)) = self.files.get_mut(fd as usize) else {
            return;
        };
        entry.events = events;
        if entry.handler.is_some() {
            self.rearm(fd, events);
        }
    }

    /// Deregisters and closes `fd`, dropping its handler (unless the fd is
    /// mid-invocation, in which case the handler drops on return).
    pub fn close_file(&mut self, fd: RawFd) {
        let Some(slot) = self.files.get_mut(fd as usize) else {
            return;
        };
        if slot.take().is_some() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                libc::close(fd);
            }
        }
        // Drop a stale ready event for this fd, in case it raced the close.
        if self.ready.fd.load(Ordering::Acquire) == fd {
            self.ready.fd.store(-1, Ordering::Release);
        }
    }

    fn rearm(&self, fd: RawFd, events: u32) {
        let mut event =
            libc::epoll_event { events: epoll_mask(events) | libc::EPOLLONESHOT as u32, u64: fd as u64 };
        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) };
    }

    /// Consumes the ready slot, if the epoll thread filled it.
    fn take_ready(&self) -> Option<(RawFd, u32)> {
        let fd = self.ready.fd.load(Ordering::Acquire);
        if fd < 0 {
            return None;
        }
        let events = self.ready.events.load(Ordering::Acquire);
        self.ready.fd.store(-1, Ordering::Release);
        Some((fd, events))
    }

    /// Invokes the handler for one delivered event, then re-arms the fd
    /// unless it was closed during the invocation.
    fn dispatch_event(&mut self, fd: RawFd, events: u32) -> bool {
        let Some(Some(entry)) = self.files.get_mut(fd as usize) else {
            return false;
        };
        let Some(mut handler) = entry.handler.take() else {
            return false;
        };

        let outcome = handler.on_event(events, self);

        let still_registered = matches!(self.files.get(fd as usize), Some(Some(_)));
        if !still_registered {
            // The handler closed this fd itself; nothing left to re-arm.
            return true;
        }
        if outcome == HandlerOutcome::Close {
            self.files[fd as usize] = None;
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                libc::close(fd);
            }
        } else {
            let entry = self.files[fd as usize].as_mut().unwrap();
            entry.handler = Some(handler);
            let interest = entry.events;
            self.rearm(fd, interest);
        }
        true
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Release);
        unsafe { libc::write(self.exit_pipe[1], b"x".as_ptr() as *const libc::c_void, 1) };
        if let Some(thread) = self.epoll_thread.take() {
            let _ = thread.join();
        }
        for (fd, entry) in self.files.iter_mut().enumerate() {
            if entry.take().is_some() {
                unsafe { libc::close(fd as RawFd) };
            }
        }
        unsafe {
            libc::close(self.exit_pipe[0]);
            libc::close(self.exit_pipe[1]);
            libc::close(self.epoll_fd);
        }
    }
}

fn epoll_mask(events: u32) -> u32 {
    let mut mask = 0u32;
    if events & READABLE != 0 {
        mask |= libc::EPOLLIN as u32;
    }
    if events & WRITABLE != 0 {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

/// Epoll thread: blocks in `epoll_wait` and funnels events through the
/// ready slot one at a time.
fn epoll_main(epoll_fd: RawFd, ready: Arc<ReadySlot>, exit: Arc<AtomicBool>) {
    const MAX_EVENTS: usize = 10;
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    loop {
        let count =
            unsafe { libc::epoll_wait(epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, -1) };
        if count < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "epoll_wait failed; epoll thread exiting");
            return;
        }
        for event in &events[..count as usize] {
            if event.u64 == u64::MAX {
                // Exit pipe became readable.
                return;
            }
            let mut mask = 0u32;
            if event.events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                mask |= READABLE;
            }
            if event.events & libc::EPOLLOUT as u32 != 0 {
                mask |= WRITABLE;
            }
            if mask == 0 {
                continue;
            }
            // Wait for the dispatch thread to drain the previous event.
            while ready.fd.load(Ordering::Acquire) >= 0 {
                if exit.load(Ordering::Acquire) {
                    return;
                }
                std::hint::spin_loop();
            }
            ready.events.store(mask, Ordering::Release);
            ready.fd.store(event.u64 as RawFd, Ordering::Release);
        }
    }
}

/// State for the cross-thread halt protocol: a mutex serializing lockers
/// plus the flag pair the dispatch thread acknowledges through.
pub struct DispatchShared {
    locker: RawMutex,
    lock_needed: AtomicBool,
    locked: AtomicBool,
    owner: ThreadId,
}

/// Cloneable handle for acquiring the dispatch lock from other threads.
#[derive(Clone)]
pub struct DispatchHandle {
    shared: Arc<DispatchShared>,
}

thread_local! {
    static HOLDING_DISPATCH_LOCK: Cell<bool> = const { Cell::new(false) };
}

impl DispatchHandle {
    /// Halts the dispatch thread at its next quiescent point and holds it
    /// until the guard drops. A no-op on the dispatch thread itself and on
    /// a thread that already holds the lock.
    pub fn lock(&self) -> DispatchLock {
        if std::thread::current().id() == self.shared.owner
            || HOLDING_DISPATCH_LOCK.with(|held| held.get())
        {
            return DispatchLock { shared: None, _not_send: std::marker::PhantomData };
        }
        self.shared.locker.lock();
        self.shared.lock_needed.store(true, Ordering::Release);
        while !self.shared.locked.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        HOLDING_DISPATCH_LOCK.with(|held| held.set(true));
        DispatchLock {
            shared: Some(Arc::clone(&self.shared)),
            _not_send: std::marker::PhantomData,
        }
    }
}

/// Held while the dispatch thread is paused; releases on drop. Tied to the
/// acquiring thread (the holding flag is thread-local).
pub struct DispatchLock {
    shared: Option<Arc<DispatchShared>>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for DispatchLock {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            HOLDING_DISPATCH_LOCK.with(|held| held.set(false));
            shared.lock_needed.store(false, Ordering::Release);
            unsafe { shared.locker.unlock() };
        }
    }
}

/// The dispatch loop state: pollers plus the reactor.
pub struct Dispatch {
    reactor: Reactor,
    pollers: Vec<Box<dyn Poller>>,
    shared: Arc<DispatchShared>,
}

impl Dispatch {
    /// Creates the dispatch core owned by the calling thread.
    pub fn new() -> Result<Dispatch> {
        Ok(Dispatch {
            reactor: Reactor::new()?,
            pollers: Vec::new(),
            shared: Arc::new(DispatchShared {
                locker: RawMutex::INIT,
                lock_needed: AtomicBool::new(false),
                locked: AtomicBool::new(false),
                owner: std::thread::current().id(),
            }),
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn add_poller(&mut self, poller: Box<dyn Poller>) {
        self.pollers.push(poller);
    }

    pub fn reactor(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// One pass: honor a pending cross-thread lock, run every poller, then
    /// deliver at most one file event. Returns the number of useful
    /// actions taken.
    pub fn poll(&mut self) -> usize {
        if self.shared.lock_needed.load(Ordering::Acquire) {
            self.shared.locked.store(true, Ordering::Release);
            while self.shared.lock_needed.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            self.shared.locked.store(false, Ordering::Release);
        }

        let mut work = 0;
        let mut pollers = std::mem::take(&mut self.pollers);
        for poller in &mut pollers {
            if poller.poll(&mut self.reactor) {
                work += 1;
            }
        }
        // A poller may have registered more pollers meanwhile; keep both.
        pollers.append(&mut self.pollers);
        self.pollers = pollers;

        if let Some((fd, events)) = self.reactor.take_ready() {
            if self.reactor.dispatch_event(fd, events) {
                work += 1;
            }
        }
        work
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    struct CountingPoller {
        count: Rc<RefCell<usize>>,
    }

    impl Poller for CountingPoller {
        fn poll(&mut self, _reactor: &mut Reactor) -> bool {
            *self.count.borrow_mut() += 1;
            false
        }
    }

    struct Recorder {
        log: Rc<RefCell<Vec<u32>>>,
        close_after: Option<usize>,
    }

    impl FileHandler for Recorder {
        fn on_event(&mut self, events: u32, _reactor: &mut Reactor) -> HandlerOutcome {
            let mut log = self.log.borrow_mut();
            log.push(events);
            // Drain so level-triggered readiness does not re-fire forever.
            let fd_log_len = log.len();
            drop(log);
            if self.close_after.map_or(false, |n| fd_log_len >= n) {
                return HandlerOutcome::Close;
            }
            HandlerOutcome::Keep
        }
    }

    fn poll_until(dispatch: &mut Dispatch, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            dispatch.poll();
            assert!(Instant::now() < deadline, "dispatch condition never became true");
        }
    }

    #[test]
    fn pollers_run_every_pass() {
        let mut dispatch = Dispatch::new().unwrap();
        let count = Rc::new(RefCell::new(0));
        dispatch.add_poller(Box::new(CountingPoller { count: count.clone() }));
        dispatch.poll();
        dispatch.poll();
        dispatch.poll();
        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn file_events_reach_the_handler_and_rearm() {
        let mut dispatch = Dispatch::new().unwrap();
        let (theirs, mut ours) = UnixStream::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        let fd = theirs.into_raw_fd();

        let log = Rc::new(RefCell::new(Vec::new()));
        dispatch
            .reactor()
            .register_file(fd, READABLE, Box::new(DrainingRecorder { fd, log: log.clone() }))
            .unwrap();

        ours.write_all(b"a").unwrap();
        poll_until(&mut dispatch, || !log.borrow().is_empty());

        ours.write_all(b"b").unwrap();
        poll_until(&mut dispatch, || log.borrow().len() >= 2);
        assert!(log.borrow().iter().all(|&events| events & READABLE != 0));
    }

    /// Reads everything available so oneshot re-arm is observable.
    struct DrainingRecorder {
        fd: RawFd,
        log: Rc<RefCell<Vec<u32>>>,
    }

    impl FileHandler for DrainingRecorder {
        fn on_event(&mut self, events: u32, _reactor: &mut Reactor) -> HandlerOutcome {
            let mut sink = [0u8; 64];
            while unsafe {
                libc::recv(self.fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len(), libc::MSG_DONTWAIT)
            } > 0
            {}
            self.log.borrow_mut().push(events);
            HandlerOutcome::Keep
        }
    }

    #[test]
    fn handler_can_close_its_own_fd() {
        let mut dispatch = Dispatch::new().unwrap();
        let (theirs, mut ours) = UnixStream::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        let fd = theirs.into_raw_fd();

        let log = Rc::new(RefCell::new(Vec::new()));
        dispatch
            .reactor()
            .register_file(fd, READABLE, Box::new(Recorder { log: log.clone(), close_after: Some(1) }))
            .unwrap();

        ours.write_all(b"x").unwrap();
        poll_until(&mut dispatch, || log.borrow().len() == 1);

        // The fd is closed: the peer sees EOF.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match ours.write_all(b"y") {
                Err(_) => break,
                Ok(()) => {
                    dispatch.poll();
                    assert!(Instant::now() < deadline, "peer never observed close");
                }
            }
        }
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn cross_thread_lock_handshakes() {
        let mut dispatch = Dispatch::new().unwrap();
        let handle = dispatch.handle();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let locker = {
            let observed = Arc::clone(&observed);
            std::thread::spawn(move || {
                let guard = handle.lock();
                observed.lock().push("locked");
                // Nested acquisition on the same thread must not deadlock.
                let nested = handle.lock();
                drop(nested);
                drop(guard);
                observed.lock().push("released");
            })
        };

        poll_until(&mut dispatch, || observed.lock().len() == 2);
        locker.join().unwrap();
        assert_eq!(*observed.lock(), vec!["locked", "released"]);
    }

    #[test]
    fn lock_on_owner_thread_is_noop() {
        let dispatch = Dispatch::new().unwrap();
        let handle = dispatch.handle();
        // Never polled, so a real acquisition would spin forever.
        let guard = handle.lock();
        drop(guard);
    }
}
