//! Client session: one TCP connection multiplexing any number of
//! outstanding requests, plus blocking typed wrappers over it.
//!
//! The session owns its own dispatch core with no dedicated thread; the
//! wrappers drive `dispatch.poll()` inline until their notifier resolves.
//! Requests are framed with a fresh nonce each; the common fast path
//! writes the whole frame from `send_request`, and only partial writes
//! fall back to the send queue and write-interest. Responses are paired
//! by nonce; a response for a cancelled (or unknown) nonce is read off
//! the socket and discarded. On any transport error every outstanding
//! notifier is failed exactly once and the session becomes unusable.
//!
//! A RETRY response makes the wrapper sleep a uniformly random duration
//! inside the server-provided window and re-issue the operation under a
//! new nonce.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;

use crate::buffer::Buffer;
use crate::dispatch::{Dispatch, FileHandler, HandlerOutcome, Reactor, READABLE, WRITABLE};
use crate::error::{Error, Result};
use crate::transport::resolve;
use crate::wire::{parse_retry_response, send_frame, InboundFrame, Opcode, ReadOutcome, Status};

/// Completion flag shared between a waiter and the session plumbing.
struct Notifier {
    state: Cell<NotifyState>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NotifyState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl Notifier {
    fn new() -> Rc<Notifier> {
        Rc::new(Notifier { state: Cell::new(NotifyState::Pending) })
    }

    fn complete(&self) {
        if self.state.get() == NotifyState::Pending {
            self.state.set(NotifyState::Completed);
        }
    }

    fn fail(&self) {
        if self.state.get() == NotifyState::Pending {
            self.state.set(NotifyState::Failed);
        }
    }
}

/// Handle to one in-flight request, returned by [`Client::send_request`].
pub struct PendingRpc {
    rpc: Rc<RefCell<ClientRpc>>,
    notifier: Rc<Notifier>,
}

struct ClientRpc {
    nonce: u64,
    request: Buffer,
    response: Buffer,
    notifier: Rc<Notifier>,
}

struct Session {
    fd: RawFd,
    /// Next nonce to assign; monotonically increasing per session.
    serial: u64,
    rpcs_waiting_to_send: VecDeque<Rc<RefCell<ClientRpc>>>,
    /// Unsent bytes of the front request; None means a fresh frame.
    pending_send: Option<usize>,
    rpcs_waiting_for_response: Vec<Rc<RefCell<ClientRpc>>>,
    /// Inbound frame being reassembled.
    message: InboundFrame,
    /// Whether the current frame's nonce has been matched yet.
    resolved: bool,
    /// The RPC whose response is currently arriving, if it matched.
    current: Option<Rc<RefCell<ClientRpc>>>,
}

impl Session {
    /// Fails every outstanding notifier once and forgets the connection.
    fn fail_all(&mut self) {
        self.fd = -1;
        for rpc in self.rpcs_waiting_to_send.drain(..) {
            rpc.borrow().notifier.fail();
        }
        for rpc in self.rpcs_waiting_for_response.drain(..) {
            rpc.borrow().notifier.fail();
        }
        self.current = None;
    }

    fn find_response_target(&self, nonce: u64) -> Option<Rc<RefCell<ClientRpc>>> {
        self.rpcs_waiting_for_response
            .iter()
            .find(|rpc| rpc.borrow().nonce == nonce)
            .cloned()
    }
}

/// Drives the session's fd from the client's dispatch core.
struct SessionHandler {
    fd: RawFd,
    session: Rc<RefCell<Session>>,
}

impl FileHandler for SessionHandler {
    fn on_event(&mut self, events: u32, reactor: &mut Reactor) -> HandlerOutcome {
        if events & READABLE != 0 {
            loop {
                let mut session = self.session.borrow_mut();
                match session.message.read_header(self.fd) {
                    Ok(ReadOutcome::NeedMore) => break,
                    Ok(ReadOutcome::Complete) => {}
                    Err(_) => {
                        session.fail_all();
                        return HandlerOutcome::Close;
                    }
                }
                if !session.resolved {
                    session.resolved = true;
                    let nonce = session.message.header().unwrap().nonce;
                    match session.find_response_target(nonce) {
                        Some(rpc) => session.current = Some(rpc),
                        // Cancelled or never ours: drain and drop the body.
                        None => session.message.discard(),
                    }
                }
                let outcome = match session.current.clone() {
                    Some(rpc) => {
                        let mut rpc = rpc.borrow_mut();
                        session.message.read_body(self.fd, Some(&mut rpc.response))
                    }
                    None => session.message.read_body(self.fd, None),
                };
                match outcome {
                    Ok(ReadOutcome::NeedMore) => break,
                    Ok(ReadOutcome::Complete) => {
                        if let Some(rpc) = session.current.take() {
                            session.rpcs_waiting_for_response.retain(|r| !Rc::ptr_eq(r, &rpc));
                            rpc.borrow().notifier.complete();
                        }
                        session.message = InboundFrame::new();
                        session.resolved = false;
                    }
                    Err(_) => {
                        session.fail_all();
                        return HandlerOutcome::Close;
                    }
                }
            }
        }

        if events & WRITABLE != 0 {
            let mut session = self.session.borrow_mut();
            loop {
                let Some(front) = session.rpcs_waiting_to_send.front().cloned() else {
                    reactor.set_events(self.fd, READABLE);
                    break;
                };
                let pending = session.pending_send;
                let sent = {
                    let rpc = front.borrow();
                    send_frame(self.fd, rpc.nonce, &rpc.request, pending)
                };
                match sent {
                    Ok(0) => {
                        let rpc = session.rpcs_waiting_to_send.pop_front().unwrap();
                        session.rpcs_waiting_for_response.push(rpc);
                        session.pending_send = None;
                    }
                    Ok(remaining) => {
                        session.pending_send = Some(remaining);
                        break;
                    }
                    Err(_) => {
                        session.fail_all();
                        return HandlerOutcome::Close;
                    }
                }
            }
        }
        HandlerOutcome::Keep
    }
}

/// A connection to one Gungnir server.
pub struct Client {
    dispatch: Dispatch,
    session: Rc<RefCell<Session>>,
    fd: RawFd,
}

impl Client {
    /// Connects to `locator` (`host:port`). Fails on a self-connect: after
    /// a crash restart the kernel can hand us our own TIME_WAIT port.
    pub fn connect(locator: &str) -> Result<Client> {
        let addr = resolve(locator)?;
        let stream = TcpStream::connect(addr)
            .map_err(|err| Error::Transport(format!("couldn't connect to {locator}: {err}")))?;
        if stream.local_addr().map(|local| local == addr).unwrap_or(false) {
            return Err(Error::Transport(format!("connected to itself at {addr}")));
        }
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let fd = stream.into_raw_fd();

        let mut dispatch = Dispatch::new()?;
        let session = Rc::new(RefCell::new(Session {
            fd,
            serial: 1,
            rpcs_waiting_to_send: VecDeque::new(),
            pending_send: None,
            rpcs_waiting_for_response: Vec::new(),
            message: InboundFrame::new(),
            resolved: false,
            current: None,
        }));

        // No-op here (we own the dispatch), but any thread registering
        // against a running dispatch must hold this.
        let handle = dispatch.handle();
        let _lock = handle.lock();
        dispatch.reactor().register_file(
            fd,
            READABLE,
            Box::new(SessionHandler { fd, session: Rc::clone(&session) }),
        )?;
        drop(_lock);

        Ok(Client { dispatch, session, fd })
    }

    pub fn get(&mut self, key: u64) -> Result<Option<Vec<u8>>> {
        loop {
            let mut request = Buffer::new();
            request.append(&(Opcode::Get as u16).to_le_bytes());
            request.append(&key.to_le_bytes());
            let response = self.call(request)?;
            match self.decode_status(&response)? {
                Status::Ok => {
                    if response.len() < 8 {
                        return Err(Error::Protocol("short GET response".into()));
                    }
                    let len = u32::from_le_bytes(response[4..8].try_into().unwrap()) as usize;
                    if response.len() < 8 + len {
                        return Err(Error::Protocol("GET response truncated".into()));
                    }
                    return Ok(Some(response[8..8 + len].to_vec()));
                }
                Status::ObjectDoesntExist => return Ok(None),
                Status::Retry => self.backoff(&response)?,
                status => return Err(Error::Rpc(status)),
            }
        }
    }

    pub fn put(&mut self, key: u64, value: &[u8]) -> Result<()> {
        loop {
            let mut request = Buffer::new();
            request.append(&(Opcode::Put as u16).to_le_bytes());
            request.append(&key.to_le_bytes());
            request.append(&(value.len() as u64).to_le_bytes());
            request.append(value);
            let response = self.call(request)?;
            match self.decode_status(&response)? {
                Status::Ok => return Ok(()),
                Status::Retry => self.backoff(&response)?,
                status => return Err(Error::Rpc(status)),
            }
        }
    }

    pub fn erase(&mut self, key: u64) -> Result<()> {
        loop {
            let mut request = Buffer::new();
            request.append(&(Opcode::Erase as u16).to_le_bytes());
            request.append(&key.to_le_bytes());
            let response = self.call(request)?;
            match self.decode_status(&response)? {
                Status::Ok => return Ok(()),
                Status::Retry => self.backoff(&response)?,
                status => return Err(Error::Rpc(status)),
            }
        }
    }

    /// Ordered scan over the inclusive key interval `[start, end]`.
    pub fn scan(&mut self, start: u64, end: u64) -> Result<ScanIter> {
        loop {
            let mut request = Buffer::new();
            request.append(&(Opcode::Scan as u16).to_le_bytes());
            request.append(&start.to_le_bytes());
            request.append(&end.to_le_bytes());
            let response = self.call(request)?;
            match self.decode_status(&response)? {
                Status::Ok => return ScanIter::new(response),
                Status::Retry => self.backoff(&response)?,
                status => return Err(Error::Rpc(status)),
            }
        }
    }

    /// Convenience: send one framed request and wait for its response.
    fn call(&mut self, request: Buffer) -> Result<Vec<u8>> {
        let pending = self.send_request(request);
        self.wait(&pending)
    }

    /// Frames and transmits a raw request, returning a handle to pair with
    /// the response. The common case writes the whole frame here; partial
    /// writes queue behind write-interest.
    pub fn send_request(&mut self, request: Buffer) -> PendingRpc {
        let notifier = Notifier::new();
        let mut session = self.session.borrow_mut();
        let nonce = session.serial;
        session.serial += 1;
        let rpc = Rc::new(RefCell::new(ClientRpc {
            nonce,
            request,
            response: Buffer::new(),
            notifier: Rc::clone(&notifier),
        }));
        let pending = PendingRpc { rpc: Rc::clone(&rpc), notifier: Rc::clone(&notifier) };
        if session.fd < 0 {
            notifier.fail();
            return pending;
        }
        if !session.rpcs_waiting_to_send.is_empty() {
            // Earlier requests are still partially written; stay in order.
            session.rpcs_waiting_to_send.push_back(rpc);
            return pending;
        }
        let sent = send_frame(self.fd, nonce, &rpc.borrow().request, None);
        match sent {
            Ok(0) => session.rpcs_waiting_for_response.push(rpc),
            Ok(remaining) => {
                session.pending_send = Some(remaining);
                session.rpcs_waiting_to_send.push_back(rpc);
                drop(session);
                self.dispatch.reactor().set_events(self.fd, READABLE | WRITABLE);
            }
            Err(_) => {
                session.fail_all();
                drop(session);
                self.dispatch.reactor().close_file(self.fd);
            }
        }
        pending
    }

    /// Polls the dispatch until the request resolves, returning the raw
    /// response payload.
    pub fn wait(&mut self, pending: &PendingRpc) -> Result<Vec<u8>> {
        loop {
            match pending.notifier.state.get() {
                NotifyState::Pending => {
                    self.dispatch.poll();
                }
                NotifyState::Completed => {
                    return Ok(pending.rpc.borrow().response.to_vec());
                }
                NotifyState::Failed => return Err(Error::SessionAborted),
                NotifyState::Cancelled => {
                    return Err(Error::Transport("request was cancelled".into()))
                }
            }
        }
    }

    /// Removes a pending request; a response that still arrives for it is
    /// discarded. A partially transmitted request cannot be withdrawn from
    /// the wire and is left to complete as a no-longer-awaited frame.
    pub fn cancel_request(&mut self, pending: &PendingRpc) {
        let mut session = self.session.borrow_mut();
        if pending.notifier.state.get() == NotifyState::Pending {
            pending.notifier.state.set(NotifyState::Cancelled);
        }
        if let Some(at) = session
            .rpcs_waiting_for_response
            .iter()
            .position(|rpc| Rc::ptr_eq(rpc, &pending.rpc))
        {
            let rpc = session.rpcs_waiting_for_response.remove(at);
            if session.current.as_ref().map_or(false, |current| Rc::ptr_eq(current, &rpc)) {
                // Mid-read: skip the rest of this response's bytes.
                session.message.discard();
                session.current = None;
            }
            return;
        }
        let partially_sent = session.pending_send.is_some();
        if let Some(at) = session
            .rpcs_waiting_to_send
            .iter()
            .position(|rpc| Rc::ptr_eq(rpc, &pending.rpc))
        {
            if at > 0 || !partially_sent {
                session.rpcs_waiting_to_send.remove(at);
            }
        }
    }

    fn decode_status(&self, response: &[u8]) -> Result<Status> {
        if response.len() < 4 {
            return Err(Error::Protocol("response too short for a status".into()));
        }
        let raw = u32::from_le_bytes(response[..4].try_into().unwrap());
        Status::try_from(raw).map_err(|raw| Error::Protocol(format!("unknown status {raw}")))
    }

    /// Honors a RETRY response: sleep uniformly inside the hint window.
    fn backoff(&self, response: &[u8]) -> Result<()> {
        let hints = parse_retry_response(response)?;
        let (min, max) = (hints.min_delay_micros as u64, hints.max_delay_micros as u64);
        let wait = if max > min { rand::thread_rng().gen_range(min..=max) } else { min };
        tracing::debug!(wait_micros = wait, message = %hints.message, "server asked for retry");
        std::thread::sleep(Duration::from_micros(wait));
        Ok(())
    }
}

/// Lazily decodes the ⟨key, length, bytes⟩ triples of a SCAN response.
pub struct ScanIter {
    data: Vec<u8>,
    at: usize,
    remaining: u32,
}

impl ScanIter {
    fn new(response: Vec<u8>) -> Result<ScanIter> {
        if response.len() < 8 {
            return Err(Error::Protocol("short SCAN response".into()));
        }
        let remaining = u32::from_le_bytes(response[4..8].try_into().unwrap());
        Ok(ScanIter { data: response, at: 8, remaining })
    }

    /// Items the server reported, before any decoding.
    pub fn len(&self) -> u32 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl Iterator for ScanIter {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.data.len() < self.at + 12 {
            self.remaining = 0;
            return Some(Err(Error::Protocol("SCAN item truncated".into())));
        }
        let key = u64::from_le_bytes(self.data[self.at..self.at + 8].try_into().unwrap());
        let len =
            u32::from_le_bytes(self.data[self.at + 8..self.at + 12].try_into().unwrap()) as usize;
        if self.data.len() < self.at + 12 + len {
            self.remaining = 0;
            return Some(Err(Error::Protocol("SCAN item truncated".into())));
        }
        let value = self.data[self.at + 12..self.at + 12 + len].to_vec();
        self.at += 12 + len;
        self.remaining -= 1;
        Some(Ok((key, value)))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let mut session = self.session.borrow_mut();
        if session.fd >= 0 {
            session.fail_all();
            drop(session);
            self.dispatch.reactor().close_file(self.fd);
        }
    }
}
