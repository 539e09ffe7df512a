//! Server-side TCP transport: listener, per-connection state, and reply
//! queues.
//!
//! All transport state lives on the dispatch thread behind `Rc<RefCell>`;
//! nothing here is touched from worker threads. A connection's lifecycle:
//! the accept handler wraps the fd in a [`ServerSocket`] and registers a
//! [`SocketHandler`]; readable events assemble one [`ServerRpc`] at a time
//! and hand completed ones to the worker manager; replies flow back through
//! [`send_reply`], which transmits immediately when it can and otherwise
//! queues the RPC and enables write interest. Any transport error closes
//! the one affected socket and drops its in-flight RPCs; the server stays
//! up.
//!
//! Sockets are identified by (fd, socket id): ids increase monotonically so
//! a reply racing with a close (and an fd reuse) is detected and discarded.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::dispatch::{FileHandler, HandlerOutcome, Reactor, READABLE, WRITABLE};
use crate::error::{Error, Result};
use crate::wire::{send_frame, InboundFrame, ReadOutcome};
use crate::worker::WorkerManager;

/// One request/response pair in flight on a server connection.
pub struct ServerRpc {
    pub fd: RawFd,
    pub socket_id: u64,
    frame: InboundFrame,
    pub request: Buffer,
    pub reply: Buffer,
}

impl ServerRpc {
    fn new(fd: RawFd, socket_id: u64) -> Box<ServerRpc> {
        Box::new(ServerRpc {
            fd,
            socket_id,
            frame: InboundFrame::new(),
            request: Buffer::new(),
            reply: Buffer::new(),
        })
    }

    /// The client-chosen nonce, echoed in the reply frame.
    pub fn nonce(&self) -> u64 {
        self.frame.header().map(|header| header.nonce).unwrap_or(0)
    }

    /// Builds a detached RPC that is not attached to any socket; replies
    /// to it are discarded. Used by unit tests of the service layer.
    #[cfg(test)]
    pub(crate) fn synthetic(request: Buffer) -> Box<ServerRpc> {
        Box::new(ServerRpc {
            fd: -1,
            socket_id: 0,
            frame: InboundFrame::new(),
            request,
            reply: Buffer::new(),
        })
    }
}

/// Per-connection bookkeeping.
struct ServerSocket {
    id: u64,
    /// Inbound RPC being reassembled, if any.
    rpc: Option<Box<ServerRpc>>,
    /// Replies not yet fully transmitted; the front one is in progress.
    rpcs_waiting_to_reply: VecDeque<Box<ServerRpc>>,
    /// Unsent bytes of the front reply.
    bytes_left_to_send: usize,
}

/// All connections, indexed by fd.
pub struct TransportState {
    sockets: Vec<Option<ServerSocket>>,
    next_socket_id: u64,
}

impl TransportState {
    fn socket_mut(&mut self, fd: RawFd) -> Option<&mut ServerSocket> {
        self.sockets.get_mut(fd as usize).and_then(|slot| slot.as_mut())
    }

    fn insert_socket(&mut self, fd: RawFd) -> u64 {
        let slot = fd as usize;
        if slot >= self.sockets.len() {
            self.sockets.resize_with(slot + 1, || None);
        }
        let id = self.next_socket_id;
        self.next_socket_id += 1;
        self.sockets[slot] = Some(ServerSocket {
            id,
            rpc: None,
            rpcs_waiting_to_reply: VecDeque::new(),
            bytes_left_to_send: 0,
        });
        id
    }

    /// Drops the connection's state. In-flight RPCs and queued replies go
    /// with it; their worker-side results are discarded by the id check in
    /// `send_reply`.
    fn remove_socket(&mut self, fd: RawFd) {
        if let Some(slot) = self.sockets.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn open_connections(&self) -> usize {
        self.sockets.iter().filter(|slot| slot.is_some()).count()
    }
}

/// The listening socket plus shared connection state.
pub struct ServerTransport {
    pub state: Rc<RefCell<TransportState>>,
    listen_fd: RawFd,
    local_addr: SocketAddr,
}

impl ServerTransport {
    /// Binds a non-blocking listener with `SO_REUSEADDR` on the configured
    /// address.
    pub fn bind(locator: &str) -> Result<ServerTransport> {
        let addr = resolve(locator)?;
        let listen_fd = unsafe {
            libc::socket(
                match addr {
                    SocketAddr::V4(_) => libc::AF_INET,
                    SocketAddr::V6(_) => libc::AF_INET6,
                },
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if listen_fd < 0 {
            return Err(Error::Transport(format!(
                "couldn't create listen socket: {}",
                std::io::Error::last_os_error()
            )));
        }
        let close_on_err = |err: Error| {
            unsafe { libc::close(listen_fd) };
            err
        };

        let optval: libc::c_int = 1;
        if unsafe {
            libc::setsockopt(
                listen_fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of_val(&optval) as libc::socklen_t,
            )
        } != 0
        {
            return Err(close_on_err(Error::Transport(format!(
                "couldn't set SO_REUSEADDR: {}",
                std::io::Error::last_os_error()
            ))));
        }

        let (raw_addr, raw_len) = sockaddr_from_std(&addr);
        if unsafe { libc::bind(listen_fd, &raw_addr as *const _ as *const libc::sockaddr, raw_len) }
            != 0
        {
            return Err(close_on_err(Error::Transport(format!(
                "couldn't bind to '{locator}': {}",
                std::io::Error::last_os_error()
            ))));
        }
        if unsafe { libc::listen(listen_fd, libc::SOMAXCONN) } != 0 {
            return Err(close_on_err(Error::Transport(format!(
                "couldn't listen on '{locator}': {}",
                std::io::Error::last_os_error()
            ))));
        }
        let local_addr = local_addr_of(listen_fd).map_err(close_on_err)?;

        tracing::info!(%local_addr, "server transport listening");
        Ok(ServerTransport {
            state: Rc::new(RefCell::new(TransportState {
                sockets: Vec::new(),
                next_socket_id: 100,
            })),
            listen_fd,
            local_addr,
        })
    }

    /// The bound address, with the kernel-assigned port when the locator
    /// asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers the accept handler with the dispatch reactor. The reactor
    /// takes ownership of the listen fd.
    pub fn start(&self, reactor: &mut Reactor, manager: Rc<RefCell<WorkerManager>>) -> Result<()> {
        reactor.register_file(
            self.listen_fd,
            READABLE,
            Box::new(AcceptHandler {
                listen_fd: self.listen_fd,
                state: Rc::clone(&self.state),
                manager,
            }),
        )
    }
}

/// Queues or transmits one finished reply, per the socket's backlog.
pub fn send_reply(
    state: &Rc<RefCell<TransportState>>,
    reactor: &mut Reactor,
    rpc: Box<ServerRpc>,
) {
    let fd = rpc.fd;
    let mut failed = false;
    {
        let mut state = state.borrow_mut();
        let Some(socket) = state.socket_mut(fd) else {
            return; // connection is gone; drop the reply
        };
        if socket.id != rpc.socket_id {
            return; // fd was reused for a new connection
        }
        if !socket.rpcs_waiting_to_reply.is_empty() {
            // The socket is backed up; transmit in arrival order later.
            socket.rpcs_waiting_to_reply.push_back(rpc);
        } else {
            match send_frame(fd, rpc.nonce(), &rpc.reply, None) {
                Ok(0) => {} // whole reply went out: the common case
                Ok(remaining) => {
                    socket.bytes_left_to_send = remaining;
                    socket.rpcs_waiting_to_reply.push_back(rpc);
                    reactor.set_events(fd, READABLE | WRITABLE);
                }
                Err(err) => {
                    tracing::debug!(fd, error = %err, "reply transmission failed; closing connection");
                    state.remove_socket(fd);
                    failed = true;
                }
            }
        }
    }
    if failed {
        reactor.close_file(fd);
    }
}

/// Accepts new connections on the listening socket.
struct AcceptHandler {
    listen_fd: RawFd,
    state: Rc<RefCell<TransportState>>,
    manager: Rc<RefCell<WorkerManager>>,
}

impl FileHandler for AcceptHandler {
    fn on_event(&mut self, _events: u32, reactor: &mut Reactor) -> HandlerOutcome {
        let accepted =
            unsafe { libc::accept(self.listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if accepted < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                // Transient conditions: the man page says treat these as
                // retry; EAGAIN just means nothing is pending.
                Some(libc::EAGAIN)
                | Some(libc::EHOSTDOWN)
                | Some(libc::EHOSTUNREACH)
                | Some(libc::ENETDOWN)
                | Some(libc::ENETUNREACH)
                | Some(libc::ENONET)
                | Some(libc::ENOPROTOOPT)
                | Some(libc::EOPNOTSUPP)
                | Some(libc::EPROTO) => HandlerOutcome::Keep,
                _ => {
                    tracing::error!(error = %err, "accept failed; disabling listener");
                    HandlerOutcome::Close
                }
            };
        }

        // Nagle would delay our small responses.
        let flag: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                accepted,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &flag as *const _ as *const libc::c_void,
                std::mem::size_of_val(&flag) as libc::socklen_t,
            );
        }

        let id = self.state.borrow_mut().insert_socket(accepted);
        let handler = SocketHandler {
            fd: accepted,
            state: Rc::clone(&self.state),
            manager: Rc::clone(&self.manager),
        };
        if let Err(err) = reactor.register_file(accepted, READABLE, Box::new(handler)) {
            tracing::error!(fd = accepted, error = %err, "couldn't watch accepted socket");
            self.state.borrow_mut().remove_socket(accepted);
            unsafe { libc::close(accepted) };
            return HandlerOutcome::Keep;
        }
        tracing::debug!(fd = accepted, socket_id = id, "accepted connection");
        HandlerOutcome::Keep
    }
}

/// Drives one accepted connection: reassembles requests, drains replies.
struct SocketHandler {
    fd: RawFd,
    state: Rc<RefCell<TransportState>>,
    manager: Rc<RefCell<WorkerManager>>,
}

impl FileHandler for SocketHandler {
    fn on_event(&mut self, events: u32, reactor: &mut Reactor) -> HandlerOutcome {
        if events & READABLE != 0 {
            // Read as many complete requests as the socket holds; each is
            // handed off as soon as it is whole.
            loop {
                let completed = {
                    let mut state = self.state.borrow_mut();
                    let Some(socket) = state.socket_mut(self.fd) else {
                        return HandlerOutcome::Keep; // closed under us
                    };
                    let socket_id = socket.id;
                    let rpc =
                        socket.rpc.get_or_insert_with(|| ServerRpc::new(self.fd, socket_id));
                    match rpc.frame.read_message(self.fd, &mut rpc.request) {
                        Ok(ReadOutcome::Complete) => socket.rpc.take(),
                        Ok(ReadOutcome::NeedMore) => None,
                        Err(err) => {
                            if !matches!(err, Error::PeerClosed) {
                                tracing::debug!(fd = self.fd, error = %err, "read failed; closing connection");
                            }
                            state.remove_socket(self.fd);
                            return HandlerOutcome::Close;
                        }
                    }
                };
                // The transport borrow is released before the manager runs:
                // an immediate error reply re-enters send_reply.
                match completed {
                    Some(rpc) => self.manager.borrow_mut().handle_rpc(rpc, reactor),
                    None => break,
                }
            }
        }

        if events & WRITABLE != 0 {
            let mut state = self.state.borrow_mut();
            let Some(socket) = state.socket_mut(self.fd) else {
                return HandlerOutcome::Keep;
            };
            loop {
                let Some(front) = socket.rpcs_waiting_to_reply.front() else {
                    reactor.set_events(self.fd, READABLE);
                    break;
                };
                // Zero means the front reply is untouched: send it fresh.
                let bytes_left = match socket.bytes_left_to_send {
                    0 => None,
                    left => Some(left),
                };
                match send_frame(self.fd, front.nonce(), &front.reply, bytes_left) {
                    Ok(0) => {
                        socket.rpcs_waiting_to_reply.pop_front();
                        socket.bytes_left_to_send = 0;
                    }
                    Ok(remaining) => {
                        socket.bytes_left_to_send = remaining;
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(fd = self.fd, error = %err, "reply drain failed; closing connection");
                        state.remove_socket(self.fd);
                        return HandlerOutcome::Close;
                    }
                }
            }
        }
        HandlerOutcome::Keep
    }
}

/// Resolves a `host:port` service locator to its first address.
pub fn resolve(locator: &str) -> Result<SocketAddr> {
    locator
        .to_socket_addrs()
        .map_err(|err| Error::Config(format!("can't resolve '{locator}': {err}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("'{locator}' resolved to no addresses")))
}

/// Converts a std socket address into raw sockaddr storage for bind and
/// connect calls.
pub(crate) fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Reads back the address bound to `fd`.
pub(crate) fn local_addr_of(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) }
        != 0
    {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    sockaddr_to_std(&storage)
}

pub(crate) fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        family => Err(Error::Transport(format!("unsupported address family {family}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_parses_host_port() {
        let addr = resolve("127.0.0.1:4160").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:4160");
        assert!(resolve("definitely-not-a-host.invalid:1").is_err());
        assert!(resolve("no-port-here").is_err());
    }

    #[test]
    fn sockaddr_round_trip() {
        for text in ["127.0.0.1:4160", "[::1]:9000"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (raw, _len) = sockaddr_from_std(&addr);
            assert_eq!(sockaddr_to_std(&raw).unwrap(), addr);
        }
    }

    #[test]
    fn bind_reports_local_port() {
        let transport = ServerTransport::bind("127.0.0.1:0").unwrap();
        assert_ne!(transport.local_addr().port(), 0);
        unsafe { libc::close(transport.listen_fd) };
    }

    #[test]
    fn socket_table_ids_are_unique() {
        let mut state = TransportState { sockets: Vec::new(), next_socket_id: 100 };
        let first = state.insert_socket(5);
        let second = state.insert_socket(9);
        assert_ne!(first, second);
        assert_eq!(state.open_connections(), 2);
        state.remove_socket(5);
        assert_eq!(state.open_connections(), 1);
        assert!(state.socket_mut(5).is_none());
        assert!(state.socket_mut(9).is_some());
    }
}
