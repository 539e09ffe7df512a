//! Wire protocol: frame header, opcodes, status codes, and the per-direction
//! read/write state machines.
//!
//! Every message on a connection is one frame:
//!
//! ```text
//! +------------+-----------+----------------+
//! | nonce: u64 | len: u32  | payload        |
//! +------------+-----------+----------------+
//! |     8      |     4     | len bytes      |
//! +------------+-----------+----------------+
//! ```
//!
//! All integers are little-endian. The nonce is chosen by the client and
//! echoed by the server so responses can be paired with requests on a
//! multiplexed connection. Payloads are capped at [`MAX_RPC_LEN`]; inbound
//! frames that claim more are truncated to the cap and the excess is drained
//! off the socket.
//!
//! Reading is event-driven and restartable: [`InboundFrame::read_header`] and
//! [`InboundFrame::read_body`] each consume whatever the socket has and
//! report [`ReadOutcome::NeedMore`] until the frame is whole. Writing gathers
//! the header and the payload's chunks into a single `sendmsg` and reports
//! how many bytes remain for the next writability event.

use std::io::Cursor;
use std::os::unix::io::RawFd;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Upper bound on a frame payload: the largest value the protocol admits
/// (8 MiB) plus room for the response envelope.
pub const MAX_RPC_LEN: u32 = (1 << 23) + 200;

/// Bytes in the frame header.
pub const HEADER_SIZE: usize = 12;

/// Operations the server implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Get = 1,
    Put = 2,
    Erase = 3,
    Scan = 4,
}

impl TryFrom<u16> for Opcode {
    type Error = u16;

    fn try_from(raw: u16) -> std::result::Result<Self, u16> {
        match raw {
            1 => Ok(Opcode::Get),
            2 => Ok(Opcode::Put),
            3 => Ok(Opcode::Erase),
            4 => Ok(Opcode::Scan),
            other => Err(other),
        }
    }
}

/// Status codes carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    ObjectDoesntExist = 2,
    Retry = 3,
    MessageError = 4,
    InternalError = 5,
    UnimplementedRequest = 6,
}

impl TryFrom<u32> for Status {
    type Error = u32;

    fn try_from(raw: u32) -> std::result::Result<Self, u32> {
        match raw {
            0 => Ok(Status::Ok),
            2 => Ok(Status::ObjectDoesntExist),
            3 => Ok(Status::Retry),
            4 => Ok(Status::MessageError),
            5 => Ok(Status::InternalError),
            6 => Ok(Status::UnimplementedRequest),
            other => Err(other),
        }
    }
}

/// Frame header: nonce plus payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub nonce: u64,
    pub len: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..8].copy_from_slice(&self.nonce.to_le_bytes());
        bytes[8..].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            nonce: u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            len: u32::from_le_bytes(bytes[8..].try_into().unwrap()),
        }
    }
}

/// Progress report from the inbound state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The socket ran dry before the current phase finished.
    NeedMore,
    /// The phase (header or whole body) is complete.
    Complete,
}

/// Restartable reader for one inbound frame.
///
/// The header and body phases are split so the client session can resolve
/// the destination buffer by nonce after the header arrives. Server code
/// uses [`InboundFrame::read_message`], which runs both phases against a
/// known buffer.
pub struct InboundFrame {
    header_buf: [u8; HEADER_SIZE],
    header_received: usize,
    header: Option<Header>,
    /// Bytes of payload we will retain (0 when discarding, capped at
    /// MAX_RPC_LEN when the peer claims more).
    message_len: usize,
    body_received: usize,
    discarding: bool,
}

impl Default for InboundFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundFrame {
    pub fn new() -> Self {
        Self {
            header_buf: [0u8; HEADER_SIZE],
            header_received: 0,
            header: None,
            message_len: 0,
            body_received: 0,
            discarding: false,
        }
    }

    /// The decoded header, once [`ReadOutcome::Complete`] was returned by
    /// `read_header`.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Stops retaining payload bytes: the rest of the frame is read off the
    /// socket and dropped. Used when the matching request was cancelled.
    pub fn discard(&mut self) {
        self.discarding = true;
        self.message_len = 0;
    }

    /// Advances the header phase. `Complete` means the header is decoded
    /// and the body phase may begin.
    pub fn read_header(&mut self, fd: RawFd) -> Result<ReadOutcome> {
        if self.header.is_some() {
            return Ok(ReadOutcome::Complete);
        }
        while self.header_received < HEADER_SIZE {
            let n = recv_nonblock(fd, &mut self.header_buf[self.header_received..])?;
            if n == 0 {
                return Ok(ReadOutcome::NeedMore);
            }
            self.header_received += n;
        }
        let header = Header::decode(&self.header_buf);
        self.message_len = header.len.min(MAX_RPC_LEN) as usize;
        if header.len > MAX_RPC_LEN {
            tracing::warn!(
                len = header.len,
                "inbound frame exceeds MAX_RPC_LEN; truncating and draining excess"
            );
        }
        self.header = Some(header);
        Ok(ReadOutcome::Complete)
    }

    /// Advances the body phase. Retained bytes land in `target`; with no
    /// target the body is drained and dropped. `Complete` means the whole
    /// frame, including any drained excess, has been consumed.
    pub fn read_body(&mut self, fd: RawFd, target: Option<&mut Buffer>) -> Result<ReadOutcome> {
        let header = *self.header.as_ref().expect("read_body before header complete");

        match target {
            Some(buffer) if !self.discarding => {
                if buffer.size() < self.message_len {
                    buffer.alloc(self.message_len - buffer.size());
                }
                while self.body_received < self.message_len {
                    let dest = buffer.peek_mut(self.body_received).unwrap();
                    let n = recv_nonblock(fd, dest)?;
                    if n == 0 {
                        return Ok(ReadOutcome::NeedMore);
                    }
                    self.body_received += n;
                }
            }
            _ => {
                self.message_len = 0;
            }
        }

        // Drain whatever the peer sent beyond what we retain.
        while self.body_received < header.len as usize {
            let mut sink = [0u8; 4096];
            let want = (header.len as usize - self.body_received).min(sink.len());
            let n = recv_nonblock(fd, &mut sink[..want])?;
            if n == 0 {
                return Ok(ReadOutcome::NeedMore);
            }
            self.body_received += n;
        }
        Ok(ReadOutcome::Complete)
    }

    /// Runs both phases against a known target buffer.
    pub fn read_message(&mut self, fd: RawFd, target: &mut Buffer) -> Result<ReadOutcome> {
        if self.read_header(fd)? == ReadOutcome::NeedMore {
            return Ok(ReadOutcome::NeedMore);
        }
        self.read_body(fd, Some(target))
    }
}

/// Sends (part of) one frame with a single gathering write.
///
/// `bytes_to_send` is `None` for a fresh frame, or the remainder returned by
/// the previous attempt; bytes already on the wire are skipped. Returns the
/// bytes still unsent (0 = frame complete).
pub fn send_frame(
    fd: RawFd,
    nonce: u64,
    payload: &Buffer,
    bytes_to_send: Option<usize>,
) -> Result<usize> {
    let header = Header { nonce, len: payload.size() as u32 };
    let header_bytes = header.encode();
    let total = HEADER_SIZE + payload.size();
    let bytes_to_send = bytes_to_send.unwrap_or(total).min(total);
    let already_sent = total - bytes_to_send;

    // Up to 100 iovecs per call: one for the header remainder plus the
    // payload's chunks. Anything that does not fit is picked up by the next
    // writability event.
    let mut iov: Vec<libc::iovec> = Vec::with_capacity(payload.chunk_count().min(99) + 1);
    let payload_offset;
    if already_sent < HEADER_SIZE {
        iov.push(libc::iovec {
            iov_base: header_bytes[already_sent..].as_ptr() as *mut libc::c_void,
            iov_len: HEADER_SIZE - already_sent,
        });
        payload_offset = 0;
    } else {
        payload_offset = already_sent - HEADER_SIZE;
    }
    for chunk in payload.iter_range(payload_offset, payload.size() - payload_offset) {
        iov.push(libc::iovec {
            iov_base: chunk.as_ptr() as *mut libc::c_void,
            iov_len: chunk.len(),
        });
        if iov.len() >= 100 {
            break;
        }
    }

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;
    let sent = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT) };
    if sent < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(bytes_to_send);
        }
        return Err(Error::Transport(format!("sendmsg failed: {err}")));
    }
    Ok(bytes_to_send - sent as usize)
}

/// Non-blocking receive into `buf`. Returns 0 when the socket has no data
/// right now; a peer close is an error.
fn recv_nonblock(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_DONTWAIT)
    };
    if n > 0 {
        return Ok(n as usize);
    }
    if n == 0 {
        return Err(Error::PeerClosed);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(0);
    }
    Err(Error::Io(err))
}

/// Overwrites the response's leading status word, appending it when the
/// response is still empty.
pub fn set_response_status(reply: &mut Buffer, status: Status) {
    let bytes = (status as u32).to_le_bytes();
    if reply.is_empty() {
        reply.append(&bytes);
    } else {
        reply.copy_in(0, &bytes);
    }
}

/// Replaces the response with a RETRY envelope carrying client backoff
/// hints and a human-readable reason.
pub fn build_retry_response(
    reply: &mut Buffer,
    min_delay_micros: u32,
    max_delay_micros: u32,
    message: &str,
) {
    reply.reset();
    let mut body = Vec::with_capacity(16 + message.len());
    body.write_u32::<LittleEndian>(Status::Retry as u32).unwrap();
    body.write_u32::<LittleEndian>(min_delay_micros).unwrap();
    body.write_u32::<LittleEndian>(max_delay_micros).unwrap();
    body.write_u32::<LittleEndian>(message.len() as u32).unwrap();
    body.extend_from_slice(message.as_bytes());
    reply.append(&body);
}

/// Backoff hints decoded from a RETRY response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryHints {
    pub min_delay_micros: u32,
    pub max_delay_micros: u32,
    pub message: String,
}

/// Decodes the RETRY envelope from a response payload (status included).
pub fn parse_retry_response(payload: &[u8]) -> Result<RetryHints> {
    let mut cursor = Cursor::new(payload);
    let status = cursor.read_u32::<LittleEndian>().map_err(|_| short("status"))?;
    if status != Status::Retry as u32 {
        return Err(Error::Protocol(format!("expected RETRY status, got {status}")));
    }
    let min_delay_micros = cursor.read_u32::<LittleEndian>().map_err(|_| short("min delay"))?;
    let max_delay_micros = cursor.read_u32::<LittleEndian>().map_err(|_| short("max delay"))?;
    let message_len = cursor.read_u32::<LittleEndian>().map_err(|_| short("message length"))? as usize;
    let start = cursor.position() as usize;
    if payload.len() < start + message_len {
        return Err(short("message"));
    }
    let message = String::from_utf8_lossy(&payload[start..start + message_len]).into_owned();
    Ok(RetryHints { min_delay_micros, max_delay_micros, message })
}

fn short(what: &str) -> Error {
    Error::Protocol(format!("retry response truncated at {what}"))
}
