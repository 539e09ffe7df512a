//! Service handlers: GET, PUT, ERASE, and SCAN as cooperative tasks.
//!
//! Each handler is a state machine that runs on its worker's task queue.
//! One `perform_task` invocation advances as far as it can without
//! blocking; lock contention, WAL durability waits, and scan batch pacing
//! are expressed by returning [`TaskPoll::Pending`], which puts the task
//! behind whatever else the worker has queued. Structural locks are only
//! ever try-locked: a worker that blocked on a skip-list lock could
//! deadlock against another worker parked behind a WAL barrier.
//!
//! Replies use the response layouts of the wire module; `send_reply`
//! marks the worker POSTPROCESSING, so work after it (the ERASE unlink) no
//! longer delays the client.

use std::sync::Arc;

use crate::skiplist::{AddOutcome, NodeRef, RetiredNode, UnlinkOutcome, ValueObject};
use crate::store::Store;
use crate::task::{Task, TaskPoll};
use crate::transport::ServerRpc;
use crate::wire::{set_response_status, Opcode, Status};
use crate::worker::Worker;

/// Fixed prefix of every request: `opcode: u16`.
const REQUEST_HEADER_LEN: usize = 2;
/// PUT request prefix: opcode + key + declared value length.
const PUT_HEADER_LEN: usize = REQUEST_HEADER_LEN + 8 + 8;

/// Inline spin budget for a contended node lock before yielding.
const LOCK_SPIN: usize = 64;
/// Inline spin budget for the durability barrier before yielding.
const SYNC_SPIN: usize = 64;
/// Key/value triples emitted per SCAN invocation before yielding.
const SCAN_BATCH: u32 = 100;

/// Everything a handler needs: the data plane and its worker.
pub struct ServiceContext {
    pub store: Arc<Store>,
    pub worker: Arc<Worker>,
}

/// Builds the typed handler task for a validated request. Parse failures
/// become an immediate MESSAGE_ERROR reply.
pub fn dispatch_rpc(mut rpc: Box<ServerRpc>, ctx: ServiceContext) -> Box<dyn Task> {
    let opcode = rpc
        .request
        .get_range(0, REQUEST_HEADER_LEN)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .and_then(|raw| Opcode::try_from(raw).ok());
    let Some(opcode) = opcode else {
        // The manager validates before handoff; anything else is a bug on
        // our side, not the client's.
        return Box::new(ImmediateReply { ctx, rpc: Some(rpc), status: Status::InternalError });
    };

    match opcode {
        Opcode::Get => match read_key(&mut rpc) {
            Some(key) if rpc.request.size() == REQUEST_HEADER_LEN + 8 => {
                Box::new(GetTask { ctx, rpc: Some(rpc), key })
            }
            _ => malformed(ctx, rpc),
        },
        Opcode::Erase => match read_key(&mut rpc) {
            Some(key) if rpc.request.size() == REQUEST_HEADER_LEN + 8 => {
                Box::new(EraseTask { ctx, rpc: Some(rpc), key, phase: ErasePhase::Find })
            }
            _ => malformed(ctx, rpc),
        },
        Opcode::Put => {
            let header = rpc.request.get_range(REQUEST_HEADER_LEN, 16).map(|b| {
                (
                    u64::from_le_bytes(b[..8].try_into().unwrap()),
                    u64::from_le_bytes(b[8..].try_into().unwrap()),
                )
            });
            match header {
                Some((key, length))
                    if (rpc.request.size() as u64).checked_sub(PUT_HEADER_LEN as u64)
                        == Some(length) =>
                {
                    Box::new(PutTask {
                        ctx,
                        rpc: Some(rpc),
                        key,
                        value_len: length as usize,
                        value: None,
                        phase: PutPhase::Find,
                    })
                }
                _ => malformed(ctx, rpc),
            }
        }
        Opcode::Scan => {
            let header = rpc.request.get_range(REQUEST_HEADER_LEN, 16).map(|b| {
                (
                    u64::from_le_bytes(b[..8].try_into().unwrap()),
                    u64::from_le_bytes(b[8..].try_into().unwrap()),
                )
            });
            match header {
                Some((start, end)) if rpc.request.size() == REQUEST_HEADER_LEN + 16 => {
                    Box::new(ScanTask {
                        ctx,
                        rpc: Some(rpc),
                        end,
                        count: 0,
                        phase: ScanPhase::Init { start },
                    })
                }
                _ => malformed(ctx, rpc),
            }
        }
    }
}

fn read_key(rpc: &mut ServerRpc) -> Option<u64> {
    rpc.request
        .get_range(REQUEST_HEADER_LEN, 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

fn malformed(ctx: ServiceContext, rpc: Box<ServerRpc>) -> Box<dyn Task> {
    Box::new(ImmediateReply { ctx, rpc: Some(rpc), status: Status::MessageError })
}

/// Single-phase reply with a bare status.
struct ImmediateReply {
    ctx: ServiceContext,
    rpc: Option<Box<ServerRpc>>,
    status: Status,
}

impl Task for ImmediateReply {
    fn perform_task(&mut self) -> TaskPoll {
        let mut rpc = self.rpc.take().unwrap();
        set_response_status(&mut rpc.reply, self.status);
        self.ctx.worker.send_reply(rpc);
        TaskPoll::Done
    }
}

/// GET: one phase, linearized at the index load.
struct GetTask {
    ctx: ServiceContext,
    rpc: Option<Box<ServerRpc>>,
    key: u64,
}

impl Task for GetTask {
    fn perform_task(&mut self) -> TaskPoll {
        let mut rpc = self.rpc.take().unwrap();
        let node = self.ctx.store.list.find(self.key);
        let wrote = node
            .and_then(|node| {
                node.read_value(|value| {
                    rpc.reply.append(&(Status::Ok as u32).to_le_bytes());
                    rpc.reply.append(&(value.len() as u32).to_le_bytes());
                    rpc.reply.append(value);
                })
            })
            .is_some();
        if !wrote {
            rpc.reply.append(&(Status::ObjectDoesntExist as u32).to_le_bytes());
            rpc.reply.append(&0u32.to_le_bytes());
        }
        self.ctx.worker.send_reply(rpc);
        TaskPoll::Done
    }
}

#[derive(Clone, Copy)]
enum PutPhase {
    Find,
    Lock { node: NodeRef },
    /// Node lock held from here until the value is published.
    Write { node: NodeRef, barrier: u64 },
}

/// PUT: find (or create) the node, persist the record, publish the value.
struct PutTask {
    ctx: ServiceContext,
    rpc: Option<Box<ServerRpc>>,
    key: u64,
    value_len: usize,
    /// Built once under the node lock, applied after durability.
    value: Option<Box<ValueObject>>,
    phase: PutPhase,
}

impl Task for PutTask {
    fn perform_task(&mut self) -> TaskPoll {
        loop {
            match self.phase {
                PutPhase::Find => match self.ctx.store.list.add_or_get(self.key) {
                    AddOutcome::Retry => return TaskPoll::Pending,
                    AddOutcome::Found(node) | AddOutcome::Created(node) => {
                        self.phase = PutPhase::Lock { node };
                    }
                },
                PutPhase::Lock { node } => {
                    if !spin_try_lock(node) {
                        return TaskPoll::Pending;
                    }
                    if node.is_marked() {
                        // A delete took the node between find and lock.
                        node.unlock();
                        self.phase = PutPhase::Find;
                        continue;
                    }
                    let rpc = self.rpc.as_mut().unwrap();
                    let bytes = if self.value_len == 0 {
                        &[][..]
                    } else {
                        rpc.request.get_range(PUT_HEADER_LEN, self.value_len).unwrap()
                    };
                    self.value = Some(ValueObject::new(bytes));
                    let barrier = self.ctx.store.log_object(self.key, bytes);
                    self.phase = PutPhase::Write { node, barrier };
                }
                PutPhase::Write { node, barrier } => {
                    if !spin_sync(&self.ctx.store, barrier) {
                        return TaskPoll::Pending;
                    }
                    let old = node.set_value(self.value.take().unwrap());
                    node.unlock();
                    self.phase = PutPhase::Find; // lock no longer held; see Drop
                    if let Some(old) = old {
                        self.ctx.store.retire_value(old);
                    }
                    let mut rpc = self.rpc.take().unwrap();
                    set_response_status(&mut rpc.reply, Status::Ok);
                    self.ctx.worker.send_reply(rpc);
                    return TaskPoll::Done;
                }
            }
        }
    }
}

impl Drop for PutTask {
    fn drop(&mut self) {
        // An abandoned task must not leave the node lock held.
        if let PutPhase::Write { node, .. } = self.phase {
            node.unlock();
        }
    }
}

#[derive(Clone, Copy)]
enum ErasePhase {
    Find,
    Mark { node: NodeRef },
    /// Candidate lock held until the tombstone is durable.
    Write { node: NodeRef, barrier: u64 },
    Change { node: NodeRef },
    Delete { node: NodeRef },
}

/// ERASE: mark under lock (the linearization point), persist the
/// tombstone, reply, then unlink and retire as postprocessing.
struct EraseTask {
    ctx: ServiceContext,
    rpc: Option<Box<ServerRpc>>,
    key: u64,
    phase: ErasePhase,
}

impl EraseTask {
    fn reply_ok(&mut self) {
        let mut rpc = self.rpc.take().unwrap();
        set_response_status(&mut rpc.reply, Status::Ok);
        self.ctx.worker.send_reply(rpc);
    }
}

impl Task for EraseTask {
    fn perform_task(&mut self) -> TaskPoll {
        loop {
            match self.phase {
                ErasePhase::Find => match self.ctx.store.list.delete_candidate(self.key) {
                    None => {
                        // Deleting an absent key succeeds.
                        self.reply_ok();
                        return TaskPoll::Done;
                    }
                    Some(node) => self.phase = ErasePhase::Mark { node },
                },
                ErasePhase::Mark { node } => {
                    if !spin_try_lock(node) {
                        return TaskPoll::Pending;
                    }
                    if node.is_marked() {
                        // A concurrent erase won; same observable outcome.
                        node.unlock();
                        self.reply_ok();
                        return TaskPoll::Done;
                    }
                    node.set_marked();
                    let barrier = self.ctx.store.log_tombstone(self.key);
                    self.phase = ErasePhase::Write { node, barrier };
                }
                ErasePhase::Write { node, barrier } => {
                    if !spin_sync(&self.ctx.store, barrier) {
                        return TaskPoll::Pending;
                    }
                    node.unlock();
                    // Durable and marked: the delete is decided. Answer the
                    // client; the unlink continues as postprocessing.
                    self.reply_ok();
                    self.phase = ErasePhase::Change { node };
                }
                ErasePhase::Change { node } => match self.ctx.store.list.unlink(node) {
                    UnlinkOutcome::Retry => return TaskPoll::Pending,
                    UnlinkOutcome::Unlinked => self.phase = ErasePhase::Delete { node },
                },
                ErasePhase::Delete { node } => {
                    self.ctx.store.retire_node(RetiredNode(node));
                    return TaskPoll::Done;
                }
            }
        }
    }
}

impl Drop for EraseTask {
    fn drop(&mut self) {
        if let ErasePhase::Write { node, .. } = self.phase {
            node.unlock();
        }
    }
}

enum ScanPhase {
    Init { start: u64 },
    Collect { next: Option<NodeRef> },
}

/// SCAN: position at the range start, then emit bounded batches of
/// ⟨key, length, bytes⟩ triples, yielding between batches.
struct ScanTask {
    ctx: ServiceContext,
    rpc: Option<Box<ServerRpc>>,
    end: u64,
    count: u32,
    phase: ScanPhase,
}

impl Task for ScanTask {
    fn perform_task(&mut self) -> TaskPoll {
        loop {
            match &mut self.phase {
                ScanPhase::Init { start } => {
                    let start = *start;
                    let rpc = self.rpc.as_mut().unwrap();
                    // Status and item count get patched in at the end.
                    rpc.reply.alloc(8);
                    let first = self.ctx.store.list.lower_bound(start);
                    self.phase = ScanPhase::Collect { next: first };
                }
                ScanPhase::Collect { next } => {
                    let rpc = self.rpc.as_mut().unwrap();
                    let mut emitted = 0;
                    loop {
                        let Some(node) = *next else { break };
                        if node.key() > self.end {
                            *next = None;
                            break;
                        }
                        if emitted == SCAN_BATCH {
                            return TaskPoll::Pending;
                        }
                        let appended = node.read_value(|value| {
                            rpc.reply.append(&node.key().to_le_bytes());
                            rpc.reply.append(&(value.len() as u32).to_le_bytes());
                            rpc.reply.append(value);
                        });
                        if appended.is_some() {
                            self.count += 1;
                            emitted += 1;
                        }
                        *next = node.next();
                    }
                    let mut rpc = self.rpc.take().unwrap();
                    rpc.reply.copy_in(0, &(Status::Ok as u32).to_le_bytes());
                    rpc.reply.copy_in(4, &self.count.to_le_bytes());
                    self.ctx.worker.send_reply(rpc);
                    return TaskPoll::Done;
                }
            }
        }
    }
}

fn spin_try_lock(node: NodeRef) -> bool {
    for _ in 0..LOCK_SPIN {
        if node.try_lock() {
            return true;
        }
        std::hint::spin_loop();
    }
    false
}

fn spin_sync(store: &Store, barrier: u64) -> bool {
    for _ in 0..SYNC_SPIN {
        if store.log.sync(barrier) {
            return true;
        }
        std::hint::spin_loop();
    }
    false
}
