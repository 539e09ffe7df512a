//! Write-ahead log: an append-only record of object writes and tombstones.
//!
//! # On-disk format
//!
//! The file is the raw concatenation of records, with no file header, no
//! checksums, and no segment markers:
//!
//! ```text
//! +---------+----------+-------------+---------------+
//! | type:u8 | key:u64  | length:u32  | value bytes   |   OBJ record
//! +---------+----------+-------------+---------------+
//! | type:u8 | key:u64  |                                 TOMB record
//! +---------+----------+
//! ```
//!
//! Integers are little-endian. Recovery reads records sequentially and
//! treats the first short read as end-of-log; a torn trailing record is
//! discarded before new appends.
//!
//! # In-memory pipeline
//!
//! Appends land in fixed-capacity in-memory segments queued oldest-first.
//! `append` serializes under the log lock and returns the post-append byte
//! offset: the caller's durability barrier. A dedicated writer thread moves
//! segment bytes to the file (opened `O_SYNC`, so completed writes are
//! stable) and advances the synced watermark; `sync` is a non-blocking
//! check against it that callers poll, yielding between checks. Any write
//! failure is a durability violation and aborts the process.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;
use crate::wire::MAX_RPC_LEN;

const RECORD_OBJ: u8 = 0;
const RECORD_TOMB: u8 = 1;

/// Writer idle backoff ceiling, in microseconds.
const POLL_USEC: u64 = 10_000;

/// One durable mutation, borrowed from the request being persisted.
pub enum LogEntry<'a> {
    Object { key: u64, value: &'a [u8] },
    Tombstone { key: u64 },
}

impl LogEntry<'_> {
    pub fn encoded_len(&self) -> usize {
        match self {
            LogEntry::Object { value, .. } => 1 + 8 + 4 + value.len(),
            LogEntry::Tombstone { .. } => 1 + 8,
        }
    }

    fn encode_into(&self, dest: &mut [u8]) {
        match self {
            LogEntry::Object { key, value } => {
                dest[0] = RECORD_OBJ;
                dest[1..9].copy_from_slice(&key.to_le_bytes());
                dest[9..13].copy_from_slice(&(value.len() as u32).to_le_bytes());
                dest[13..13 + value.len()].copy_from_slice(value);
            }
            LogEntry::Tombstone { key } => {
                dest[0] = RECORD_TOMB;
                dest[1..9].copy_from_slice(&key.to_le_bytes());
            }
        }
    }
}

/// Fixed-capacity staging buffer for a contiguous slice of the log.
struct Segment {
    data: Box<[u8]>,
    /// Bytes appended so far.
    len: usize,
    /// Bytes already handed to the kernel.
    write_offset: usize,
}

impl Segment {
    fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity].into_boxed_slice(), len: 0, write_offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.len
    }
}

struct LogInner {
    /// Front = oldest not fully written, back = current append target.
    segments: Vec<Segment>,
    appended: u64,
}

struct LogShared {
    inner: Mutex<LogInner>,
    synced: AtomicU64,
    shutdown: AtomicBool,
    file: File,
}

/// The segmented append log plus its writer thread.
pub struct Log {
    shared: Arc<LogShared>,
    segment_size: usize,
    writer: Option<std::thread::JoinHandle<()>>,
}

impl Log {
    /// Opens the log file for appending and starts the writer thread.
    ///
    /// `preserve_len` is `None` for a fresh log (the file is truncated to
    /// zero) or `Some(n)` after recovery, keeping the first `n` valid bytes
    /// and discarding any torn tail beyond them.
    pub fn open(path: &Path, segment_size: usize, preserve_len: Option<u64>) -> Result<Log> {
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)?;
        let start_len = preserve_len.unwrap_or(0);
        file.set_len(start_len)?;
        file.seek(SeekFrom::Start(start_len))?;

        let shared = Arc::new(LogShared {
            inner: Mutex::new(LogInner { segments: Vec::new(), appended: start_len }),
            synced: AtomicU64::new(start_len),
            shutdown: AtomicBool::new(false),
            file,
        });
        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("gungnir-wal".into())
                .spawn(move || writer_main(shared))?
        };
        Ok(Log { shared, segment_size, writer: Some(writer) })
    }

    /// Serializes `entry` into the tail segment and returns the post-append
    /// offset to pass to [`Log::sync`].
    pub fn append(&self, entry: &LogEntry) -> u64 {
        let len = entry.encoded_len();
        let mut inner = self.shared.inner.lock();
        let needs_segment = match inner.segments.last() {
            Some(tail) => tail.remaining() < len,
            None => true,
        };
        if needs_segment {
            // An entry larger than the default capacity gets a dedicated
            // segment sized to fit it.
            inner.segments.push(Segment::with_capacity(self.segment_size.max(len)));
        }
        let tail = inner.segments.last_mut().unwrap();
        entry.encode_into(&mut tail.data[tail.len..tail.len + len]);
        tail.len += len;
        inner.appended += len as u64;
        inner.appended
    }

    /// True once every byte at offsets <= `offset` is on stable storage.
    pub fn sync(&self, offset: u64) -> bool {
        offset <= self.shared.synced.load(Ordering::Acquire)
    }

    pub fn appended_len(&self) -> u64 {
        self.shared.inner.lock().appended
    }

    pub fn synced_len(&self) -> u64 {
        self.shared.synced.load(Ordering::Acquire)
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Writer thread: one `write(2)` per pass over the oldest unwritten bytes,
/// a randomized sub-10ms sleep when there are none.
fn writer_main(shared: Arc<LogShared>) {
    let mut rng = SmallRng::from_entropy();
    loop {
        let (data, len) = {
            let inner = shared.inner.lock();
            match inner.segments.first() {
                Some(head) if head.len > head.write_offset => {
                    (unsafe { head.data.as_ptr().add(head.write_offset) }, head.len - head.write_offset)
                }
                _ => (std::ptr::null(), 0),
            }
        };

        if len == 0 {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(Duration::from_micros(rng.gen_range(0..POLL_USEC / 10 + 1)));
            continue;
        }

        // Safe to read outside the lock: bytes below `len` are immutable
        // once appended, and only this thread retires segments.
        let pending = unsafe { std::slice::from_raw_parts(data, len) };
        let written = (&shared.file).write(pending);
        let written = match written {
            Ok(n) if n > 0 => n,
            Ok(_) => fatal("write-ahead log write returned zero bytes"),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => fatal(&format!("write-ahead log write failed: {err}")),
        };

        let mut inner = shared.inner.lock();
        let head = inner.segments.first_mut().unwrap();
        head.write_offset += written;
        shared.synced.fetch_add(written as u64, Ordering::Release);
        if head.write_offset == head.len && inner.segments.len() > 1 {
            inner.segments.remove(0);
        }
    }
}

/// A durability violation cannot be recovered in-process.
fn fatal(message: &str) -> ! {
    tracing::error!("fatal write-ahead log failure: {message}");
    std::process::abort();
}

/// One record replayed from disk.
#[derive(Debug, PartialEq, Eq)]
pub enum Record {
    Object { key: u64, value: Vec<u8> },
    Tombstone { key: u64 },
}

/// Sequential reader over a log file. Iteration ends cleanly at the first
/// short or implausible record; [`Replay::valid_len`] reports how many
/// bytes formed complete records.
pub struct Replay {
    reader: BufReader<File>,
    valid_len: u64,
    done: bool,
}

impl Replay {
    pub fn open(path: &Path) -> Result<Replay> {
        let file = File::open(path)?;
        Ok(Replay { reader: BufReader::new(file), valid_len: 0, done: false })
    }

    /// Bytes consumed by complete records so far (all of them, once the
    /// iterator returns None).
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    fn read_record(&mut self) -> Result<Option<Record>> {
        let kind = match self.reader.read_u8() {
            Ok(kind) => kind,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let key = match self.reader.read_u64::<LittleEndian>() {
            Ok(key) => key,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match kind {
            RECORD_TOMB => {
                self.valid_len += 9;
                Ok(Some(Record::Tombstone { key }))
            }
            RECORD_OBJ => {
                let len = match self.reader.read_u32::<LittleEndian>() {
                    Ok(len) => len,
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                // A length no append could have produced means we are
                // reading garbage; stop as at end-of-log.
                if len > MAX_RPC_LEN {
                    return Ok(None);
                }
                let mut value = vec![0u8; len as usize];
                match self.reader.read_exact(&mut value) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(err) => return Err(err.into()),
                }
                self.valid_len += 13 + len as u64;
                Ok(Some(Record::Object { key, value }))
            }
            _ => Ok(None),
        }
    }
}

impl Iterator for Replay {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::time::Instant;

    fn await_sync(log: &Log, offset: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !log.sync(offset) {
            assert!(Instant::now() < deadline, "sync barrier {offset} never reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn append_returns_increasing_barriers() {
        let file = NamedTempFile::new().unwrap();
        let log = Log::open(file.path(), 1024, None).unwrap();

        let first = log.append(&LogEntry::Object { key: 1, value: b"abc" });
        let second = log.append(&LogEntry::Tombstone { key: 1 });
        assert_eq!(first, 13 + 3);
        assert_eq!(second, first + 9);
        assert_eq!(log.appended_len(), second);
        await_sync(&log, second);
    }

    #[test]
    fn synced_bytes_match_serialized_records() {
        let file = NamedTempFile::new().unwrap();
        let log = Log::open(file.path(), 1024, None).unwrap();
        let barrier = log.append(&LogEntry::Object { key: 0x1122334455667788, value: b"hi" });
        log.append(&LogEntry::Tombstone { key: 2 });
        let last = log.append(&LogEntry::Object { key: 3, value: &[] });
        await_sync(&log, last);

        let raw = std::fs::read(file.path()).unwrap();
        let mut expected = Vec::new();
        expected.push(RECORD_OBJ);
        expected.extend_from_slice(&0x1122334455667788u64.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"hi");
        expected.push(RECORD_TOMB);
        expected.extend_from_slice(&2u64.to_le_bytes());
        expected.push(RECORD_OBJ);
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(raw, expected);
        assert_eq!(barrier, 15);
    }

    #[test]
    fn segment_rollover_preserves_order() {
        let file = NamedTempFile::new().unwrap();
        // Tiny segments force frequent rollover.
        let log = Log::open(file.path(), 64, None).unwrap();
        let mut last = 0;
        for key in 0..200u64 {
            last = log.append(&LogEntry::Object { key, value: &key.to_le_bytes() });
        }
        await_sync(&log, last);
        drop(log);

        let records: Vec<Record> =
            Replay::open(file.path()).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 200);
        for (i, record) in records.iter().enumerate() {
            let key = i as u64;
            assert_eq!(record, &Record::Object { key, value: key.to_le_bytes().to_vec() });
        }
    }

    #[test]
    fn oversized_entry_gets_its_own_segment() {
        let file = NamedTempFile::new().unwrap();
        let log = Log::open(file.path(), 64, None).unwrap();
        let big = vec![0xabu8; 5000];
        let barrier = log.append(&LogEntry::Object { key: 9, value: &big });
        await_sync(&log, barrier);
        drop(log);

        let mut replay = Replay::open(file.path()).unwrap();
        let record = replay.next().unwrap().unwrap();
        assert_eq!(record, Record::Object { key: 9, value: big });
        assert!(replay.next().is_none());
    }

    #[test]
    fn sync_is_monotone_and_bounded_by_appended() {
        let file = NamedTempFile::new().unwrap();
        let log = Log::open(file.path(), 1024, None).unwrap();
        assert!(log.sync(0));
        assert!(!log.sync(1));
        let barrier = log.append(&LogEntry::Tombstone { key: 4 });
        assert!(log.synced_len() <= log.appended_len());
        await_sync(&log, barrier);
        assert!(log.sync(barrier));
        assert_eq!(log.synced_len(), log.appended_len());
    }

    #[test]
    fn replay_stops_at_torn_record() {
        let file = NamedTempFile::new().unwrap();
        let log = Log::open(file.path(), 1024, None).unwrap();
        let barrier = log.append(&LogEntry::Object { key: 1, value: b"whole" });
        await_sync(&log, barrier);
        drop(log);

        // A record announcing more bytes than the file holds.
        let mut raw = std::fs::OpenOptions::new().append(true).open(file.path()).unwrap();
        raw.write_all(&[RECORD_OBJ]).unwrap();
        raw.write_all(&7u64.to_le_bytes()).unwrap();
        raw.write_all(&100u32.to_le_bytes()).unwrap();
        raw.write_all(b"short").unwrap();
        drop(raw);

        let mut replay = Replay::open(file.path()).unwrap();
        let records: Vec<Record> = replay.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![Record::Object { key: 1, value: b"whole".to_vec() }]);
        assert_eq!(replay.valid_len(), barrier);
    }

    #[test]
    fn preserved_open_truncates_torn_tail_and_appends() {
        let file = NamedTempFile::new().unwrap();
        {
            let log = Log::open(file.path(), 1024, None).unwrap();
            let barrier = log.append(&LogEntry::Object { key: 1, value: b"keep" });
            await_sync(&log, barrier);
        }
        // Simulate a crash mid-append.
        let mut raw = std::fs::OpenOptions::new().append(true).open(file.path()).unwrap();
        raw.write_all(&[RECORD_OBJ, 1, 2, 3]).unwrap();
        drop(raw);

        let mut replay = Replay::open(file.path()).unwrap();
        assert_eq!(replay.by_ref().count(), 1);
        let valid = replay.valid_len();

        let log = Log::open(file.path(), 1024, Some(valid)).unwrap();
        let barrier = log.append(&LogEntry::Tombstone { key: 1 });
        assert_eq!(barrier, valid + 9);
        await_sync(&log, barrier);
        drop(log);

        let records: Vec<Record> =
            Replay::open(file.path()).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(
            records,
            vec![
                Record::Object { key: 1, value: b"keep".to_vec() },
                Record::Tombstone { key: 1 },
            ]
        );
    }
}
