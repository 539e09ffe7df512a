//! Gungnir: an in-memory ordered key-value store with a persistent
//! write-ahead log, served over a binary TCP protocol.
//!
//! Keys are 64-bit unsigned integers, values opaque byte strings. The
//! server supports point lookups, insert-or-replace, deletes, and ordered
//! range scans. The data plane is a fine-grained-locked concurrent skip
//! list with epoch-based reclamation; durability comes from a segmented
//! append-only log with an asynchronous writer and fsync-barrier
//! semantics. A single dispatch thread drives all socket I/O and feeds a
//! pool of worker threads, each running a cooperative task queue so
//! multi-phase requests wait without occupying their thread.

pub mod buffer;
pub mod cleaner;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod server;
pub mod service;
pub mod skiplist;
pub mod store;
pub mod task;
pub mod transport;
pub mod wire;
pub mod worker;

#[cfg(test)]
pub mod tmpfs;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use server::{Server, ServerHandle};
pub use wire::Status;
