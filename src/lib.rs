//! # pbdeque - Persistent Binary Deque
//!
//! A durable, crash-tolerant, double-ended queue of opaque binary records
//! backed by a directory of segment files. pbdeque is the on-disk spill
//! buffer of a database export/overflow path: producers append serialized
//! records at the tail, a consumer polls records from the head, and the
//! whole queue survives process restart by rescanning its directory.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pbdeque::{DirectBufferAllocator, PersistentBinaryDeque};
//!
//! let pbd = PersistentBinaryDeque::builder("export_overflow", "./spill")
//!     .delete_empty(true)
//!     .open()?;
//!
//! pbd.offer(&b"hello".to_vec().into())?;
//! pbd.sync()?;
//!
//! if let Some(mut record) = pbd.poll(&DirectBufferAllocator)? {
//!     consume(record.bytes());
//!     record.discard();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   PersistentBinaryDeque (deque)      │  offer / push / poll / truncate
//! ├──────────────────────────────────────┤
//! │   Segment contract (segment)         │  ordered segment files
//! ├──────────────────┬───────────────────┤
//! │  RegularSegment  │   MmapSegment     │  interchangeable backends
//! ├──────────────────┴───────────────────┤
//! │   Buffer handles (buffer)            │  exactly-once release
//! └──────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Each deque owns a directory of `<nonce>.<id>.pbd` files:
//!
//! ```text
//! spill_dir/
//! ├── export_overflow.0.pbd    # front segment, polled first
//! ├── export_overflow.1.pbd    # finished middle segment
//! └── export_overflow.2.pbd    # tail (write) segment, open for append
//! ```
//!
//! Segment ids are dense; a gap found at reopen is a fatal inconsistency.
//! Segments grow to [`CHUNK_SIZE`] and then a new tail is created. A
//! segment is deleted once every record in it has been polled and every
//! handle returned by poll has been discarded.
//!
//! ## Crash Recovery
//!
//! After a restart the caller may invoke
//! [`PersistentBinaryDeque::parse_and_truncate`] with a [`Truncator`] that
//! replays each record and decides where the known-good tail boundary lies.
//! Records past the boundary are dropped, the boundary segment is rewritten
//! in place, and a fresh tail is appended.
//!
//! ## Module Overview
//!
//! - [`buffer`]: buffer handles with exactly-once release, and allocators
//! - [`segment`]: on-disk format, segment contract, both backends
//! - [`deque`]: the deque itself
//! - [`truncate`]: the recovery truncation protocol

pub mod buffer;
pub mod deque;
pub mod segment;
pub mod truncate;

pub use buffer::{BufferAllocator, BufferHandle, DirectBufferAllocator, HeapBufferAllocator};
pub use deque::{Builder, PersistentBinaryDeque};
pub use segment::{DeferredSerializer, CHUNK_SIZE, MAX_OBJECT_BYTES, OBJECT_HEADER_BYTES};
pub use truncate::{Truncator, TruncatorResponse};
