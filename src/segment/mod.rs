//! # Segment Files
//!
//! A segment is one backing file of the deque, named `<nonce>.<id>.pbd`,
//! holding a contiguous run of framed records. This module defines the
//! on-disk format, the segment contract shared by both backends, and the
//! helpers that encode and decode record payloads.
//!
//! ## File Format
//!
//! All integers are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       4     num_entries           (u32)
//! 4       4     uncompressed_bytes    (u32)  payload bytes only, no headers
//! 8       ...   records
//! ```
//!
//! Each record is framed as:
//!
//! ```text
//! 0   4   stored_length  (u32)   bytes of payload that follow
//! 4   4   flags          (u32)   bit 0: 1 = block-compressed payload
//! 8   N   payload        (stored_length bytes)
//! ```
//!
//! A compressed payload is the LZ4 block format with the uncompressed
//! length prepended as a little-endian u32, so the poll path can size its
//! output buffer before decompressing. Compression is attempted only when
//! the caller allows it and the input is natively addressable; a payload
//! that does not shrink is stored raw so the flag always reflects how the
//! codec produced the stored bytes.
//!
//! ## Capacity
//!
//! A segment accepts frames until `CHUNK_SIZE - 4` bytes of frames have
//! been written, so the largest single payload is
//! `CHUNK_SIZE - 4 - OBJECT_HEADER_BYTES`. Offers past that point report
//! "full" and the deque rotates to a fresh tail.
//!
//! ## Backends
//!
//! Two interchangeable implementations satisfy [`Segment`]:
//!
//! - [`regular::RegularSegment`]: positioned file I/O with a small
//!   in-memory frame buffer on the write path
//! - [`mmap::MmapSegment`]: a shared read-write mapping; uncompressed
//!   polls return zero-copy slices of the map
//!
//! Both produce byte-identical files once closed.

pub(crate) mod mmap;
pub(crate) mod regular;

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::buffer::{BufferAllocator, BufferHandle};

/// Maximum segment file growth before the deque rotates to a new tail.
pub const CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Bytes of frame header preceding every record payload.
pub const OBJECT_HEADER_BYTES: usize = 8;

/// Byte offset of the entry count within the segment header.
pub const COUNT_OFFSET: usize = 0;

/// Byte offset of the uncompressed-byte total within the segment header.
pub const SIZE_OFFSET: usize = 4;

/// Size of the segment header preceding the first record frame.
pub const SEGMENT_HEADER_BYTES: usize = 8;

pub const NO_FLAGS: u32 = 0;
pub const FLAG_COMPRESSED: u32 = 1;

/// Frame bytes a single segment accepts before reporting full.
pub(crate) const SEGMENT_FRAME_BUDGET: usize = CHUNK_SIZE - 4;

/// Largest single payload a segment can store.
pub const MAX_OBJECT_BYTES: usize = SEGMENT_FRAME_BUDGET - OBJECT_HEADER_BYTES;

/// Largest on-disk size of a segment file: header plus a full frame budget.
pub(crate) const MAX_SEGMENT_FILE_BYTES: u64 =
    (SEGMENT_HEADER_BYTES + SEGMENT_FRAME_BUDGET) as u64;

/// Flush threshold for the regular backend's write buffer.
pub(crate) const WRITE_BUFFER_FLUSH_BYTES: usize = 256 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct SegmentHeader {
    pub num_entries: U32,
    pub uncompressed_bytes: U32,
}

impl SegmentHeader {
    pub(crate) fn new(num_entries: u32, uncompressed_bytes: u32) -> Self {
        Self {
            num_entries: U32::new(num_entries),
            uncompressed_bytes: U32::new(uncompressed_bytes),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct FrameHeader {
    pub stored_length: U32,
    pub flags: U32,
}

impl FrameHeader {
    pub(crate) fn new(stored_length: u32, flags: u32) -> Self {
        Self {
            stored_length: U32::new(stored_length),
            flags: U32::new(flags),
        }
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.flags.get() & FLAG_COMPRESSED != 0
    }
}

pub(crate) fn parse_segment_header(bytes: &[u8]) -> Result<SegmentHeader> {
    ensure!(
        bytes.len() >= SEGMENT_HEADER_BYTES,
        "segment header truncated: {} < {} bytes",
        bytes.len(),
        SEGMENT_HEADER_BYTES
    );
    SegmentHeader::read_from_bytes(&bytes[..SEGMENT_HEADER_BYTES])
        .map_err(|e| eyre::eyre!("failed to parse segment header: {:?}", e))
}

pub(crate) fn parse_frame_header(bytes: &[u8]) -> Result<FrameHeader> {
    ensure!(
        bytes.len() >= OBJECT_HEADER_BYTES,
        "record frame header truncated: {} < {} bytes",
        bytes.len(),
        OBJECT_HEADER_BYTES
    );
    FrameHeader::read_from_bytes(&bytes[..OBJECT_HEADER_BYTES])
        .map_err(|e| eyre::eyre!("failed to parse record frame header: {:?}", e))
}

/// Produces the bytes to store for a payload, compressing when requested
/// and profitable. Returns the stored form and the frame flags.
pub(crate) fn encode_payload(payload: &[u8], compress: bool) -> (Cow<'_, [u8]>, u32) {
    if compress {
        let packed = lz4_flex::block::compress_prepend_size(payload);
        if packed.len() < payload.len() {
            return (Cow::Owned(packed), FLAG_COMPRESSED);
        }
    }
    (Cow::Borrowed(payload), NO_FLAGS)
}

/// Uncompressed length of a stored compressed payload, read from the
/// length prefix the compressor prepends.
pub(crate) fn uncompressed_length(stored: &[u8]) -> Result<usize> {
    ensure!(
        stored.len() >= 4,
        "compressed payload too short for its length prefix: {} bytes",
        stored.len()
    );
    let len = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    Ok(len as usize)
}

/// Decompresses a stored payload into a buffer obtained from `allocator`.
pub(crate) fn decompress_into_allocated(
    stored: &[u8],
    allocator: &dyn BufferAllocator,
) -> Result<(BufferHandle, usize)> {
    let expected = uncompressed_length(stored)?;
    let mut handle = allocator.allocate(expected);
    ensure!(
        handle.len() >= expected,
        "allocator returned {} bytes for a {}-byte record",
        handle.len(),
        expected
    );
    let written = lz4_flex::block::decompress_into(&stored[4..], &mut handle.bytes_mut()[..expected])
        .map_err(|e| eyre::eyre!("failed to decompress record payload: {}", e))?;
    ensure!(
        written == expected,
        "decompressed record length mismatch: {} != {}",
        written,
        expected
    );
    // An allocator may hand back more than asked for; the record's bytes
    // are exactly the uncompressed length.
    handle.truncate_len(expected);
    Ok((handle, expected))
}

pub(crate) fn segment_file_name(nonce: &str, segment_id: i64) -> String {
    format!("{}.{}.pbd", nonce, segment_id)
}

/// Parses a directory entry name of the form `<nonce>.<id>.pbd`. The nonce
/// may itself contain dots: the last two dot-separated components are the
/// id and the extension, everything before them is the nonce. Returns the
/// segment id, or None when the name does not belong to this deque.
pub(crate) fn parse_segment_file_name(nonce: &str, file_name: &str) -> Option<i64> {
    let parts: Vec<&str> = file_name.split('.').collect();
    if parts.len() < 3 || *parts.last()? != "pbd" {
        return None;
    }
    let id_part = parts[parts.len() - 2];
    let parsed_nonce = parts[..parts.len() - 2].join(".");
    if parsed_nonce != nonce {
        return None;
    }
    id_part.parse::<i64>().ok()
}

/// Write-path callback that serializes a record directly into a buffer
/// slice provided by the segment, avoiding an intermediate copy.
pub trait DeferredSerializer {
    /// Upper bound on the serialized size; the segment reserves this many
    /// bytes before invoking [`serialize`](Self::serialize).
    fn serialized_size(&self) -> Result<usize>;

    /// Writes the record into `out` and returns the number of bytes
    /// actually written (at most `serialized_size()`).
    fn serialize(&self, out: &mut [u8]) -> Result<usize>;
}

/// Contract implemented by both segment backends. The deque is the only
/// caller; segments never outlive it.
pub(crate) trait Segment: Send {
    fn segment_id(&self) -> i64;

    fn file_path(&self) -> &Path;

    /// Opens the segment. With `for_write` the file is created (fresh
    /// zeroed header) or reopened for append (cursor positioned past the
    /// last frame); without it the header is parsed and the read cursor
    /// rewinds to the first record.
    fn open(&mut self, for_write: bool) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Flushes writes, persists the header if it changed, compacts the
    /// consumed prefix when records were polled and no handles are
    /// outstanding, and releases the file handle.
    fn close(&mut self) -> Result<()>;

    /// Closes without further header maintenance and unlinks the file.
    fn close_and_delete(&mut self) -> Result<()>;

    /// Forces buffered writes and the header through to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Appends one record. Returns false when the frame does not fit and
    /// the caller must rotate to a new segment.
    fn offer(&mut self, payload: &[u8], compress: bool) -> Result<bool>;

    /// Appends one record produced by a deferred serializer. Returns the
    /// bytes written, or None when the reservation does not fit.
    fn offer_deferred(&mut self, serializer: &mut dyn DeferredSerializer)
        -> Result<Option<usize>>;

    /// Reads the record at the read cursor, advancing it. Returns None
    /// once every entry has been read.
    fn poll(&mut self, allocator: &dyn BufferAllocator) -> Result<Option<BufferHandle>>;

    fn num_entries(&self) -> u32;

    fn read_index(&self) -> u32;

    /// Sum of uncompressed payload sizes of the records not yet polled.
    fn uncompressed_bytes_to_read(&self) -> u64;

    /// Bytes of the file holding live data: the header plus every written
    /// frame. The file on disk may be larger while a write mapping
    /// reserves the full segment extent.
    fn logical_file_bytes(&self) -> u64;

    /// True while at least one polled handle has not been discarded.
    fn is_being_polled(&self) -> bool;

    /// Synchronizes in-memory accounting with a recovery rewrite of the
    /// backing file (new entry count, uncompressed total, and file size).
    fn note_truncation(&mut self, num_entries: u32, uncompressed_total: u64, file_bytes: u64);

    fn has_more_entries(&self) -> bool {
        self.read_index() < self.num_entries()
    }

    /// Fully consumed and unpinned: safe to delete once it is not the tail.
    fn is_drained(&self) -> bool {
        !self.has_more_entries() && !self.is_being_polled()
    }
}

/// Shared bookkeeping embedded in both backends.
pub(crate) struct SegmentState {
    pub segment_id: i64,
    pub num_entries: u32,
    pub read_index: u32,
    /// Frame bytes in the file (headers plus stored payloads).
    pub used: u64,
    /// Uncompressed payload bytes of every record in the file.
    pub uncompressed_total: u64,
    /// Uncompressed payload bytes of the records already polled.
    pub uncompressed_consumed: u64,
    /// Outstanding polled handles against this segment.
    pub pin: Arc<std::sync::atomic::AtomicUsize>,
}

impl SegmentState {
    pub(crate) fn new(segment_id: i64) -> Self {
        Self {
            segment_id,
            num_entries: 0,
            read_index: 0,
            used: 0,
            uncompressed_total: 0,
            uncompressed_consumed: 0,
            pin: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    pub(crate) fn reset_from_header(&mut self, header: &SegmentHeader, file_bytes: u64) {
        self.num_entries = header.num_entries.get();
        self.read_index = 0;
        self.used = file_bytes.saturating_sub(SEGMENT_HEADER_BYTES as u64);
        self.uncompressed_total = u64::from(header.uncompressed_bytes.get());
        self.uncompressed_consumed = 0;
    }

    pub(crate) fn header(&self) -> SegmentHeader {
        SegmentHeader::new(self.num_entries, self.uncompressed_total as u32)
    }

    pub(crate) fn bytes_to_read(&self) -> u64 {
        self.uncompressed_total - self.uncompressed_consumed
    }

    pub(crate) fn pinned(&self) -> bool {
        self.pin.load(std::sync::atomic::Ordering::Acquire) > 0
    }

    /// Remaining frame budget for one more record of `stored_len` bytes.
    pub(crate) fn fits(&self, stored_len: usize) -> bool {
        self.used + (OBJECT_HEADER_BYTES + stored_len) as u64 <= SEGMENT_FRAME_BUDGET as u64
    }

    /// Drops the consumed prefix from the accounting after the backend has
    /// rewritten the file to hold only unread records.
    pub(crate) fn collapse_consumed(&mut self) {
        self.num_entries -= self.read_index;
        self.read_index = 0;
        self.uncompressed_total -= self.uncompressed_consumed;
        self.uncompressed_consumed = 0;
    }

    pub(crate) fn apply_truncation(
        &mut self,
        num_entries: u32,
        uncompressed_total: u64,
        file_bytes: u64,
    ) {
        self.num_entries = num_entries;
        self.read_index = self.read_index.min(num_entries);
        self.uncompressed_total = uncompressed_total;
        self.uncompressed_consumed = self.uncompressed_consumed.min(uncompressed_total);
        self.used = file_bytes.saturating_sub(SEGMENT_HEADER_BYTES as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<SegmentHeader>(), SEGMENT_HEADER_BYTES);
        assert_eq!(std::mem::size_of::<FrameHeader>(), OBJECT_HEADER_BYTES);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let header = SegmentHeader::new(42, 9000);
        let parsed = parse_segment_header(header.as_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn frame_header_flags() {
        assert!(FrameHeader::new(10, FLAG_COMPRESSED).is_compressed());
        assert!(!FrameHeader::new(10, NO_FLAGS).is_compressed());
    }

    #[test]
    fn file_name_round_trip() {
        let name = segment_file_name("overflow", 17);
        assert_eq!(name, "overflow.17.pbd");
        assert_eq!(parse_segment_file_name("overflow", &name), Some(17));
    }

    #[test]
    fn file_name_negative_id() {
        let name = segment_file_name("overflow", -3);
        assert_eq!(parse_segment_file_name("overflow", &name), Some(-3));
    }

    #[test]
    fn file_name_dotted_nonce() {
        let name = segment_file_name("a.b.c", 5);
        assert_eq!(name, "a.b.c.5.pbd");
        assert_eq!(parse_segment_file_name("a.b.c", &name), Some(5));
        assert_eq!(parse_segment_file_name("a.b", &name), None);
    }

    #[test]
    fn file_name_rejects_foreign_entries() {
        assert_eq!(parse_segment_file_name("overflow", "other.3.pbd"), None);
        assert_eq!(parse_segment_file_name("overflow", "overflow.pbd"), None);
        assert_eq!(parse_segment_file_name("overflow", "overflow.3.tmp"), None);
        assert_eq!(parse_segment_file_name("overflow", "overflow.x.pbd"), None);
        assert_eq!(parse_segment_file_name("overflow", "notes.txt"), None);
    }

    #[test]
    fn encode_compressible_payload_sets_flag() {
        let payload = vec![7u8; 4096];
        let (stored, flags) = encode_payload(&payload, true);
        assert_eq!(flags, FLAG_COMPRESSED);
        assert!(stored.len() < payload.len());
        assert_eq!(uncompressed_length(&stored).unwrap(), payload.len());
    }

    #[test]
    fn encode_incompressible_payload_falls_back_to_raw() {
        // Too short for the block format to pay for its length prefix.
        let payload = b"abc";
        let (stored, flags) = encode_payload(payload, true);
        assert_eq!(flags, NO_FLAGS);
        assert_eq!(stored.as_ref(), payload);
    }

    #[test]
    fn encode_without_compression_is_identity() {
        let payload = vec![7u8; 4096];
        let (stored, flags) = encode_payload(&payload, false);
        assert_eq!(flags, NO_FLAGS);
        assert_eq!(stored.as_ref(), payload.as_slice());
    }

    #[test]
    fn segment_state_capacity_math() {
        let mut state = SegmentState::new(0);
        assert!(state.fits(MAX_OBJECT_BYTES));
        assert!(!state.fits(MAX_OBJECT_BYTES + 1));
        state.used = 100;
        assert!(!state.fits(MAX_OBJECT_BYTES));
    }

    #[test]
    fn segment_state_collapse_consumed() {
        let mut state = SegmentState::new(0);
        state.num_entries = 5;
        state.read_index = 2;
        state.uncompressed_total = 500;
        state.uncompressed_consumed = 200;
        state.collapse_consumed();
        assert_eq!(state.num_entries, 3);
        assert_eq!(state.read_index, 0);
        assert_eq!(state.uncompressed_total, 300);
        assert_eq!(state.bytes_to_read(), 300);
    }
}
