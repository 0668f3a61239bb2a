//! # Memory-Mapped Segment Backend
//!
//! Maps the segment file read-write and serves both paths through the
//! mapping: appends advance a position cursor within the map, and
//! uncompressed polls hand out zero-copy slices of it. The mapping is
//! shared through an `Arc` so a polled slice stays valid after the deque
//! closes the segment; the map is unmapped when the last reference (the
//! segment's own or a handle's) is dropped.
//!
//! A segment opened for write maps the full segment extent up front and is
//! truncated back to its used size on close, so the two backends produce
//! byte-identical files.
//!
//! ## Safety Model
//!
//! The raw mapping is mutated through `*mut u8` while earlier, disjoint
//! regions may be visible through polled slices. This is sound because:
//!
//! 1. All writes happen under the deque lock, one writer at a time
//! 2. A write only ever touches bytes past every frame that has been
//!    published to a reader (the append cursor is strictly increasing)
//! 3. Compaction, the one overlapping rewrite, runs only when no polled
//!    handle pins the mapping

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapRaw;
use zerocopy::IntoBytes;

use crate::buffer::{BufferAllocator, BufferHandle, DrainHook};

use super::{
    decompress_into_allocated, encode_payload, parse_frame_header, parse_segment_header,
    DeferredSerializer, FrameHeader, Segment, SegmentHeader, SegmentState,
    MAX_SEGMENT_FILE_BYTES, NO_FLAGS, OBJECT_HEADER_BYTES, SEGMENT_HEADER_BYTES,
};

/// A shared read-write mapping of one segment file.
pub(crate) struct SegmentMap {
    raw: MmapRaw,
    len: usize,
}

impl SegmentMap {
    fn map(file: &File, len: usize, path: &Path) -> Result<Self> {
        // The raw mapping never hands out slices by itself, so creating it
        // is safe; every access goes through slice()/write() below, which
        // bounds-check against the mapped length. The deque owns its
        // directory for the process lifetime, and the file length is fixed
        // before mapping and only changed again after the map is dropped
        // (or, on close, after a flush with all accesses inside the new
        // length).
        let raw = MmapRaw::map_raw(file)
            .wrap_err_with(|| format!("failed to memory-map segment file '{}'", path.display()))?;
        Ok(Self { raw, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "segment map read out of bounds: {}+{} > {}",
            offset,
            len,
            self.len
        );
        // SAFETY: the range was bounds-checked against the mapping, which
        // stays valid for the lifetime of self.
        unsafe { slice::from_raw_parts(self.raw.as_ptr().add(offset), len) }
    }

    fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset
                .checked_add(bytes.len())
                .is_some_and(|end| end <= self.len),
            "segment map write out of bounds: {}+{} > {}",
            offset,
            bytes.len(),
            self.len
        );
        // SAFETY: bounds-checked above; writes run under the deque lock and
        // only touch bytes no reader-visible slice covers (see module doc).
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.raw.as_mut_ptr().add(offset), bytes.len()) };
    }

    /// Mutable view of an unpublished region, for deferred serializers.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the region is disjoint from every slice
    /// handed out by [`slice`](Self::slice) and that no concurrent access
    /// to the region exists (the deque lock provides this).
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "segment map write out of bounds: {}+{} > {}",
            offset,
            len,
            self.len
        );
        slice::from_raw_parts_mut(self.raw.as_mut_ptr().add(offset), len)
    }

    fn copy_within(&self, src_offset: usize, len: usize, dst_offset: usize) {
        assert!(src_offset + len <= self.len && dst_offset + len <= self.len);
        // SAFETY: both ranges are within the mapping; ptr::copy handles the
        // overlap. Callers run this only while no polled slice is live.
        unsafe {
            ptr::copy(
                self.raw.as_ptr().add(src_offset),
                self.raw.as_mut_ptr().add(dst_offset),
                len,
            )
        };
    }

    fn flush(&self) -> Result<()> {
        self.raw.flush().wrap_err("failed to flush segment mapping")
    }

    #[cfg(unix)]
    fn advise_willneed(&self) {
        // SAFETY: madvise is a hint over a range we know is mapped; it does
        // not affect memory safety even if the kernel ignores it.
        unsafe {
            libc::madvise(
                self.raw.as_mut_ptr() as *mut libc::c_void,
                self.len,
                libc::MADV_WILLNEED,
            );
        }
    }

    #[cfg(not(unix))]
    fn advise_willneed(&self) {}
}

pub(crate) struct MmapSegment {
    state: SegmentState,
    path: PathBuf,
    file: Option<File>,
    map: Option<Arc<SegmentMap>>,
    for_write: bool,
    /// Map offset of the next frame the poll path will read.
    read_pos: usize,
    header_dirty: bool,
    synced: bool,
}

impl MmapSegment {
    pub(crate) fn new(segment_id: i64, path: PathBuf) -> Self {
        Self {
            state: SegmentState::new(segment_id),
            path,
            file: None,
            map: None,
            for_write: false,
            read_pos: SEGMENT_HEADER_BYTES,
            header_dirty: false,
            synced: true,
        }
    }

    fn map_ref(&self) -> Result<&Arc<SegmentMap>> {
        let id = self.state.segment_id;
        self.map
            .as_ref()
            .ok_or_else(|| eyre::eyre!("segment {} is closed", id))
    }

    fn append_cursor(&self) -> usize {
        SEGMENT_HEADER_BYTES + self.state.used as usize
    }

    fn write_header(&mut self, header: SegmentHeader) -> Result<()> {
        self.map_ref()?.write(0, header.as_bytes());
        self.header_dirty = false;
        Ok(())
    }

    /// Slides unread frames to the front of the map and shrinks the file,
    /// making read progress durable across a clean close and reopen.
    fn compact_consumed(&mut self) -> Result<()> {
        let remaining = (self.state.used as usize) - (self.read_pos - SEGMENT_HEADER_BYTES);
        self.map_ref()?
            .copy_within(self.read_pos, remaining, SEGMENT_HEADER_BYTES);
        self.state.collapse_consumed();
        self.state.used = remaining as u64;
        self.read_pos = SEGMENT_HEADER_BYTES;
        let header = self.state.header();
        self.write_header(header)
    }
}

impl Segment for MmapSegment {
    fn segment_id(&self) -> i64 {
        self.state.segment_id
    }

    fn file_path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self, for_write: bool) -> Result<()> {
        ensure!(
            self.map.is_none(),
            "segment {} is already open",
            self.state.segment_id
        );
        self.for_write = for_write;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(for_write)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to open segment file '{}'", self.path.display()))?;
        let file_bytes = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat segment file '{}'", self.path.display()))?
            .len();

        if for_write {
            ensure!(
                file_bytes == 0 || file_bytes >= SEGMENT_HEADER_BYTES as u64,
                "segment file '{}' is truncated mid-header ({} bytes)",
                self.path.display(),
                file_bytes
            );
            // Reserve the full segment extent so appends never remap; the
            // file is trimmed back to its used size on close.
            file.set_len(MAX_SEGMENT_FILE_BYTES).wrap_err_with(|| {
                format!("failed to extend segment file '{}'", self.path.display())
            })?;
            let map = SegmentMap::map(&file, MAX_SEGMENT_FILE_BYTES as usize, &self.path)?;
            if file_bytes >= SEGMENT_HEADER_BYTES as u64 {
                let header = parse_segment_header(map.slice(0, SEGMENT_HEADER_BYTES))?;
                self.state.reset_from_header(&header, file_bytes);
                // A file reopened for append may carry writes that were
                // never forced to stable storage.
                self.synced = false;
            } else {
                map.write(0, SegmentHeader::new(0, 0).as_bytes());
                self.state
                    .reset_from_header(&SegmentHeader::new(0, 0), SEGMENT_HEADER_BYTES as u64);
                self.synced = false;
            }
            self.map = Some(Arc::new(map));
        } else {
            ensure!(
                file_bytes >= SEGMENT_HEADER_BYTES as u64,
                "segment file '{}' is truncated mid-header ({} bytes)",
                self.path.display(),
                file_bytes
            );
            let map = SegmentMap::map(&file, file_bytes as usize, &self.path)?;
            map.advise_willneed();
            let header = parse_segment_header(map.slice(0, SEGMENT_HEADER_BYTES))?;
            self.state.reset_from_header(&header, file_bytes);
            self.synced = true;
            self.map = Some(Arc::new(map));
        }
        self.read_pos = SEGMENT_HEADER_BYTES;
        self.header_dirty = false;
        self.file = Some(file);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.map.is_none()
    }

    fn close(&mut self) -> Result<()> {
        if self.map.is_none() {
            return Ok(());
        }
        let shrink = if self.state.read_index > 0 && !self.state.pinned() {
            self.compact_consumed()?;
            true
        } else {
            if self.header_dirty {
                let header = self.state.header();
                self.write_header(header)?;
            }
            self.for_write
        };
        self.map_ref()?.flush()?;
        if shrink {
            let target = SEGMENT_HEADER_BYTES as u64 + self.state.used;
            let id = self.state.segment_id;
            self.file
                .as_ref()
                .ok_or_else(|| eyre::eyre!("segment {} lost its file handle", id))?
                .set_len(target)
                .wrap_err_with(|| {
                    format!("failed to trim segment file '{}'", self.path.display())
                })?;
        }
        self.map = None;
        self.file = None;
        self.for_write = false;
        Ok(())
    }

    fn close_and_delete(&mut self) -> Result<()> {
        self.map = None;
        self.file = None;
        fs::remove_file(&self.path)
            .wrap_err_with(|| format!("failed to delete segment file '{}'", self.path.display()))
    }

    fn sync(&mut self) -> Result<()> {
        if self.synced || self.map.is_none() {
            return Ok(());
        }
        if self.header_dirty {
            let header = self.state.header();
            self.write_header(header)?;
        }
        self.map_ref()?.flush()?;
        self.synced = true;
        Ok(())
    }

    fn offer(&mut self, payload: &[u8], compress: bool) -> Result<bool> {
        ensure!(
            self.map.is_some() && self.for_write,
            "segment {} is not open for append",
            self.state.segment_id
        );
        let (stored, flags) = encode_payload(payload, compress);
        if !self.state.fits(stored.len()) {
            return Ok(false);
        }
        let cursor = self.append_cursor();
        let map = self.map_ref()?;
        map.write(
            cursor,
            FrameHeader::new(stored.len() as u32, flags).as_bytes(),
        );
        map.write(cursor + OBJECT_HEADER_BYTES, &stored);
        self.state.used += (OBJECT_HEADER_BYTES + stored.len()) as u64;
        self.state.num_entries += 1;
        self.state.uncompressed_total += payload.len() as u64;
        self.header_dirty = true;
        self.synced = false;
        Ok(true)
    }

    fn offer_deferred(
        &mut self,
        serializer: &mut dyn DeferredSerializer,
    ) -> Result<Option<usize>> {
        ensure!(
            self.map.is_some() && self.for_write,
            "segment {} is not open for append",
            self.state.segment_id
        );
        let reserved = serializer.serialized_size()?;
        if !self.state.fits(reserved) {
            return Ok(None);
        }
        let cursor = self.append_cursor();
        let map = self.map_ref()?;
        // SAFETY: the reservation lies past every published frame and the
        // deque lock excludes concurrent access (see slice_mut contract).
        let out = unsafe { map.slice_mut(cursor + OBJECT_HEADER_BYTES, reserved) };
        let written = serializer.serialize(out)?;
        ensure!(
            written <= reserved,
            "deferred serializer wrote {} bytes into a {}-byte reservation",
            written,
            reserved
        );
        map.write(cursor, FrameHeader::new(written as u32, NO_FLAGS).as_bytes());
        self.state.used += (OBJECT_HEADER_BYTES + written) as u64;
        self.state.num_entries += 1;
        self.state.uncompressed_total += written as u64;
        self.header_dirty = true;
        self.synced = false;
        Ok(Some(written))
    }

    fn poll(&mut self, allocator: &dyn BufferAllocator) -> Result<Option<BufferHandle>> {
        if !self.has_more_entries() {
            return Ok(None);
        }
        let map = Arc::clone(self.map_ref()?);
        ensure!(
            self.read_pos + OBJECT_HEADER_BYTES <= map.len(),
            "record frame in segment {} extends beyond the mapped file",
            self.state.segment_id
        );
        let frame = parse_frame_header(map.slice(self.read_pos, OBJECT_HEADER_BYTES))?;
        let stored_len = frame.stored_length.get() as usize;
        let payload_offset = self.read_pos + OBJECT_HEADER_BYTES;
        ensure!(
            payload_offset + stored_len <= map.len(),
            "record payload in segment {} extends beyond the mapped file",
            self.state.segment_id
        );

        let (mut handle, uncompressed_len) = if frame.is_compressed() {
            decompress_into_allocated(map.slice(payload_offset, stored_len), allocator)?
        } else {
            (
                BufferHandle::mapped(Arc::clone(&map), payload_offset, stored_len),
                stored_len,
            )
        };

        self.read_pos = payload_offset + stored_len;
        self.state.read_index += 1;
        self.state.uncompressed_consumed += uncompressed_len as u64;
        self.state.pin.fetch_add(1, Ordering::AcqRel);
        handle.set_drain(DrainHook::new(
            Arc::clone(&self.state.pin),
            self.state.segment_id,
        ));
        Ok(Some(handle))
    }

    fn num_entries(&self) -> u32 {
        self.state.num_entries
    }

    fn read_index(&self) -> u32 {
        self.state.read_index
    }

    fn uncompressed_bytes_to_read(&self) -> u64 {
        self.state.bytes_to_read()
    }

    fn logical_file_bytes(&self) -> u64 {
        SEGMENT_HEADER_BYTES as u64 + self.state.used
    }

    fn is_being_polled(&self) -> bool {
        self.state.pinned()
    }

    fn note_truncation(&mut self, num_entries: u32, uncompressed_total: u64, file_bytes: u64) {
        self.state
            .apply_truncation(num_entries, uncompressed_total, file_bytes);
        self.read_pos = self
            .read_pos
            .min(SEGMENT_HEADER_BYTES + self.state.used as usize);
        self.header_dirty = false;
    }
}
