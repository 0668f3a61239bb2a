//! Regular-I/O segment backend: positioned reads and writes through a
//! `File` handle. Appended frames collect in a small in-memory buffer that
//! is written through when it grows past a threshold, on sync, on close,
//! or when the poll path needs to read past it. Polled records are copied
//! into freshly allocated buffers.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use zerocopy::IntoBytes;

use crate::buffer::{BufferAllocator, BufferHandle, DrainHook};

use super::{
    decompress_into_allocated, encode_payload, parse_frame_header, parse_segment_header,
    DeferredSerializer, Segment, SegmentHeader, SegmentState, NO_FLAGS, OBJECT_HEADER_BYTES,
    SEGMENT_HEADER_BYTES, WRITE_BUFFER_FLUSH_BYTES,
};

pub(crate) struct RegularSegment {
    state: SegmentState,
    path: PathBuf,
    file: Option<File>,
    for_write: bool,
    /// Frame bytes already written through to the file.
    flushed: u64,
    /// File offset of the next frame the poll path will read.
    read_pos: u64,
    /// Frames accepted by offer but not yet written to the file.
    write_buf: Vec<u8>,
    header_dirty: bool,
    synced: bool,
}

impl RegularSegment {
    pub(crate) fn new(segment_id: i64, path: PathBuf) -> Self {
        Self {
            state: SegmentState::new(segment_id),
            path,
            file: None,
            for_write: false,
            flushed: 0,
            read_pos: SEGMENT_HEADER_BYTES as u64,
            write_buf: Vec::new(),
            header_dirty: false,
            synced: true,
        }
    }

    fn open_file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(self.for_write)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to open segment file '{}'", self.path.display()))
    }

    fn read_header(file: &mut File, path: &Path) -> Result<SegmentHeader> {
        let mut bytes = [0u8; SEGMENT_HEADER_BYTES];
        file.seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to segment header")?;
        file.read_exact(&mut bytes)
            .wrap_err_with(|| format!("failed to read segment header of '{}'", path.display()))?;
        parse_segment_header(&bytes)
    }

    fn write_header(file: &mut File, header: SegmentHeader) -> Result<()> {
        file.seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to segment header")?;
        file.write_all(header.as_bytes())
            .wrap_err("failed to write segment header")
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        let id = self.state.segment_id;
        self.file
            .as_mut()
            .ok_or_else(|| eyre::eyre!("segment {} is closed", id))
    }

    fn flush_frames(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let offset = SEGMENT_HEADER_BYTES as u64 + self.flushed;
        let buffered = std::mem::take(&mut self.write_buf);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek to the append position")?;
        file.write_all(&buffered)
            .wrap_err("failed to write buffered record frames")?;
        self.flushed += buffered.len() as u64;
        // Keep the allocation for the next batch of frames.
        self.write_buf = buffered;
        self.write_buf.clear();
        Ok(())
    }

    fn append_frame(&mut self, stored: &[u8], flags: u32, uncompressed_len: usize) -> Result<()> {
        let frame = super::FrameHeader::new(stored.len() as u32, flags);
        self.write_buf.extend_from_slice(frame.as_bytes());
        self.write_buf.extend_from_slice(stored);
        self.state.used += (OBJECT_HEADER_BYTES + stored.len()) as u64;
        self.state.num_entries += 1;
        self.state.uncompressed_total += uncompressed_len as u64;
        self.header_dirty = true;
        self.synced = false;
        if self.write_buf.len() >= WRITE_BUFFER_FLUSH_BYTES {
            self.flush_frames()?;
        }
        Ok(())
    }

    /// Rewrites the file so that only unread frames remain, making read
    /// progress durable across a clean close and reopen.
    fn compact_consumed(&mut self) -> Result<()> {
        let consumed = self.read_pos - SEGMENT_HEADER_BYTES as u64;
        let remaining = self.state.used - consumed;
        let read_pos = self.read_pos;
        let file = self.file_mut()?;
        let mut frames = vec![0u8; remaining as usize];
        file.seek(SeekFrom::Start(read_pos))
            .wrap_err("failed to seek to the first unread frame")?;
        file.read_exact(&mut frames)
            .wrap_err("failed to read unread frames for compaction")?;
        file.seek(SeekFrom::Start(SEGMENT_HEADER_BYTES as u64))
            .wrap_err("failed to seek past the segment header")?;
        file.write_all(&frames)
            .wrap_err("failed to rewrite unread frames")?;
        self.state.collapse_consumed();
        self.state.used = remaining;
        let header = self.state.header();
        let file = self.file_mut()?;
        Self::write_header(file, header)?;
        file.set_len(SEGMENT_HEADER_BYTES as u64 + remaining)
            .wrap_err("failed to truncate compacted segment")?;
        self.flushed = remaining;
        self.read_pos = SEGMENT_HEADER_BYTES as u64;
        self.header_dirty = false;
        Ok(())
    }
}

impl Segment for RegularSegment {
    fn segment_id(&self) -> i64 {
        self.state.segment_id
    }

    fn file_path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self, for_write: bool) -> Result<()> {
        ensure!(
            self.file.is_none(),
            "segment {} is already open",
            self.state.segment_id
        );
        self.for_write = for_write;
        let mut file = self.open_file()?;
        let file_bytes = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat segment file '{}'", self.path.display()))?
            .len();

        if file_bytes >= SEGMENT_HEADER_BYTES as u64 {
            let header = Self::read_header(&mut file, &self.path)?;
            self.state.reset_from_header(&header, file_bytes);
            // A file reopened for append may carry writes that were never
            // forced to stable storage.
            self.synced = !for_write;
        } else if for_write && file_bytes == 0 {
            Self::write_header(&mut file, SegmentHeader::new(0, 0))?;
            self.state
                .reset_from_header(&SegmentHeader::new(0, 0), SEGMENT_HEADER_BYTES as u64);
            self.synced = false;
        } else {
            eyre::bail!(
                "segment file '{}' is truncated mid-header ({} bytes)",
                self.path.display(),
                file_bytes
            );
        }
        self.flushed = self.state.used;
        self.read_pos = SEGMENT_HEADER_BYTES as u64;
        self.header_dirty = false;
        self.file = Some(file);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.flush_frames()?;
        if self.state.read_index > 0 && !self.state.pinned() {
            self.compact_consumed()?;
        } else if self.header_dirty {
            let header = self.state.header();
            Self::write_header(self.file_mut()?, header)?;
            self.header_dirty = false;
        }
        self.file = None;
        self.for_write = false;
        Ok(())
    }

    fn close_and_delete(&mut self) -> Result<()> {
        self.file = None;
        self.write_buf.clear();
        fs::remove_file(&self.path)
            .wrap_err_with(|| format!("failed to delete segment file '{}'", self.path.display()))
    }

    fn sync(&mut self) -> Result<()> {
        if self.synced || self.file.is_none() {
            return Ok(());
        }
        self.flush_frames()?;
        if self.header_dirty {
            let header = self.state.header();
            Self::write_header(self.file_mut()?, header)?;
            self.header_dirty = false;
        }
        self.file_mut()?
            .sync_data()
            .wrap_err_with(|| format!("failed to sync segment file '{}'", self.path.display()))?;
        self.synced = true;
        Ok(())
    }

    fn offer(&mut self, payload: &[u8], compress: bool) -> Result<bool> {
        ensure!(
            self.file.is_some() && self.for_write,
            "segment {} is not open for append",
            self.state.segment_id
        );
        let (stored, flags) = encode_payload(payload, compress);
        if !self.state.fits(stored.len()) {
            return Ok(false);
        }
        self.append_frame(&stored, flags, payload.len())?;
        Ok(true)
    }

    fn offer_deferred(
        &mut self,
        serializer: &mut dyn DeferredSerializer,
    ) -> Result<Option<usize>> {
        ensure!(
            self.file.is_some() && self.for_write,
            "segment {} is not open for append",
            self.state.segment_id
        );
        let reserved = serializer.serialized_size()?;
        if !self.state.fits(reserved) {
            return Ok(None);
        }
        let mut scratch = vec![0u8; reserved];
        let written = serializer.serialize(&mut scratch)?;
        ensure!(
            written <= reserved,
            "deferred serializer wrote {} bytes into a {}-byte reservation",
            written,
            reserved
        );
        self.append_frame(&scratch[..written], NO_FLAGS, written)?;
        Ok(Some(written))
    }

    fn poll(&mut self, allocator: &dyn BufferAllocator) -> Result<Option<BufferHandle>> {
        if !self.has_more_entries() {
            return Ok(None);
        }
        self.flush_frames()?;
        let read_pos = self.read_pos;
        let segment_id = self.state.segment_id;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(read_pos))
            .wrap_err("failed to seek to the next unread frame")?;
        let mut frame_bytes = [0u8; OBJECT_HEADER_BYTES];
        file.read_exact(&mut frame_bytes)
            .wrap_err_with(|| format!("failed to read record frame in segment {}", segment_id))?;
        let frame = parse_frame_header(&frame_bytes)?;
        let stored_len = frame.stored_length.get() as usize;
        let mut stored = vec![0u8; stored_len];
        file.read_exact(&mut stored)
            .wrap_err_with(|| format!("failed to read record payload in segment {}", segment_id))?;

        let (mut handle, uncompressed_len) = if frame.is_compressed() {
            decompress_into_allocated(&stored, allocator)?
        } else {
            let len = stored.len();
            (BufferHandle::from(stored), len)
        };

        self.read_pos += (OBJECT_HEADER_BYTES + stored_len) as u64;
        self.state.read_index += 1;
        self.state.uncompressed_consumed += uncompressed_len as u64;
        self.state.pin.fetch_add(1, Ordering::AcqRel);
        handle.set_drain(DrainHook::new(Arc::clone(&self.state.pin), segment_id));
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
        debug_assert!(
            self.write_buf.is_empty(),
            "segment truncated with unflushed frames"
        );
        self.write_buf.clear();
        self.state
            .apply_truncation(num_entries, uncompressed_total, file_bytes);
        self.flushed = self.state.used;
        self.read_pos = self
            .read_pos
            .min(SEGMENT_HEADER_BYTES as u64 + self.state.used);
        self.header_dirty = false;
    }
}
