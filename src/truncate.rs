//! # Recovery Truncation
//!
//! After a crash the deque may end in a torn or logically incomplete
//! state: the last records written may never have been acknowledged
//! upstream. [`PersistentBinaryDeque::parse_and_truncate`] replays every
//! record front-to-back through a caller-supplied [`Truncator`], which
//! classifies each one:
//!
//! - **keep** (`Ok(None)`): the record is intact, keep scanning
//! - **[`TruncatorResponse::FullTruncate`]**: drop this record and
//!   everything after it
//! - **[`TruncatorResponse::PartialTruncate`]**: drop this record and
//!   everything after it, then write a replacement record in its place
//!
//! The boundary segment is rewritten in place: header updated to the kept
//! count and byte total, file truncated at the cut. The rewrite is not
//! atomic against a crash mid-rewrite; the recovery protocol tolerates
//! re-running truncation after such a crash.
//!
//! [`PersistentBinaryDeque::parse_and_truncate`]:
//!     crate::PersistentBinaryDeque::parse_and_truncate

use std::fs::OpenOptions;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::debug;
use zerocopy::IntoBytes;

use crate::segment::{
    parse_frame_header, parse_segment_header, uncompressed_length, FrameHeader, Segment,
    SegmentHeader, NO_FLAGS, OBJECT_HEADER_BYTES, SEGMENT_HEADER_BYTES,
};

/// Writes a replacement record payload into the slot vacated by a partial
/// truncation and returns the number of payload bytes written.
pub type ReplacementWriter = Box<dyn FnOnce(&mut [u8]) -> usize + Send>;

/// Verdict returned by a [`Truncator`] for one record.
pub enum TruncatorResponse {
    /// Discard this record and every record after it.
    FullTruncate,
    /// Discard this record and every record after it, then store the bytes
    /// produced by the writer in this record's place. The replacement must
    /// be at least one byte and fit the slice it is handed.
    PartialTruncate(ReplacementWriter),
}

impl TruncatorResponse {
    /// Partial truncation that replaces the record with the given bytes.
    pub fn replace_with(bytes: Vec<u8>) -> Self {
        TruncatorResponse::PartialTruncate(Box::new(move |out| {
            let len = bytes.len().min(out.len());
            out[..len].copy_from_slice(&bytes[..len]);
            len
        }))
    }
}

/// Caller-supplied classifier invoked per record during recovery. The
/// record bytes are always uncompressed, regardless of how the record is
/// stored. Errors propagate out of the recovery walk unchanged.
pub trait Truncator {
    fn parse(&mut self, record: &[u8]) -> Result<Option<TruncatorResponse>>;
}

/// Initial size of the scratch buffer compressed records are inflated
/// into; grown on demand to fit the largest record seen.
pub(crate) const INITIAL_SCRATCH_BYTES: usize = 512 * 1024;

/// Outcome of replaying one segment through the truncator.
#[derive(Debug)]
pub(crate) enum SegmentScan {
    /// Every record kept; keep scanning the next segment.
    Clean,
    /// The very first record was refused: the whole segment goes away.
    DeleteWhole,
    /// The file was rewritten in place; `removed_entries` records fell off.
    Truncated { removed_entries: i64 },
}

/// Replays one segment's records through the truncator and applies the
/// verdict to the backing file.
pub(crate) fn truncate_segment(
    segment: &mut dyn Segment,
    truncator: &mut dyn Truncator,
    scratch: &mut Vec<u8>,
) -> Result<SegmentScan> {
    let segment_id = segment.segment_id();
    let path = segment.file_path().to_path_buf();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .wrap_err_with(|| format!("failed to open segment file '{}'", path.display()))?;
    let mapped_bytes = file
        .metadata()
        .wrap_err_with(|| format!("failed to stat segment file '{}'", path.display()))?
        .len() as usize;
    ensure!(
        mapped_bytes >= SEGMENT_HEADER_BYTES,
        "segment file '{}' is truncated mid-header ({} bytes)",
        path.display(),
        mapped_bytes
    );
    // A segment open for write reserves the full segment extent on disk;
    // the walk must be bounded by the live extent, not the reservation,
    // or an out-of-range stored_length would be accepted as long as it
    // points into the zeroed reserve.
    let file_bytes = segment.logical_file_bytes() as usize;
    ensure!(
        file_bytes <= mapped_bytes,
        "segment file '{}' is shorter than its recorded extent ({} < {})",
        path.display(),
        mapped_bytes,
        file_bytes
    );

    // SAFETY: MmapMut::map_mut is unsafe because of external modification.
    // This is safe because:
    // 1. The deque lock is held for the whole walk; nothing else writes
    // 2. The deque owns its directory; no other process touches the file
    // 3. The mapping is dropped before the file is resized
    let mut map = unsafe { MmapMut::map_mut(&file) }
        .wrap_err_with(|| format!("failed to memory-map segment file '{}'", path.display()))?;

    let header = parse_segment_header(&map[..SEGMENT_HEADER_BYTES])?;
    let num_entries = header.num_entries.get();
    debug!(segment_id, num_entries, "replaying segment records");

    let mut pos = SEGMENT_HEADER_BYTES;
    let mut valid_bytes = 0u64;

    for index in 0..num_entries {
        ensure!(
            pos + OBJECT_HEADER_BYTES <= file_bytes,
            "record frame {} of segment {} extends beyond the file",
            index,
            segment_id
        );
        let frame = parse_frame_header(&map[pos..pos + OBJECT_HEADER_BYTES])?;
        let stored_len = frame.stored_length.get() as usize;
        let payload_start = pos + OBJECT_HEADER_BYTES;
        ensure!(
            payload_start + stored_len <= file_bytes,
            "record payload {} of segment {} extends beyond the file",
            index,
            segment_id
        );

        let (verdict, uncompressed_len) = {
            let stored = &map[payload_start..payload_start + stored_len];
            if frame.is_compressed() {
                let expected = uncompressed_length(stored)?;
                if scratch.len() < expected {
                    scratch.resize(expected, 0);
                }
                let written =
                    lz4_flex::block::decompress_into(&stored[4..], &mut scratch[..expected])
                        .map_err(|e| {
                            eyre::eyre!(
                                "failed to decompress record {} of segment {}: {}",
                                index,
                                segment_id,
                                e
                            )
                        })?;
                ensure!(
                    written == expected,
                    "decompressed record length mismatch: {} != {}",
                    written,
                    expected
                );
                (truncator.parse(&scratch[..expected])?, expected)
            } else {
                (truncator.parse(stored)?, stored_len)
            }
        };

        match verdict {
            None => {
                valid_bytes += uncompressed_len as u64;
                pos = payload_start + stored_len;
            }
            Some(TruncatorResponse::FullTruncate) => {
                if index == 0 {
                    return Ok(SegmentScan::DeleteWhole);
                }
                let header = SegmentHeader::new(index, valid_bytes as u32);
                map[..SEGMENT_HEADER_BYTES].copy_from_slice(header.as_bytes());
                map.flush()
                    .wrap_err("failed to flush truncated segment header")?;
                drop(map);
                file.set_len(pos as u64)
                    .wrap_err("failed to truncate segment at the cut point")?;
                segment.note_truncation(index, valid_bytes, pos as u64);
                return Ok(SegmentScan::Truncated {
                    removed_entries: i64::from(num_entries - index),
                });
            }
            Some(TruncatorResponse::PartialTruncate(writer)) => {
                let written = writer(&mut map[payload_start..file_bytes]);
                ensure!(
                    written >= 1,
                    "partial truncation must write at least one byte"
                );
                ensure!(
                    payload_start + written <= file_bytes,
                    "replacement record does not fit the remaining frame space"
                );
                let frame = FrameHeader::new(written as u32, NO_FLAGS);
                map[pos..pos + OBJECT_HEADER_BYTES].copy_from_slice(frame.as_bytes());
                valid_bytes += written as u64;
                let header = SegmentHeader::new(index + 1, valid_bytes as u32);
                map[..SEGMENT_HEADER_BYTES].copy_from_slice(header.as_bytes());
                let end = payload_start + written;
                map.flush()
                    .wrap_err("failed to flush replacement record")?;
                drop(map);
                file.set_len(end as u64)
                    .wrap_err("failed to truncate segment past the replacement")?;
                segment.note_truncation(index + 1, valid_bytes, end as u64);
                return Ok(SegmentScan::Truncated {
                    removed_entries: i64::from(num_entries - index - 1),
                });
            }
        }
    }

    Ok(SegmentScan::Clean)
}
