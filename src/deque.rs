//! # Persistent Binary Deque
//!
//! The deque owns an ordered run of segment files inside one directory.
//! Producers append records at the tail with `offer`, a consumer drains
//! them from the head with `poll`, and `push` prepends records ahead of
//! everything already queued. All state needed to resume after a restart
//! lives in the segment files themselves: construction rescans the
//! directory, reopens the surviving segments in id order, and appends a
//! fresh write segment.
//!
//! ## Lifecycle
//!
//! ```text
//! offer ──► tail segment ──(full)──► rotate: new tail, old tail closed
//! poll  ──► front segment ──(drained + discarded)──► file deleted
//! push  ──► new head segments with ids below the current front
//! ```
//!
//! Segment ids are dense within `[front, tail]`. Finding a gap at reopen
//! means files were lost and construction fails rather than silently
//! skipping records.
//!
//! ## Concurrency
//!
//! A single `parking_lot::Mutex` serializes every public operation; the
//! deque is a single-consumer, single-producer-at-a-time structure by
//! contract. `num_objects` and `initialized_from_existing_files` read
//! atomics without the lock. Buffer handles returned by `poll` escape the
//! critical section; their discard path re-enters the lock to run the
//! delete-when-drained check and tolerates running after close, or after
//! the deque itself is gone.
//!
//! ## File Descriptors
//!
//! Finished segments are kept closed: rotation closes the previous tail
//! unless a polled handle pins it, pushed head segments are written and
//! closed immediately, and `poll` reopens a closed segment only when it is
//! that segment's turn to be read.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, LazyLock};

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::buffer::{BufferAllocator, BufferHandle, DrainObserver};
use crate::segment::mmap::MmapSegment;
use crate::segment::regular::RegularSegment;
use crate::segment::{
    parse_segment_file_name, segment_file_name, DeferredSerializer, Segment, MAX_OBJECT_BYTES,
    OBJECT_HEADER_BYTES, SEGMENT_FRAME_BUDGET,
};
use crate::truncate::{truncate_segment, SegmentScan, Truncator, INITIAL_SCRATCH_BYTES};

/// Process-wide backend default, read once from the environment. A builder
/// can override it per deque.
static USE_MMAP_DEFAULT: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("PBD_USE_MMAP")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

fn new_segment(use_mmap: bool, segment_id: i64, path: PathBuf) -> Box<dyn Segment> {
    if use_mmap {
        Box::new(MmapSegment::new(segment_id, path))
    } else {
        Box::new(RegularSegment::new(segment_id, path))
    }
}

/// Configures and opens a [`PersistentBinaryDeque`].
pub struct Builder {
    nonce: String,
    directory: PathBuf,
    delete_empty: bool,
    memory_mapped: Option<bool>,
}

impl Builder {
    /// Delete zero-entry segment files found during the directory scan.
    pub fn delete_empty(mut self, delete_empty: bool) -> Self {
        self.delete_empty = delete_empty;
        self
    }

    /// Select the memory-mapped segment backend (or the regular-I/O one
    /// with `false`). Defaults to the `PBD_USE_MMAP` environment toggle.
    pub fn memory_mapped(mut self, memory_mapped: bool) -> Self {
        self.memory_mapped = Some(memory_mapped);
        self
    }

    /// Scans the directory, reopens surviving segments in id order, and
    /// appends a fresh write segment.
    pub fn open(self) -> Result<PersistentBinaryDeque> {
        let Builder {
            nonce,
            directory,
            delete_empty,
            memory_mapped,
        } = self;
        let use_mmap = memory_mapped.unwrap_or(*USE_MMAP_DEFAULT);
        validate_directory(&directory)?;

        let mut discovered: BTreeMap<i64, Box<dyn Segment>> = BTreeMap::new();
        let mut num_objects: i64 = 0;
        let mut initialized_from_existing_files = false;

        for entry in fs::read_dir(&directory)
            .wrap_err_with(|| format!("failed to list deque directory '{}'", directory.display()))?
        {
            let entry = entry.wrap_err("failed to read a deque directory entry")?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(segment_id) = parse_segment_file_name(&nonce, name) else {
                continue;
            };
            let path = entry.path();
            let file_bytes = entry
                .metadata()
                .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
                .len();
            if file_bytes == 4 {
                // An abandoned header that never got its size field.
                let _ = fs::remove_file(&path);
                continue;
            }

            let mut segment = new_segment(use_mmap, segment_id, path);
            segment.open(false)?;
            initialized_from_existing_files = true;
            if delete_empty && segment.num_entries() == 0 {
                info!(nonce = %nonce, segment_id, "removing empty segment found at startup");
                segment.close_and_delete()?;
                continue;
            }
            num_objects += i64::from(segment.num_entries());
            segment.close()?;
            discovered.insert(segment_id, segment);
        }

        let mut previous: Option<i64> = None;
        for &segment_id in discovered.keys() {
            if let Some(previous) = previous {
                ensure!(
                    previous + 1 == segment_id,
                    "missing {} pbd segments between {} and {} in directory '{}'; \
                     the segment files on disk are inconsistent",
                    nonce,
                    previous,
                    segment_id,
                    directory.display()
                );
            }
            previous = Some(segment_id);
        }

        let write_segment_id = discovered.keys().next_back().map_or(0, |id| id + 1);
        let mut segments: VecDeque<Box<dyn Segment>> = discovered.into_values().collect();
        let mut tail = new_segment(
            use_mmap,
            write_segment_id,
            directory.join(segment_file_name(&nonce, write_segment_id)),
        );
        tail.open(true)?;
        segments.push_back(tail);

        let deque = PersistentBinaryDeque {
            shared: Arc::new(Shared {
                nonce,
                directory,
                use_mmap,
                initialized_from_existing_files,
                closed: AtomicBool::new(false),
                num_objects: AtomicI64::new(num_objects),
                state: Mutex::new(State { segments }),
            }),
        };
        deque.assert_invariants(&deque.shared.state.lock());
        Ok(deque)
    }
}

/// The directory must exist, be a directory, and be readable, writable
/// and searchable; anything less fails here rather than as a confusing
/// I/O error from the scan or a later segment open.
fn validate_directory(directory: &Path) -> Result<()> {
    let metadata = fs::metadata(directory).wrap_err_with(|| {
        format!(
            "'{}' is not usable as a deque directory (missing or inaccessible)",
            directory.display()
        )
    })?;
    ensure!(
        metadata.is_dir(),
        "'{}' is not usable as a deque directory (not a directory)",
        directory.display()
    );
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;

        let path = std::ffi::CString::new(directory.as_os_str().as_bytes())
            .wrap_err("directory path contains an interior NUL byte")?;
        // SAFETY: access() only reads the NUL-terminated path string.
        let usable =
            unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK | libc::X_OK) } == 0;
        ensure!(
            usable,
            "'{}' is not usable as a deque directory (not readable, writable and searchable)",
            directory.display()
        );
    }
    #[cfg(not(unix))]
    ensure!(
        !metadata.permissions().readonly(),
        "'{}' is not usable as a deque directory (not writable)",
        directory.display()
    );
    Ok(())
}

struct State {
    /// Segments in id order; the last one is always the write segment.
    segments: VecDeque<Box<dyn Segment>>,
}

struct Shared {
    nonce: String,
    directory: PathBuf,
    use_mmap: bool,
    initialized_from_existing_files: bool,
    closed: AtomicBool,
    /// Unread records across all segments; readable without the lock.
    num_objects: AtomicI64,
    state: Mutex<State>,
}

impl Shared {
    fn segment_path(&self, segment_id: i64) -> PathBuf {
        self.directory
            .join(segment_file_name(&self.nonce, segment_id))
    }
}

impl DrainObserver for Shared {
    fn handle_released(&self, segment_id: i64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(position) = state
            .segments
            .iter()
            .position(|segment| segment.segment_id() == segment_id)
        else {
            return;
        };
        // The write segment is never deleted by the poll path.
        if position == state.segments.len() - 1 {
            return;
        }
        if !state.segments[position].is_drained() {
            return;
        }
        if let Some(mut segment) = state.segments.remove(position) {
            if let Err(err) = segment.close_and_delete() {
                error!(
                    nonce = %self.nonce,
                    segment_id,
                    error = %err,
                    "failed to delete drained segment"
                );
            }
        }
    }
}

/// A durable double-ended queue of opaque binary records, backed by a
/// directory of segment files. See the [module docs](self) for the
/// lifecycle and concurrency model.
pub struct PersistentBinaryDeque {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PersistentBinaryDeque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBinaryDeque").finish()
    }
}

impl PersistentBinaryDeque {
    /// Starts configuring a deque over `directory` whose segment files are
    /// prefixed with `nonce`.
    pub fn builder(nonce: impl Into<String>, directory: impl Into<PathBuf>) -> Builder {
        Builder {
            nonce: nonce.into(),
            directory: directory.into(),
            delete_empty: true,
            memory_mapped: None,
        }
    }

    pub fn nonce(&self) -> &str {
        &self.shared.nonce
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    /// Unread records across all segments. Lock-free; no ordering
    /// guarantee against concurrent operations.
    pub fn num_objects(&self) -> i64 {
        self.shared.num_objects.load(Ordering::Acquire)
    }

    /// True when the construction scan found segment files from an
    /// earlier run.
    pub fn initialized_from_existing_files(&self) -> bool {
        self.shared.initialized_from_existing_files
    }

    fn locked(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.shared.state.lock();
        ensure!(
            !self.shared.closed.load(Ordering::Acquire),
            "persistent binary deque '{}' is closed",
            self.shared.nonce
        );
        Ok(state)
    }

    fn tail_mut<'a>(&self, state: &'a mut State) -> Result<&'a mut Box<dyn Segment>> {
        state
            .segments
            .back_mut()
            .ok_or_else(|| eyre::eyre!("deque '{}' has no write segment", self.shared.nonce))
    }

    /// Appends one record at the tail, compressing when profitable.
    pub fn offer(&self, object: &BufferHandle) -> Result<()> {
        self.offer_with_compression(object, true)
    }

    /// Appends one record at the tail. Compression is attempted only when
    /// `allow_compression` is set and the buffer is natively addressable.
    pub fn offer_with_compression(
        &self,
        object: &BufferHandle,
        allow_compression: bool,
    ) -> Result<()> {
        let mut state = self.locked()?;
        self.assert_invariants(&state);
        let compress = allow_compression && object.is_direct();
        let payload = object.bytes();

        let tail = self.tail_mut(&mut state)?;
        if !tail.offer(payload, compress)? {
            self.add_segment(&mut state)?;
            let tail = self.tail_mut(&mut state)?;
            ensure!(
                tail.offer(payload, compress)?,
                "failed to append a {}-byte object after rotating to a fresh segment",
                payload.len()
            );
        }
        self.shared.num_objects.fetch_add(1, Ordering::AcqRel);
        self.assert_invariants(&state);
        Ok(())
    }

    /// Appends one record produced by a deferred serializer, letting it
    /// write straight into the segment. Returns the bytes written.
    pub fn offer_deferred(&self, serializer: &mut dyn DeferredSerializer) -> Result<usize> {
        let mut state = self.locked()?;
        self.assert_invariants(&state);

        let tail = self.tail_mut(&mut state)?;
        let written = match tail.offer_deferred(serializer)? {
            Some(written) => written,
            None => {
                self.add_segment(&mut state)?;
                let tail = self.tail_mut(&mut state)?;
                tail.offer_deferred(serializer)?.ok_or_else(|| {
                    eyre::eyre!("failed to append a deferred object after rotating to a fresh segment")
                })?
            }
        };
        self.shared.num_objects.fetch_add(1, Ordering::AcqRel);
        self.assert_invariants(&state);
        Ok(written)
    }

    /// Rotates to a fresh write segment. A drained old tail is deleted
    /// first (its id is reused so ids on disk stay dense); otherwise the
    /// old tail is closed unless a polled handle pins it.
    fn add_segment(&self, state: &mut State) -> Result<()> {
        let tail = self.tail_mut(state)?;
        let old_id = tail.segment_id();
        let mut next_id = old_id + 1;
        if tail.is_drained() {
            let mut old = state
                .segments
                .pop_back()
                .ok_or_else(|| eyre::eyre!("deque '{}' has no write segment", self.shared.nonce))?;
            old.close_and_delete()?;
            next_id = old_id;
        }
        if let Some(previous) = state.segments.back_mut() {
            if !previous.is_being_polled() && !previous.is_closed() {
                previous.close()?;
            }
        }
        let mut segment = new_segment(
            self.shared.use_mmap,
            next_id,
            self.shared.segment_path(next_id),
        );
        segment.open(true)?;
        state.segments.push_back(segment);
        Ok(())
    }

    /// Atomically prepends records ahead of everything queued. Pushed
    /// records are returned by subsequent polls in the order given here,
    /// before any record present when the push began.
    pub fn push(&self, objects: &[BufferHandle]) -> Result<()> {
        let mut state = self.locked()?;
        self.assert_invariants(&state);
        if objects.is_empty() {
            return Ok(());
        }

        // Partition greedily into batches that each fit one segment.
        let mut batches: Vec<Vec<&BufferHandle>> = Vec::new();
        let mut current: Vec<&BufferHandle> = Vec::new();
        let mut available = SEGMENT_FRAME_BUDGET as u64;
        for object in objects {
            let needed = (OBJECT_HEADER_BYTES + object.len()) as u64;
            ensure!(
                needed <= SEGMENT_FRAME_BUDGET as u64,
                "maximum object size is {} bytes",
                MAX_OBJECT_BYTES
            );
            if needed > available {
                batches.push(std::mem::take(&mut current));
                available = SEGMENT_FRAME_BUDGET as u64;
            }
            available -= needed;
            current.push(object);
        }
        batches.push(current);

        // Ascending ids ending just below the current front, so polls see
        // the pushed records in the order they were passed.
        let front_id = state
            .segments
            .front()
            .map(|segment| segment.segment_id())
            .ok_or_else(|| eyre::eyre!("deque '{}' has no segments", self.shared.nonce))?;
        let mut segment_id = front_id - batches.len() as i64;
        let mut pushed: Vec<Box<dyn Segment>> = Vec::with_capacity(batches.len());
        for batch in &batches {
            let mut segment = new_segment(
                self.shared.use_mmap,
                segment_id,
                self.shared.segment_path(segment_id),
            );
            segment.open(true)?;
            for object in batch {
                ensure!(
                    segment.offer(object.bytes(), false)?,
                    "pushed object does not fit a fresh segment"
                );
                self.shared.num_objects.fetch_add(1, Ordering::AcqRel);
            }
            // Pushed segments are read-only; the write segment stays put.
            segment.close()?;
            pushed.push(segment);
            segment_id += 1;
        }
        for segment in pushed.into_iter().rev() {
            state.segments.push_front(segment);
        }
        self.assert_invariants(&state);
        Ok(())
    }

    /// Returns the oldest unread record, or None when the deque is empty.
    /// The handle stays valid until discarded; discarding the last handle
    /// of a fully consumed non-tail segment deletes that segment's file.
    pub fn poll(&self, allocator: &dyn BufferAllocator) -> Result<Option<BufferHandle>> {
        let mut state = self.locked()?;
        self.assert_invariants(&state);

        let mut polled = None;
        for segment in state.segments.iter_mut() {
            if segment.is_closed() {
                segment.open(false)?;
            }
            if segment.has_more_entries() {
                polled = segment.poll(allocator)?;
                break;
            }
        }
        let Some(mut handle) = polled else {
            return Ok(None);
        };
        self.shared.num_objects.fetch_sub(1, Ordering::AcqRel);
        let observer: Arc<dyn DrainObserver> = self.shared.clone() as Arc<dyn DrainObserver>;
        handle.set_drain_observer(Arc::downgrade(&observer));
        self.assert_invariants(&state);
        Ok(Some(handle))
    }

    /// Forces every open segment through to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.locked()?;
        for segment in state.segments.iter_mut() {
            if !segment.is_closed() {
                segment.sync()?;
            }
        }
        Ok(())
    }

    /// True when no segment holds an unread record. Briefly opens closed
    /// segments to consult their headers.
    pub fn is_empty(&self) -> Result<bool> {
        let mut state = self.locked()?;
        self.assert_invariants(&state);
        for segment in state.segments.iter_mut() {
            let was_closed = segment.is_closed();
            if was_closed {
                segment.open(false)?;
            }
            let has_more = segment.has_more_entries();
            if was_closed {
                segment.close()?;
            }
            if has_more {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sum of uncompressed payload bytes not yet polled. Briefly opens
    /// closed segments to consult their headers.
    pub fn size_in_bytes(&self) -> Result<u64> {
        let mut state = self.locked()?;
        let mut size = 0u64;
        for segment in state.segments.iter_mut() {
            let was_closed = segment.is_closed();
            if was_closed {
                segment.open(false)?;
            }
            size += segment.uncompressed_bytes_to_read();
            if was_closed {
                segment.close()?;
            }
        }
        Ok(size)
    }

    /// Closes every segment and marks the deque unusable. Outstanding
    /// polled handles stay valid; discarding them only releases storage.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for segment in state.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the deque and unlinks every segment file.
    pub fn close_and_delete(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for segment in state.segments.iter_mut() {
            segment.close_and_delete()?;
        }
        Ok(())
    }

    /// Replays every record front-to-back through `truncator` and trims
    /// the queue at the first non-keep verdict: the boundary segment is
    /// rewritten in place, every segment past it is deleted, and a fresh
    /// write segment is appended. A walk with no verdict leaves the deque
    /// untouched.
    pub fn parse_and_truncate(&self, truncator: &mut dyn Truncator) -> Result<()> {
        let mut state = self.locked()?;
        self.assert_invariants(&state);
        debug!(
            nonce = %self.shared.nonce,
            segments = state.segments.len(),
            "scanning for a truncation point"
        );

        let mut scratch = vec![0u8; INITIAL_SCRATCH_BYTES];
        let mut last_kept: Option<i64> = None;
        for segment in state.segments.iter_mut() {
            if !segment.is_closed() {
                if segment.is_being_polled() {
                    // Cannot close under a live handle; flush so the file
                    // is complete before it is mapped.
                    segment.sync()?;
                } else {
                    segment.close()?;
                }
            }
            match truncate_segment(segment.as_mut(), truncator, &mut scratch)? {
                SegmentScan::Clean => continue,
                SegmentScan::DeleteWhole => {
                    last_kept = Some(segment.segment_id() - 1);
                    break;
                }
                SegmentScan::Truncated { removed_entries } => {
                    self.shared
                        .num_objects
                        .fetch_sub(removed_entries, Ordering::AcqRel);
                    last_kept = Some(segment.segment_id());
                    break;
                }
            }
        }

        let Some(last_kept) = last_kept else {
            // Nothing to cut: put the tail back the way it was.
            if let Some(tail) = state.segments.back_mut() {
                if tail.is_closed() {
                    tail.open(true)?;
                }
            }
            self.assert_invariants(&state);
            return Ok(());
        };

        // Delete everything strictly past the boundary, tail first.
        loop {
            let Some(back_id) = state.segments.back().map(|s| s.segment_id()) else {
                break;
            };
            if back_id <= last_kept {
                break;
            }
            let Some(mut segment) = state.segments.pop_back() else {
                break;
            };
            let unread = i64::from(segment.num_entries() - segment.read_index());
            self.shared.num_objects.fetch_sub(unread, Ordering::AcqRel);
            segment.close_and_delete()?;
        }

        let next_id = state
            .segments
            .back()
            .map_or(0, |segment| segment.segment_id() + 1);
        let mut tail = new_segment(
            self.shared.use_mmap,
            next_id,
            self.shared.segment_path(next_id),
        );
        tail.open(true)?;
        state.segments.push_back(tail);
        self.assert_invariants(&state);
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self, state: &State) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let expected: i64 = state
            .segments
            .iter()
            .map(|segment| i64::from(segment.num_entries() - segment.read_index()))
            .sum();
        let actual = self.shared.num_objects.load(Ordering::Acquire);
        debug_assert_eq!(
            expected, actual,
            "object count diverged from segment accounting"
        );
    }

    #[cfg(not(debug_assertions))]
    fn assert_invariants(&self, _state: &State) {}
}

impl Drop for PersistentBinaryDeque {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(
                nonce = %self.shared.nonce,
                error = %err,
                "failed to close deque during drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_fails_for_a_missing_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = PersistentBinaryDeque::builder("q", &missing)
            .open()
            .unwrap_err();
        assert!(err.to_string().contains("not usable"));
    }

    #[test]
    fn open_fails_when_the_directory_is_a_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("plain");
        fs::write(&file_path, b"not a directory").unwrap();
        let err = PersistentBinaryDeque::builder("q", &file_path)
            .open()
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn fresh_deque_creates_a_single_write_segment() {
        let dir = tempdir().unwrap();
        let pbd = PersistentBinaryDeque::builder("q", dir.path())
            .memory_mapped(false)
            .open()
            .unwrap();
        assert!(!pbd.initialized_from_existing_files());
        assert_eq!(pbd.num_objects(), 0);
        assert!(pbd.is_empty().unwrap());
        drop(pbd);

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["q.0.pbd".to_string()]);
    }

    #[test]
    fn operations_fail_after_close() {
        let dir = tempdir().unwrap();
        let pbd = PersistentBinaryDeque::builder("q", dir.path())
            .memory_mapped(false)
            .open()
            .unwrap();
        pbd.close().unwrap();
        assert!(pbd.offer(&b"late".to_vec().into()).is_err());
        assert!(pbd.poll(&crate::buffer::HeapBufferAllocator).is_err());
        assert!(pbd.sync().is_err());
        assert!(pbd.is_empty().is_err());
        // Closing again is a no-op.
        pbd.close().unwrap();
    }
}
