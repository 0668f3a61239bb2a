//! # Buffer Handles
//!
//! A [`BufferHandle`] owns a contiguous byte region and guarantees that the
//! underlying storage is released exactly once, no matter how many times the
//! caller discards it. Three storage flavors exist:
//!
//! - **Direct**: a raw allocation outside any `Vec`, natively addressable.
//!   This is the flavor the block compressor accepts as input.
//! - **Heap**: a plain `Vec<u8>`; release is an ordinary drop.
//! - **Mapped**: a slice of a memory-mapped segment, shared through an
//!   `Arc` so the mapping stays alive until the last handle is gone.
//!
//! Handles returned by `poll` additionally carry a drain hook: a pin on the
//! owning segment plus a weak reference back to the deque. Releasing the
//! handle unpins the segment, and if the segment is fully consumed and is
//! not the current tail, the deque deletes its file. The hook is safe to
//! run from any thread, at any time, including after the deque has been
//! closed or dropped - it then degrades to a plain storage release.
//!
//! ## Double Discard
//!
//! Discard is idempotent in observation: a second `discard` is detected,
//! reported once at error level, and otherwise ignored. Dropping a handle
//! that was never discarded releases it the same way.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::error;

use crate::segment::mmap::SegmentMap;

/// Receiver for the delete-when-drained check that runs when a polled
/// handle releases its pin on a segment.
pub(crate) trait DrainObserver: Send + Sync {
    fn handle_released(&self, segment_id: i64);
}

/// Pin on the segment a polled handle was read from. Dropping the hook
/// unpins the segment and notifies the deque, which may delete the file.
pub(crate) struct DrainHook {
    pin: Arc<AtomicUsize>,
    segment_id: i64,
    observer: Option<Weak<dyn DrainObserver>>,
}

impl DrainHook {
    pub(crate) fn new(pin: Arc<AtomicUsize>, segment_id: i64) -> Self {
        Self {
            pin,
            segment_id,
            observer: None,
        }
    }
}

impl Drop for DrainHook {
    fn drop(&mut self) {
        self.pin.fetch_sub(1, Ordering::AcqRel);
        if let Some(observer) = self.observer.take().and_then(|weak| weak.upgrade()) {
            observer.handle_released(self.segment_id);
        }
    }
}

enum BufferStorage {
    Direct {
        ptr: NonNull<u8>,
        layout: Layout,
        len: usize,
    },
    Heap(Vec<u8>),
    Mapped {
        map: Arc<SegmentMap>,
        offset: usize,
        len: usize,
    },
}

// SAFETY: the Direct variant owns its allocation exclusively; the pointer is
// never shared outside the handle. Heap and Mapped are Send by composition
// (SegmentMap is Send + Sync).
unsafe impl Send for BufferStorage {}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        if let BufferStorage::Direct { ptr, layout, .. } = self {
            // SAFETY: ptr was produced by alloc_zeroed with this exact
            // layout and is only deallocated here, once, because the
            // variant is dropped exactly once.
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

/// Owner of a contiguous byte region with exactly-once release.
pub struct BufferHandle {
    storage: Option<BufferStorage>,
    drain: Option<DrainHook>,
}

impl BufferHandle {
    /// Allocates a zero-filled direct (natively addressable) buffer.
    pub fn direct_zeroed(len: usize) -> Self {
        if len == 0 {
            return Self::from(Vec::new());
        }
        // Layout construction only fails for sizes near isize::MAX, far
        // beyond any record this crate accepts.
        let layout = Layout::array::<u8>(len).expect("buffer length overflows a Layout");
        // SAFETY: layout has non-zero size (len > 0 checked above).
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self {
            storage: Some(BufferStorage::Direct { ptr, layout, len }),
            drain: None,
        }
    }

    /// Allocates a direct buffer holding a copy of `bytes`.
    pub fn direct_from(bytes: &[u8]) -> Self {
        let mut handle = Self::direct_zeroed(bytes.len());
        handle.bytes_mut().copy_from_slice(bytes);
        handle
    }

    pub(crate) fn mapped(map: Arc<SegmentMap>, offset: usize, len: usize) -> Self {
        Self {
            storage: Some(BufferStorage::Mapped { map, offset, len }),
            drain: None,
        }
    }

    pub(crate) fn set_drain(&mut self, drain: DrainHook) {
        debug_assert!(self.drain.is_none(), "drain hook attached twice");
        self.drain = Some(drain);
    }

    pub(crate) fn set_drain_observer(&mut self, observer: Weak<dyn DrainObserver>) {
        if let Some(drain) = self.drain.as_mut() {
            drain.observer = Some(observer);
        }
    }

    /// Trims the logical length, for allocators that over-provision.
    pub(crate) fn truncate_len(&mut self, new_len: usize) {
        match &mut self.storage {
            Some(BufferStorage::Direct { len, .. }) => *len = (*len).min(new_len),
            Some(BufferStorage::Heap(vec)) => vec.truncate(new_len),
            Some(BufferStorage::Mapped { len, .. }) => *len = (*len).min(new_len),
            None => {}
        }
    }

    /// The wrapped bytes. Empty after the handle has been discarded.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            // SAFETY: ptr points at a live allocation of exactly len bytes
            // owned by this handle (see direct_zeroed).
            Some(BufferStorage::Direct { ptr, len, .. }) => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            Some(BufferStorage::Heap(vec)) => vec,
            Some(BufferStorage::Mapped { map, offset, len }) => map.slice(*offset, *len),
            None => &[],
        }
    }

    /// Mutable access for filling the buffer before it is offered. Mapped
    /// handles are read-only views and yield an empty slice.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            // SAFETY: same provenance argument as bytes(); &mut self gives
            // exclusive access to the allocation.
            Some(BufferStorage::Direct { ptr, len, .. }) => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
            Some(BufferStorage::Heap(vec)) => vec,
            Some(BufferStorage::Mapped { .. }) | None => &mut [],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Native address of the region, for callers that hand the bytes to a
    /// foreign codec.
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes().as_ptr()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the region is natively addressable (direct allocation or
    /// mapped file region). Only such buffers are handed to the block
    /// compressor; heap-backed inputs are stored raw.
    pub fn is_direct(&self) -> bool {
        matches!(
            self.storage,
            Some(BufferStorage::Direct { .. }) | Some(BufferStorage::Mapped { .. })
        )
    }

    /// Releases the underlying storage and runs the drain hook, exactly
    /// once. A repeated discard is logged at error level and ignored.
    pub fn discard(&mut self) {
        if self.storage.is_none() {
            error!("avoided double discard of a buffer handle");
            return;
        }
        self.release();
    }

    fn release(&mut self) {
        // Storage goes first, then the drain hook: the segment must see the
        // mapped reference gone before it decides it can be deleted.
        self.storage = None;
        self.drain = None;
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if self.storage.is_some() {
            self.release();
        }
    }
}

impl From<Vec<u8>> for BufferHandle {
    fn from(vec: Vec<u8>) -> Self {
        Self {
            storage: Some(BufferStorage::Heap(vec)),
            drain: None,
        }
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flavor = match &self.storage {
            Some(BufferStorage::Direct { .. }) => "direct",
            Some(BufferStorage::Heap(_)) => "heap",
            Some(BufferStorage::Mapped { .. }) => "mapped",
            None => "discarded",
        };
        f.debug_struct("BufferHandle")
            .field("flavor", &flavor)
            .field("len", &self.len())
            .finish()
    }
}

/// Source of buffers for the poll path: decompressed records are written
/// into a buffer obtained here.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, min_size: usize) -> BufferHandle;
}

/// Default allocator: off-heap buffers with the same double-discard guard
/// the rest of the crate uses.
pub struct DirectBufferAllocator;

impl BufferAllocator for DirectBufferAllocator {
    fn allocate(&self, min_size: usize) -> BufferHandle {
        BufferHandle::direct_zeroed(min_size)
    }
}

/// Heap allocator for callers that want plain `Vec` storage.
pub struct HeapBufferAllocator;

impl BufferAllocator for HeapBufferAllocator {
    fn allocate(&self, min_size: usize) -> BufferHandle {
        BufferHandle::from(vec![0u8; min_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_buffer_is_zeroed_and_writable() {
        let mut handle = BufferHandle::direct_zeroed(32);
        assert_eq!(handle.len(), 32);
        assert!(handle.is_direct());
        assert!(handle.bytes().iter().all(|&b| b == 0));

        handle.bytes_mut()[..4].copy_from_slice(b"abcd");
        assert_eq!(&handle.bytes()[..4], b"abcd");
    }

    #[test]
    fn direct_from_copies_the_source() {
        let handle = BufferHandle::direct_from(b"payload");
        assert_eq!(handle.bytes(), b"payload");
    }

    #[test]
    fn heap_buffer_is_not_direct() {
        let handle = BufferHandle::from(b"xyz".to_vec());
        assert!(!handle.is_direct());
        assert_eq!(handle.bytes(), b"xyz");
    }

    #[test]
    fn zero_length_direct_buffer() {
        let handle = BufferHandle::direct_zeroed(0);
        assert!(handle.is_empty());
    }

    #[test]
    fn discard_empties_the_handle() {
        let mut handle = BufferHandle::direct_from(b"data");
        handle.discard();
        assert!(handle.bytes().is_empty());
        assert_eq!(handle.len(), 0);
    }

    #[test]
    fn double_discard_is_harmless() {
        let mut handle = BufferHandle::from(b"data".to_vec());
        handle.discard();
        handle.discard();
        handle.discard();
        assert!(handle.bytes().is_empty());
    }

    #[test]
    fn drain_hook_unpins_on_release() {
        let pin = Arc::new(AtomicUsize::new(1));
        let mut handle = BufferHandle::from(b"data".to_vec());
        handle.set_drain(DrainHook::new(Arc::clone(&pin), 7));

        handle.discard();
        assert_eq!(pin.load(Ordering::Acquire), 0);
    }

    #[test]
    fn drain_hook_runs_on_drop_without_discard() {
        let pin = Arc::new(AtomicUsize::new(1));
        {
            let mut handle = BufferHandle::from(b"data".to_vec());
            handle.set_drain(DrainHook::new(Arc::clone(&pin), 7));
        }
        assert_eq!(pin.load(Ordering::Acquire), 0);
    }

    #[test]
    fn allocators_hand_out_requested_sizes() {
        assert_eq!(DirectBufferAllocator.allocate(128).len(), 128);
        assert_eq!(HeapBufferAllocator.allocate(128).len(), 128);
        assert!(DirectBufferAllocator.allocate(128).is_direct());
        assert!(!HeapBufferAllocator.allocate(128).is_direct());
    }
}
