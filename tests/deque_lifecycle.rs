//! # Deque Lifecycle Tests
//!
//! Covers construction over fresh and pre-populated directories, clean
//! close/reopen cycles, startup hygiene (empty and abandoned files),
//! segment-id gap detection, and the delete-when-drained rule.

use std::fs;
use std::path::Path;

use pbdeque::{BufferHandle, DirectBufferAllocator, PersistentBinaryDeque};
use tempfile::tempdir;

const NONCE: &str = "export_overflow";

fn open(dir: &Path, mmap: bool) -> PersistentBinaryDeque {
    PersistentBinaryDeque::builder(NONCE, dir)
        .memory_mapped(mmap)
        .open()
        .unwrap()
}

fn offer(pbd: &PersistentBinaryDeque, payload: &[u8]) {
    pbd.offer(&BufferHandle::from(payload.to_vec())).unwrap();
}

fn poll_bytes(pbd: &PersistentBinaryDeque) -> Option<Vec<u8>> {
    pbd.poll(&DirectBufferAllocator).unwrap().map(|mut handle| {
        let bytes = handle.bytes().to_vec();
        handle.discard();
        bytes
    })
}

fn pbd_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.ends_with(".pbd"))
        .collect();
    names.sort();
    names
}

#[test]
fn offer_poll_drain_leaves_a_bare_tail() {
    for mmap in [false, true] {
        let dir = tempdir().unwrap();
        let pbd = open(dir.path(), mmap);

        offer(&pbd, b"a");
        offer(&pbd, b"bb");
        offer(&pbd, b"ccc");
        assert_eq!(pbd.num_objects(), 3);
        assert_eq!(pbd.size_in_bytes().unwrap(), 6);

        assert_eq!(poll_bytes(&pbd).unwrap(), b"a");
        assert_eq!(poll_bytes(&pbd).unwrap(), b"bb");
        assert_eq!(poll_bytes(&pbd).unwrap(), b"ccc");
        assert!(poll_bytes(&pbd).is_none());
        assert_eq!(pbd.num_objects(), 0);
        assert!(pbd.is_empty().unwrap());

        pbd.close().unwrap();
        drop(pbd);

        // Exactly one tail file remains and it holds only the header.
        let files = pbd_files(dir.path());
        assert_eq!(files, vec![format!("{NONCE}.0.pbd")]);
        let tail = dir.path().join(&files[0]);
        assert_eq!(fs::metadata(&tail).unwrap().len(), 8);
    }
}

#[test]
fn reopen_preserves_all_unread_records() {
    for mmap in [false, true] {
        let dir = tempdir().unwrap();
        let records: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 64]).collect();

        let pbd = open(dir.path(), mmap);
        assert!(!pbd.initialized_from_existing_files());
        for record in &records {
            offer(&pbd, record);
        }
        pbd.close().unwrap();
        drop(pbd);

        let reopened = open(dir.path(), mmap);
        assert!(reopened.initialized_from_existing_files());
        assert_eq!(reopened.num_objects(), 5);
        for record in &records {
            assert_eq!(poll_bytes(&reopened).unwrap(), *record);
        }
        assert!(poll_bytes(&reopened).is_none());
    }
}

#[test]
fn reopen_resumes_after_a_partial_drain() {
    for mmap in [false, true] {
        let dir = tempdir().unwrap();
        let pbd = open(dir.path(), mmap);
        offer(&pbd, b"alpha");
        offer(&pbd, b"beta");
        offer(&pbd, b"gamma");
        assert_eq!(poll_bytes(&pbd).unwrap(), b"alpha");
        assert_eq!(pbd.num_objects(), 2);
        pbd.close().unwrap();
        drop(pbd);

        let reopened = open(dir.path(), mmap);
        assert_eq!(reopened.num_objects(), 2);
        assert_eq!(poll_bytes(&reopened).unwrap(), b"beta");
        assert_eq!(poll_bytes(&reopened).unwrap(), b"gamma");
        assert!(poll_bytes(&reopened).is_none());
    }
}

#[test]
fn empty_segments_are_removed_at_startup() {
    let dir = tempdir().unwrap();
    let stale = dir.path().join(format!("{NONCE}.5.pbd"));
    fs::write(&stale, [0u8; 8]).unwrap();

    let pbd = open(dir.path(), false);
    assert!(pbd.initialized_from_existing_files());
    assert_eq!(pbd.num_objects(), 0);
    assert!(!stale.exists());
    drop(pbd);

    // With the header-only segment gone the fresh tail starts over at 0.
    assert_eq!(pbd_files(dir.path()), vec![format!("{NONCE}.0.pbd")]);
}

#[test]
fn abandoned_four_byte_files_are_removed_silently() {
    let dir = tempdir().unwrap();
    let abandoned = dir.path().join(format!("{NONCE}.3.pbd"));
    fs::write(&abandoned, [0u8; 4]).unwrap();

    let pbd = open(dir.path(), false);
    assert!(!abandoned.exists());
    assert!(!pbd.initialized_from_existing_files());
}

#[test]
fn unrelated_files_are_ignored() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();
    fs::write(dir.path().join("other.0.pbd"), [0u8; 16]).unwrap();
    fs::write(dir.path().join(format!("{NONCE}.pbd")), b"no id").unwrap();

    let pbd = open(dir.path(), false);
    assert!(!pbd.initialized_from_existing_files());
    offer(&pbd, b"record");
    drop(pbd);

    assert!(dir.path().join("notes.txt").exists());
    assert!(dir.path().join("other.0.pbd").exists());
    assert!(dir.path().join(format!("{NONCE}.pbd")).exists());
}

#[test]
fn dotted_nonces_parse_back_to_the_same_deque() {
    let dir = tempdir().unwrap();
    let nonce = "cluster.7.export";
    let pbd = PersistentBinaryDeque::builder(nonce, dir.path())
        .memory_mapped(false)
        .open()
        .unwrap();
    pbd.offer(&BufferHandle::from(b"dotted".to_vec())).unwrap();
    pbd.close().unwrap();
    drop(pbd);

    let reopened = PersistentBinaryDeque::builder(nonce, dir.path())
        .memory_mapped(false)
        .open()
        .unwrap();
    assert!(reopened.initialized_from_existing_files());
    assert_eq!(reopened.num_objects(), 1);
    assert_eq!(poll_bytes(&reopened).unwrap(), b"dotted");
}

#[test]
fn a_segment_id_gap_fails_construction() {
    let dir = tempdir().unwrap();

    // Three close/reopen cycles leave segments 0, 1 and 2 on disk.
    for i in 0u8..3 {
        let pbd = open(dir.path(), false);
        offer(&pbd, &[i; 32]);
        pbd.close().unwrap();
    }
    let files = pbd_files(dir.path());
    assert_eq!(files.len(), 3);

    fs::remove_file(dir.path().join(format!("{NONCE}.1.pbd"))).unwrap();
    let err = PersistentBinaryDeque::builder(NONCE, dir.path())
        .memory_mapped(false)
        .open()
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("missing"), "unexpected error: {message}");
    assert!(message.contains("between 0 and 2"), "unexpected error: {message}");
}

#[test]
fn draining_a_finished_segment_deletes_its_file() {
    for mmap in [false, true] {
        let dir = tempdir().unwrap();
        let pbd = open(dir.path(), mmap);
        offer(&pbd, b"finished");
        pbd.close().unwrap();
        drop(pbd);

        // Segment 0 is now a finished read-only segment; 1 is the tail.
        let reopened = open(dir.path(), mmap);
        let front = dir.path().join(format!("{NONCE}.0.pbd"));
        assert!(front.exists());

        let mut handle = reopened.poll(&DirectBufferAllocator).unwrap().unwrap();
        assert_eq!(handle.bytes(), b"finished");
        // The file lives as long as the handle does.
        assert!(front.exists());
        handle.discard();
        assert!(!front.exists());
    }
}

#[test]
fn discard_after_deque_drop_only_releases_storage() {
    for mmap in [false, true] {
        let dir = tempdir().unwrap();
        let pbd = open(dir.path(), mmap);
        offer(&pbd, b"escapes the deque");

        let mut handle = pbd.poll(&DirectBufferAllocator).unwrap().unwrap();
        drop(pbd);
        assert_eq!(handle.bytes(), b"escapes the deque");
        handle.discard();
    }
}

#[test]
fn close_and_delete_removes_every_file() {
    for mmap in [false, true] {
        let dir = tempdir().unwrap();
        let pbd = open(dir.path(), mmap);
        offer(&pbd, b"one");
        pbd.close().unwrap();
        drop(pbd);

        let reopened = open(dir.path(), mmap);
        assert!(!pbd_files(dir.path()).is_empty());
        reopened.close_and_delete().unwrap();
        assert!(pbd_files(dir.path()).is_empty());
    }
}

#[test]
fn reopen_counts_match_after_interleaved_operations() {
    let dir = tempdir().unwrap();
    let pbd = open(dir.path(), false);

    for i in 0u8..10 {
        offer(&pbd, &[i; 16]);
    }
    for _ in 0..4 {
        poll_bytes(&pbd).unwrap();
    }
    assert_eq!(pbd.num_objects(), 6);
    assert_eq!(pbd.size_in_bytes().unwrap(), 6 * 16);
    pbd.close().unwrap();
    drop(pbd);

    let reopened = open(dir.path(), false);
    assert_eq!(reopened.num_objects(), 6);
    let mut next = 4u8;
    while let Some(bytes) = poll_bytes(&reopened) {
        assert_eq!(bytes, vec![next; 16]);
        next += 1;
    }
    assert_eq!(next, 10);
}
