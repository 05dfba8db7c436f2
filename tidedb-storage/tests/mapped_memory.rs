use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tidedb_storage::prelude::*;
use tidedb_storage::serde::Serde;

#[test]
fn test_mixed_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.d");
    let ff = OsFilesFacade::shared();
    let hash = Long256::from_hex_str(Some(
        "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060",
    ))
    .unwrap();
    let offsets = {
        let mut mem = MappedMemory::open(Arc::clone(&ff), &path, 32).unwrap();
        let o1 = mem.put_i64(-7).unwrap();
        let o2 = mem.put_str(Some("hello, world")).unwrap();
        let o3 = mem.put_null_str().unwrap();
        let o4 = mem.put_bin(Some(&[1u8, 2, 3, 4, 5][..])).unwrap();
        let o5 = mem.put_long256(&hash).unwrap();
        let o6 = mem.put_f64(1.5).unwrap();
        let o7 = mem.put_bool(true).unwrap();
        mem.sync_all(false);
        [o1, o2, o3, o4, o5, o6, o7]
    };
    let mut mem = MappedMemory::open(Arc::clone(&ff), &path, 32).unwrap();
    assert_eq!(mem.get_i64(offsets[0]).unwrap(), -7);
    assert_eq!(mem.get_str(offsets[1]).unwrap().as_deref(), Some("hello, world"));
    assert!(mem.str_equals(offsets[1], "hello, world").unwrap());
    assert!(!mem.str_equals(offsets[1], "hello").unwrap());
    assert_eq!(mem.get_str(offsets[2]).unwrap(), None);
    assert_eq!(mem.get_bin(offsets[3]).unwrap().as_deref(), Some(&[1u8, 2, 3, 4, 5][..]));
    assert_eq!(mem.get_long256(offsets[4]).unwrap(), hash);
    assert_eq!(mem.get_f64(offsets[5]).unwrap(), 1.5);
    assert!(mem.get_bool(offsets[6]).unwrap());

    // flat decoding of the same file gives the same values.
    drop(mem);
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.deser_i64(offsets[0]).unwrap().1, -7);
    assert_eq!(
        bytes.deser_utf16_str(offsets[1]).unwrap().1.as_deref(),
        Some("hello, world")
    );
    assert_eq!(bytes.deser_utf16_str(offsets[2]).unwrap().1, None);
    assert_eq!(bytes.deser_bin(offsets[3]).unwrap().1, Some(&[1u8, 2, 3, 4, 5][..]));
    assert_eq!(bytes.deser_long256(offsets[4]).unwrap().1, hash);
}

#[test]
fn test_heap_and_file_memory_agree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agree.d");
    let mut rng = StdRng::seed_from_u64(7);
    let mut heap = HeapMemory::new(64);
    let mut file = MappedMemory::open(OsFilesFacade::shared(), &path, 64).unwrap();
    for _ in 0..1000 {
        let v: i64 = rng.random();
        let len = rng.random_range(0..20usize);
        let s: String = (0..len)
            .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
            .collect();
        assert_eq!(heap.put_i64(v).unwrap(), file.put_i64(v).unwrap());
        assert_eq!(
            heap.put_str(Some(s.as_str())).unwrap(),
            file.put_str(Some(s.as_str())).unwrap()
        );
    }
    assert_eq!(heap.append_offset(), file.append_offset());
    let size = heap.append_offset();
    let mut a = vec![0u8; size];
    let mut b = vec![0u8; size];
    heap.get_bytes(0, &mut a).unwrap();
    file.get_bytes(0, &mut b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_file_truncated_to_append_offset_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("close.d");
    let mut mem = MappedMemory::open(OsFilesFacade::shared(), &path, 4096).unwrap();
    mem.put_i32(1).unwrap();
    mem.put_i32(2).unwrap();
    assert_eq!(mem.file_length().unwrap(), 4096);
    mem.close();
    assert_eq!(std::fs::read(&path).unwrap(), vec![1, 0, 0, 0, 2, 0, 0, 0]);
}

#[test]
fn test_truncate_resets_to_one_page() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reset.d");
    let mut mem = MappedMemory::open(OsFilesFacade::shared(), &path, 1024).unwrap();
    for i in 0..1000 {
        mem.put_i64(i).unwrap();
    }
    mem.truncate().unwrap();
    assert_eq!(mem.append_offset(), 0);
    assert_eq!(mem.file_length().unwrap(), 1024);
    mem.put_str(Some("again")).unwrap();
    mem.close();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 14);
}
