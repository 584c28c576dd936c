//! End-to-end tests exercising the stream, scan, merge, and sort
//! components together, complementing each module's own inline unit tests.

use crate::memory::MemoryManager;
use crate::stream::{OpenMode, Persistence, Stream};
use crate::temp::DefaultTempPathProvider;

/// Installs a compact `tracing` subscriber writing to the test harness's
/// captured output, so `RUST_LOG=xmem=trace cargo test -- --nocapture` shows
/// the span/event trail through stream, cache, and sort code on a failing
/// test. Safe to call from every test: `try_init` no-ops once a global
/// subscriber is already set.
fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .try_init();
}

fn drain(s: &mut Stream<u32>) -> Vec<u32> {
    let mut out = Vec::new();
    while let Some(x) = s.read_item().unwrap() {
        out.push(x);
    }
    out
}

#[test]
fn temp_stream_file_is_removed_once_dropped() {
    let mem = MemoryManager::new(1 << 20);
    let temp = DefaultTempPathProvider::new();
    let mut s = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();
    s.write_item(1).unwrap();
    let path = std::path::PathBuf::from(s.name().unwrap());
    assert!(path.exists());
    drop(s);
    assert!(!path.exists(), "temp stream file should be deleted on drop");
}

#[test]
fn on_disk_header_starts_with_the_stream_magic() {
    use dump_utils::HexDump;

    let mem = MemoryManager::new(1 << 20);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("header_check.xmem");
    {
        let mut s = Stream::<u32>::new_named(&path, OpenMode::Write, mem.clone()).unwrap();
        s.set_persist(Persistence::Persistent);
        s.write_item(42).unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    assert_eq!(
        magic,
        crate::header::MAGIC,
        "unexpected header bytes:\n{}",
        HexDump::new(&bytes[..32]).rust_style()
    );
}

#[test]
fn named_stream_survives_reopen_when_marked_persistent() {
    let mem = MemoryManager::new(1 << 20);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("named.xmem");

    {
        let mut s = Stream::<u32>::new_named(&path, OpenMode::Write, mem.clone()).unwrap();
        s.set_persist(Persistence::Persistent);
        for x in [10u32, 20, 30] {
            s.write_item(x).unwrap();
        }
    }
    assert!(path.exists(), "persistent named stream must survive its Drop");

    let mut reopened = Stream::<u32>::new_named(&path, OpenMode::Read, mem.clone()).unwrap();
    assert_eq!(drain(&mut reopened), vec![10, 20, 30]);
}

#[test]
fn substream_reads_are_confined_to_their_range_and_never_delete_the_parent() {
    let mem = MemoryManager::new(1 << 20);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parent.xmem");

    let mut parent = Stream::<u32>::new_named(&path, OpenMode::Write, mem.clone()).unwrap();
    parent.set_persist(Persistence::Persistent);
    for x in 0u32..10 {
        parent.write_item(x).unwrap();
    }

    {
        let mut half = parent.new_substream(0, 4, Persistence::Delete).unwrap();
        assert_eq!(half.stream_len(), 5);
        assert_eq!(drain(&mut half), vec![0, 1, 2, 3, 4]);
    }
    // Deleting the substream must not have touched the parent's file.
    assert!(path.exists());

    let mut second_half = parent.new_substream(5, 9, Persistence::Delete).unwrap();
    assert_eq!(drain(&mut second_half), vec![5, 6, 7, 8, 9]);
}

#[test]
fn sort_rejects_aliasing_the_same_named_file_as_input_and_output() {
    use crate::error::Error;
    use crate::sort::sort;

    let mem = MemoryManager::new(1 << 20);
    let temp = DefaultTempPathProvider::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aliased.xmem");

    let mut input = Stream::<u32>::new_named(&path, OpenMode::Write, mem.clone()).unwrap();
    input.set_persist(Persistence::Persistent);
    input.write_item(1).unwrap();
    drop(input);

    let mut a = Stream::<u32>::new_named(&path, OpenMode::Read, mem.clone()).unwrap();
    let mut b = Stream::<u32>::new_named(&path, OpenMode::Write, mem.clone()).unwrap();

    let err = sort(&mut a, &mut b, &mem, &temp, |x, y| x.cmp(y)).unwrap_err();
    assert!(matches!(err, Error::IllegalAlias(_)));
}

#[test]
fn substream_bounds_reject_out_of_range_requests() {
    let mem = MemoryManager::new(1 << 20);
    let temp = DefaultTempPathProvider::new();
    let mut s = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();
    for x in 0u32..3 {
        s.write_item(x).unwrap();
    }
    assert!(s.new_substream(0, 2, Persistence::Delete).is_ok());
    assert!(s.new_substream(0, 3, Persistence::Delete).is_err());
    assert!(s.new_substream(2, 1, Persistence::Delete).is_err());
}

#[test]
fn sorting_each_half_then_merging_reproduces_a_full_sort() {
    use crate::merge::merge;
    use crate::sort::sort;

    let mem = MemoryManager::new(1 << 20);
    let temp = DefaultTempPathProvider::new();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("whole.xmem");
    let mut whole = Stream::<u32>::new_named(&path, OpenMode::Write, mem.clone()).unwrap();
    whole.set_persist(Persistence::Persistent);
    let xs: Vec<u32> = vec![9, 4, 7, 1, 3, 8, 2, 6, 5, 0];
    for &x in &xs {
        whole.write_item(x).unwrap();
    }

    let mut left = whole.new_substream(0, 4, Persistence::Delete).unwrap();
    let mut right = whole.new_substream(5, 9, Persistence::Delete).unwrap();

    let mut sorted_left = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();
    sort(&mut left, &mut sorted_left, &mem, &temp, |a, b| a.cmp(b)).unwrap();
    sorted_left.seek(0).unwrap();

    let mut sorted_right = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();
    sort(&mut right, &mut sorted_right, &mem, &temp, |a, b| a.cmp(b)).unwrap();
    sorted_right.seek(0).unwrap();

    let mut merged = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();
    merge(&mut [sorted_left, sorted_right], &mut merged, |a, b| a.cmp(b)).unwrap();

    merged.seek(0).unwrap();
    let mut want = xs.clone();
    want.sort_unstable();
    assert_eq!(drain(&mut merged), want);
}

#[test]
fn empty_stream_sorts_to_an_empty_stream() {
    use crate::sort::sort;

    let mem = MemoryManager::new(1 << 20);
    let temp = DefaultTempPathProvider::new();
    let mut input = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();
    let mut output = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();

    sort(&mut input, &mut output, &mem, &temp, |a, b| a.cmp(b)).unwrap();

    output.seek(0).unwrap();
    assert!(drain(&mut output).is_empty());
}

#[test]
fn memory_manager_accounting_returns_to_zero_after_a_full_pipeline() {
    use crate::sort::sort;

    init_test_logging();
    let mem = MemoryManager::new(1 << 18);
    let temp = DefaultTempPathProvider::new();
    let xs: Vec<u32> = (0..3_000).rev().collect();
    let mut input = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();
    for &x in &xs {
        input.write_item(x).unwrap();
    }
    input.seek(0).unwrap();
    let mut output = Stream::<u32>::new_temp(mem.clone(), &temp).unwrap();

    sort(&mut input, &mut output, &mem, &temp, |a, b| a.cmp(b)).unwrap();
    drop(input);
    drop(output);

    assert_eq!(
        mem.in_use(),
        0,
        "all reservations must be released once every stream is dropped"
    );
}
