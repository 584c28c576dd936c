//! Sort orchestrator (C6): plans run length and fanout from the memory
//! budget (via [`planner::plan_sort`]), then drives phases 2 (run
//! formation), 3 (intermediate merges) and 4 (final merge).

pub mod planner;

use crate::error::Result;
use crate::memory::{MemoryManager, MemoryReservation};
use crate::merge::merge;
use crate::stream::{reject_path_aliases, Item, Persistence, Stream};
use crate::temp::TempPathProvider;
use planner::plan_sort;
use std::cmp::Ordering;
use std::collections::VecDeque;
use sync_file::RandomAccessFile;
use tracing::{debug, trace_span};

/// Sorts the remaining items of `input` (from its current cursor to its
/// end) under `cmp` into `output`, using at most `mem.available()` bytes at
/// any point and `temp` to name transient run files.
///
/// Every transient run stream is created with `Persistence::Delete`, so a
/// sort that fails partway -- or whose caller simply drops the in-progress
/// state on an early `?` -- cleans up its temp files via `Drop` without any
/// extra unwind-handling code here.
pub fn sort<T: Item>(
    input: &mut Stream<T, RandomAccessFile>,
    output: &mut Stream<T, RandomAccessFile>,
    mem: &MemoryManager,
    temp: &dyn TempPathProvider,
    cmp: impl Fn(&T, &T) -> Ordering + Copy,
) -> Result<()> {
    let _span = trace_span!("sort").entered();
    reject_path_aliases([input.canonical_path(), output.canonical_path()])?;
    let item_size = std::mem::size_of::<T>() as u64;
    let n_items = input.stream_len() - input.relative_tell();
    let params = plan_sort(
        mem.available(),
        item_size,
        n_items,
        crate::stream::DEFAULT_BLOCK_SIZE,
    );
    debug!(
        run_length = params.run_length,
        fanout = params.fanout,
        final_fanout = params.final_fanout,
        "planned sort"
    );

    // Internal-report fast path: the whole input fits in one run, so skip
    // phases 3 and 4 entirely.
    if n_items <= params.internal_report_threshold {
        let _reservation = MemoryReservation::acquire(mem, n_items * item_size)?;
        let mut buf = Vec::with_capacity(n_items as usize);
        while let Some(x) = input.read_item()? {
            buf.push(x);
        }
        buf.sort_by(cmp);
        for x in buf {
            output.write_item(x)?;
        }
        return Ok(());
    }

    // Phase 2: run formation. Heapsort/introsort-class worst case is the
    // requirement (never plain quicksort's O(n^2) worst case); `sort_by` is
    // a stable merge sort, O(n log n) worst case and never degrading to
    // quicksort's O(n^2) adversarial case -- and, unlike `sort_unstable_by`,
    // it preserves the relative order of items with equal keys, which the
    // stability property requires within a single run (the k-way merge in
    // phase 3/4 only preserves order *between* runs, not within one).
    let mut runs: VecDeque<Stream<T, RandomAccessFile>> = VecDeque::new();
    loop {
        if input.relative_tell() >= input.stream_len() {
            break;
        }
        let _reservation = MemoryReservation::acquire(mem, params.run_length * item_size)?;
        let mut buf: Vec<T> = Vec::with_capacity(params.run_length as usize);
        for _ in 0..params.run_length {
            match input.read_item()? {
                Some(x) => buf.push(x),
                None => break,
            }
        }
        if buf.is_empty() {
            break;
        }
        buf.sort_by(cmp);
        let mut run = Stream::new_temp(mem.clone(), temp)?;
        run.set_persist(Persistence::Delete);
        for x in &buf {
            run.write_item(*x)?;
        }
        run.seek(0)?;
        // Parked runs accumulate in `runs` until phase 3/4 consumes them;
        // releasing each one's cache now instead of leaving it at its
        // just-written peak keeps memory proportional to one run's cache at
        // a time rather than growing with the run count.
        run.release_cache()?;
        runs.push_back(run);
    }

    // Phase 3: intermediate merges, FIFO so older (more-merged) runs drain
    // first, keeping merge depth balanced across the run queue.
    while runs.len() > params.final_fanout.max(1) as usize {
        let take = (params.fanout as usize).min(runs.len());
        let mut batch: Vec<Stream<T, RandomAccessFile>> = Vec::with_capacity(take);
        for _ in 0..take {
            batch.push(runs.pop_front().expect("take <= runs.len()"));
        }
        let mut merged = Stream::new_temp(mem.clone(), temp)?;
        merged.set_persist(Persistence::Delete);
        merge(&mut batch, &mut merged, cmp)?;
        merged.seek(0)?;
        merged.release_cache()?;
        runs.push_back(merged);
    }

    // Phase 4: final merge. A single surviving run is copied straight into
    // the caller's output stream rather than run through a trivial k=1
    // merge pass.
    match runs.len() {
        0 => {}
        1 => {
            let mut last = runs.pop_front().expect("checked len == 1");
            last.seek(0)?;
            while let Some(x) = last.read_item()? {
                output.write_item(x)?;
            }
        }
        _ => {
            let mut batch: Vec<Stream<T, RandomAccessFile>> = runs.into_iter().collect();
            merge(&mut batch, output, cmp)?;
        }
    }

    Ok(())
}
