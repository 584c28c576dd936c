//! Sort parameter planner (C7): a pure function from memory budget, item
//! size, and expected item count to the run length and merge fanouts the
//! orchestrator (C6) should use.
//!
//! Kept as a pure function (no `MemoryManager`, no I/O) precisely so the
//! orchestrator can call it once up front and get back a plan it can reason
//! about before committing to any allocation -- the overhead constants below
//! are a calibration against this crate's own block-cache behavior (a run
//! stream's cache grows to a fixed number of resident pages before eviction
//! caps it, see `stream::STREAM_CACHE_PAGES`), not a universal constant.

use std::mem::size_of;

/// Output of [`plan_sort`]: everything the orchestrator needs to run phases
/// 2 through 4 within the caller's memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortParams {
    /// Memory available while forming sorted runs.
    pub memory_phase2: u64,
    /// Memory available while merging runs (phase 3).
    pub memory_phase3: u64,
    /// Memory available during the final merge (phase 4).
    pub memory_phase4: u64,
    /// Number of items per in-memory run, subject to `memory_phase2`.
    pub run_length: u64,
    /// If the input has at most this many items, phase 2 reports the
    /// in-memory sorted result directly, skipping phases 3 and 4. Always
    /// `<= run_length`.
    pub internal_report_threshold: u64,
    /// Fanout of the merge tree during phase 3.
    pub fanout: u64,
    /// Fanout of the merge tree during phase 4; always `<= fanout`.
    pub final_fanout: u64,
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b.max(1)
}

fn passes_needed(num_runs: u64, fanout: u64) -> u32 {
    if num_runs <= 1 {
        return 0;
    }
    let mut passes = 0u32;
    let mut capacity = 1u64;
    while capacity < num_runs {
        capacity = capacity.saturating_mul(fanout);
        passes += 1;
    }
    passes
}

/// Plans run length and merge fanouts for sorting `n_items` items of
/// `item_size` bytes each with `available_memory` bytes of budget and a
/// stream block size of `block_size` bytes.
///
/// The returned parameters satisfy `run_length * item_size + fanout *
/// block_size + overhead <= available_memory` except in the degenerate
/// regime where `available_memory` is smaller than the documented minimums
/// -- there the minimum clamps (`run_length >= 2`, `fanout >= 2`) take
/// priority and the sort still completes correctly, merely without the
/// budget guarantee.
pub fn plan_sort(available_memory: u64, item_size: u64, n_items: u64, block_size: u64) -> SortParams {
    let item_size = item_size.max(1);
    let block_size = block_size.max(1);

    // Phase 2: while a run buffer is held, the run stream being written for
    // it also keeps its own block cache resident (up to
    // `STREAM_CACHE_PAGES` pages, header included, released once the run is
    // complete rather than for as long as it stays queued) -- budget for
    // that alongside the run storage itself, plus one spare page of slack.
    let overhead_phase2 = (crate::stream::STREAM_CACHE_PAGES as u64 + 1) * block_size;
    let min_run_length = (2 * block_size / item_size).max(2);
    let run_length = available_memory
        .saturating_sub(overhead_phase2)
        .checked_div(item_size)
        .unwrap_or(0)
        .max(min_run_length);
    let memory_phase2 = run_length * item_size + overhead_phase2;

    // Phase 3: fanout input buffers (one block each) plus one output
    // buffer, plus a small per-leaf bookkeeping constant for the loser
    // tree's leaf/loser-index slots.
    let per_stream_overhead = size_of::<usize>() as u64 * 2;
    let input_buf = block_size;
    let output_buf = block_size;
    let fanout = available_memory
        .saturating_sub(output_buf)
        .checked_div(input_buf + per_stream_overhead)
        .unwrap_or(0)
        .max(2);
    let memory_phase3 = fanout * (input_buf + per_stream_overhead) + output_buf;

    let num_runs = if n_items == 0 { 0 } else { ceil_div(n_items, run_length) };
    let passes = passes_needed(num_runs, fanout);
    let final_fanout = if num_runs <= 1 {
        num_runs.max(1)
    } else {
        let divisor = fanout.checked_pow(passes.saturating_sub(1)).unwrap_or(u64::MAX).max(1);
        ceil_div(num_runs, divisor).clamp(2, fanout)
    };
    let memory_phase4 = final_fanout * (input_buf + per_stream_overhead) + output_buf;

    let internal_report_threshold = run_length;

    SortParams {
        memory_phase2,
        memory_phase3,
        memory_phase4,
        run_length,
        internal_report_threshold,
        fanout,
        final_fanout,
    }
}
