//! K-way merger (C5): a loser tree over N sorted input streams, exposed both
//! as a one-shot driver (`merge`) and a pull iterator (`MergeCursor`) that
//! Phase 4 of the sort orchestrator drains directly into the caller's
//! output stream without materializing the merged sequence.
//!
//! This is the classic external-sort loser tree: a balanced binary
//! tournament keyed by each input's current head item, replayed leaf-to-root
//! after every pop so a merge of `fanout` streams costs `O(log fanout)`
//! comparisons per emitted item rather than a linear scan of the heads.

use crate::error::Result;
use crate::stream::{reject_path_aliases, Item, Stream};
use std::cmp::Ordering;
use sync_file::{RandomAccessFile, ReadAt, WriteAt};

/// A tournament (loser) tree over `n` leaves, padded to the next power of
/// two with permanently-exhausted sentinel leaves (`None`, treated as
/// `+infinity`, losing every comparison against a real value; ties among
/// sentinels or equal real values broken by lower leaf index so the merge
/// is stable).
struct LoserTree<T, Cmp> {
    k: usize,
    /// `loser[0]` holds the overall winner's leaf index after a build or
    /// replay; `loser[1..k)` hold the leaf index that lost the match played
    /// at that internal node.
    loser: Vec<usize>,
    leaves: Vec<Option<T>>,
    /// Bottom-up (immediate parent first) ancestor node ids for each leaf,
    /// precomputed once since the tree shape never changes after `new`.
    ancestors: Vec<Vec<usize>>,
    cmp: Cmp,
}

impl<T: Copy, Cmp: Fn(&T, &T) -> Ordering> LoserTree<T, Cmp> {
    fn new(initial: Vec<Option<T>>, cmp: Cmp) -> Self {
        let n = initial.len();
        let k = n.max(1).next_power_of_two();
        let mut leaves = initial;
        leaves.resize(k, None);
        let ancestors = (0..k).map(|leaf| Self::ancestors_of(k, leaf)).collect();
        let mut tree = LoserTree {
            k,
            loser: vec![0; k.max(1)],
            leaves,
            ancestors,
            cmp,
        };
        tree.rebuild();
        tree
    }

    /// Root-to-leaf node ids visited to reach `leaf`, reversed to bottom-up
    /// (immediate parent first, root last). Node ids follow a segment-tree
    /// style numbering (root = 1, children of `node` are `2*node`/`2*node+1`)
    /// which, because `k` is always a power of two, coincides with a
    /// perfectly balanced binary tree -- every internal node id produced
    /// this way lands in `1..k`.
    fn ancestors_of(k: usize, leaf: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let (mut lo, mut hi, mut node) = (0usize, k, 1usize);
        while hi - lo > 1 {
            path.push(node);
            let mid = lo + (hi - lo) / 2;
            if leaf < mid {
                hi = mid;
                node *= 2;
            } else {
                lo = mid;
                node = node * 2 + 1;
            }
        }
        path.reverse();
        path
    }

    /// `a` should be preferred (treated as smaller) over `b`.
    fn is_less(&self, a: usize, b: usize) -> bool {
        match (&self.leaves[a], &self.leaves[b]) {
            (None, None) => a <= b,
            (None, Some(_)) => false,
            (Some(_), None) => true,
            (Some(x), Some(y)) => {
                let ord = (self.cmp)(x, y);
                #[cfg(debug_assertions)]
                {
                    let back = (self.cmp)(y, x);
                    debug_assert!(
                        !(ord == Ordering::Less && back == Ordering::Less),
                        "comparator is not a total order: a<b and b<a simultaneously"
                    );
                }
                match ord {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => a <= b,
                }
            }
        }
    }

    fn rebuild(&mut self) {
        fn go<T, Cmp: Fn(&T, &T) -> Ordering>(
            tree: &mut LoserTree<T, Cmp>,
            lo: usize,
            hi: usize,
            node: usize,
        ) -> usize {
            if hi - lo == 1 {
                return lo;
            }
            let mid = lo + (hi - lo) / 2;
            let left = go(tree, lo, mid, node * 2);
            let right = go(tree, mid, hi, node * 2 + 1);
            if tree.is_less(left, right) {
                tree.loser[node] = right;
                left
            } else {
                tree.loser[node] = left;
                right
            }
        }
        let winner = go(self, 0, self.k, 1);
        self.loser[0] = winner;
    }

    fn replay_from_leaf(&mut self, leaf: usize) {
        let mut winner = leaf;
        for node in self.ancestors[leaf].clone() {
            let challenger = self.loser[node];
            if self.is_less(challenger, winner) {
                self.loser[node] = winner;
                winner = challenger;
            }
        }
        self.loser[0] = winner;
    }

    /// The leaf index currently winning, or `None` if every leaf is
    /// exhausted.
    fn winner_leaf(&self) -> Option<usize> {
        let w = self.loser[0];
        self.leaves[w].as_ref().map(|_| w)
    }

    fn winner_value(&self) -> Option<&T> {
        self.leaves[self.loser[0]].as_ref()
    }

    /// Replaces leaf `leaf`'s current value (typically with the next item
    /// read from that input, or `None` at end of stream) and re-plays the
    /// path from that leaf to the root.
    fn advance(&mut self, leaf: usize, new_value: Option<T>) {
        self.leaves[leaf] = new_value;
        self.replay_from_leaf(leaf);
    }
}

/// A pull-style iterator over the sorted union of several already-sorted
/// streams, used by Phase 4 to interleave merge output directly into the
/// caller's output stream without materializing the merged sequence.
pub struct MergeCursor<'a, T: Item, F, Cmp> {
    inputs: Vec<&'a mut Stream<T, F>>,
    tree: LoserTree<T, Cmp>,
}

impl<'a, T: Item, F: ReadAt + WriteAt, Cmp: Fn(&T, &T) -> Ordering> MergeCursor<'a, T, F, Cmp> {
    /// Builds a cursor over `inputs`, which must already be positioned where
    /// merging should begin (typically index 0).
    pub fn new(mut inputs: Vec<&'a mut Stream<T, F>>, cmp: Cmp) -> Result<Self> {
        let mut initial = Vec::with_capacity(inputs.len());
        for s in inputs.iter_mut() {
            initial.push(s.read_item()?);
        }
        Ok(MergeCursor {
            inputs,
            tree: LoserTree::new(initial, cmp),
        })
    }

    /// Returns the next item in sorted order, or `Ok(None)` once every
    /// input is exhausted.
    pub fn next(&mut self) -> Result<Option<T>> {
        let Some(leaf) = self.tree.winner_leaf() else {
            return Ok(None);
        };
        let value = *self.tree.winner_value().expect("winner_leaf implies a value");
        let next = self.inputs[leaf].read_item()?;
        self.tree.advance(leaf, next);
        Ok(Some(value))
    }
}

/// Merges `inputs` (each already sorted under `cmp`) into `output`, stable
/// on ties (equal items retain their relative input order, with lower input
/// index breaking ties between streams). `inputs.len()` must not exceed the
/// fanout the caller's memory budget was planned for; this function does
/// not itself enforce that -- the sort orchestrator (C6) is responsible for
/// never calling it with more streams than the planner's `fanout`.
pub fn merge<T: Item>(
    inputs: &mut [Stream<T, RandomAccessFile>],
    output: &mut Stream<T, RandomAccessFile>,
    cmp: impl Fn(&T, &T) -> Ordering,
) -> Result<()> {
    reject_path_aliases(
        inputs
            .iter()
            .map(|s| s.canonical_path())
            .chain(std::iter::once(output.canonical_path())),
    )?;
    let refs: Vec<&mut Stream<T, RandomAccessFile>> = inputs.iter_mut().collect();
    let mut cursor = MergeCursor::new(refs, cmp)?;
    while let Some(item) = cursor.next()? {
        output.write_item(item)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::temp::DefaultTempPathProvider;

    fn stream_of(mem: &MemoryManager, temp: &DefaultTempPathProvider, xs: &[i64]) -> Stream<i64> {
        let mut s = Stream::new_temp(mem.clone(), temp).unwrap();
        for &x in xs {
            s.write_item(x).unwrap();
        }
        s.seek(0).unwrap();
        s
    }

    fn drain(s: &mut Stream<i64>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(x) = s.read_item().unwrap() {
            out.push(x);
        }
        out
    }

    #[test]
    fn merge_of_two_sorted_streams_is_sorted_union() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();
        let mut a = stream_of(&mem, &temp, &[1, 3, 5, 7]);
        let mut b = stream_of(&mem, &temp, &[2, 4, 6]);
        let mut out = Stream::new_temp(mem.clone(), &temp).unwrap();

        merge(&mut [a, b], &mut out, |x, y| x.cmp(y)).unwrap();

        out.seek(0).unwrap();
        assert_eq!(drain(&mut out), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn merge_is_stable_on_ties() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();
        // Encode (key, original index) so stability is directly observable.
        let mut a = stream_of(&mem, &temp, &[1, 100 + 1, 200 + 1]);
        let mut b = stream_of(&mem, &temp, &[1, 300 + 1]);
        let mut out = Stream::new_temp(mem.clone(), &temp).unwrap();

        let key = |v: &i64| v % 100;
        merge(&mut [a, b], &mut out, |x, y| key(x).cmp(&key(y))).unwrap();

        out.seek(0).unwrap();
        // All four items share key 1; stream a's items must precede stream
        // b's at each tied key, and within a stream, original order holds.
        assert_eq!(drain(&mut out), vec![1, 101, 201, 301]);
    }

    #[test]
    fn seven_way_merge_handles_uneven_lengths() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();
        let mut streams = Vec::new();
        for i in 0..7i64 {
            let xs: Vec<i64> = (0..(i + 1)).map(|j| j * 7 + i).collect();
            streams.push(stream_of(&mem, &temp, &xs));
        }
        let mut out = Stream::new_temp(mem.clone(), &temp).unwrap();
        merge(&mut streams, &mut out, |x, y| x.cmp(y)).unwrap();

        out.seek(0).unwrap();
        let mut got = drain(&mut out);
        let mut want = got.clone();
        want.sort_unstable();
        assert_eq!(got, want);
        got.dedup();
        assert_eq!(got.len(), want.len());
    }
}
