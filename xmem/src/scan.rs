//! Scan driver (C4): drives a user-supplied transformation object over N
//! input streams and M output streams in lockstep.

use crate::error::Result;
use crate::stream::{reject_path_aliases, Item, Stream};
use sync_file::{ReadAt, WriteAt};

/// What a scan object's `operate` call tells the driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSignal {
    /// Keep calling `operate` as more input becomes available.
    Continue,
    /// Stop driving this scan, even if some inputs still have data.
    Done,
}

/// A user-supplied stateful transformation, driven by [`scan`] across a
/// fixed arity of `NIN` inputs and `NOUT` outputs sharing one item type per
/// side. The arity is const-generic rather than one hand-written type per
/// (input count, output count, item type) combination, since callers never
/// need heterogeneous item types across the inputs of a single scan call.
pub trait ScanObject<const NIN: usize, const NOUT: usize> {
    /// Item type read from every input stream.
    type In: Item;
    /// Item type written to every output stream.
    type Out: Item;

    /// Called once before the first `operate` call.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once per lockstep round with one item from each input (`None`
    /// where that input has reached end of stream). Returns the signal for
    /// the driver plus, for each output, the item to write (or `None` to
    /// produce nothing on that output this round).
    fn operate(
        &mut self,
        inputs: [Option<Self::In>; NIN],
    ) -> Result<(ScanSignal, [Option<Self::Out>; NOUT])>;
}

/// Drives `obj` across `inputs` and `outputs` until either every input is
/// exhausted or `obj` signals [`ScanSignal::Done`].
///
/// Termination rule: the driver reads one item from each input every round;
/// if all inputs came back absent, it stops without calling `operate` again
/// (a safety net so a scan object that never signals `Done` still
/// terminates at end of input). Otherwise it calls `operate`, writes
/// whichever outputs were produced, and stops immediately if the signal was
/// `Done` -- even if some inputs still have data, matching scan objects
/// like "emit min(a, b) until either side ends", which must stop as soon as
/// one side runs dry rather than waiting for both. A zero-input scan
/// (`NIN == 0`) is exempt from the all-absent check, since an empty
/// lockstep read is vacuously "all absent" every round; such a scan runs
/// until it signals `Done` on its own.
pub fn scan<S, const NIN: usize, const NOUT: usize, F>(
    obj: &mut S,
    inputs: &mut [&mut Stream<S::In, F>; NIN],
    outputs: &mut [&mut Stream<S::Out, F>; NOUT],
) -> Result<()>
where
    S: ScanObject<NIN, NOUT>,
    F: ReadAt + WriteAt,
{
    reject_path_aliases(
        inputs
            .iter()
            .map(|s| s.canonical_path())
            .chain(outputs.iter().map(|s| s.canonical_path())),
    )?;
    obj.initialize()?;
    loop {
        let mut ins: [Option<S::In>; NIN] = [None; NIN];
        for i in 0..NIN {
            ins[i] = inputs[i].read_item()?;
        }
        let all_absent = NIN > 0 && ins.iter().all(Option::is_none);
        if all_absent {
            break;
        }
        let (signal, outs) = obj.operate(ins)?;
        for i in 0..NOUT {
            if let Some(v) = outs[i] {
                outputs[i].write_item(v)?;
            }
        }
        if signal == ScanSignal::Done {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::temp::DefaultTempPathProvider;

    struct MinUntilEither;

    impl ScanObject<2, 1> for MinUntilEither {
        type In = i64;
        type Out = i64;

        fn operate(
            &mut self,
            inputs: [Option<i64>; 2],
        ) -> Result<(ScanSignal, [Option<i64>; 1])> {
            match (inputs[0], inputs[1]) {
                (Some(a), Some(b)) => Ok((ScanSignal::Continue, [Some(a.min(b))])),
                _ => Ok((ScanSignal::Done, [None])),
            }
        }
    }

    fn stream_of(mem: &MemoryManager, temp: &DefaultTempPathProvider, xs: &[i64]) -> Stream<i64> {
        let mut s = Stream::new_temp(mem.clone(), temp).unwrap();
        for &x in xs {
            s.write_item(x).unwrap();
        }
        s.seek(0).unwrap();
        s
    }

    #[test]
    fn scan_stops_as_soon_as_either_input_is_exhausted() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();
        let mut a = stream_of(&mem, &temp, &[1, 2, 3]);
        let mut b = stream_of(&mem, &temp, &[10, 20]);
        let mut out = Stream::new_temp(mem.clone(), &temp).unwrap();

        let mut obj = MinUntilEither;
        scan(&mut obj, &mut [&mut a, &mut b], &mut [&mut out]).unwrap();

        out.seek(0).unwrap();
        let mut got = Vec::new();
        while let Some(x) = out.read_item().unwrap() {
            got.push(x);
        }
        assert_eq!(got, vec![1, 2]);
    }

    struct CopyThrough;

    impl ScanObject<1, 1> for CopyThrough {
        type In = i64;
        type Out = i64;

        fn operate(
            &mut self,
            inputs: [Option<i64>; 1],
        ) -> Result<(ScanSignal, [Option<i64>; 1])> {
            Ok((ScanSignal::Continue, [inputs[0]]))
        }
    }

    #[test]
    fn scan_is_deterministic_on_pure_objects() {
        let mem = MemoryManager::new(1 << 20);
        let temp = DefaultTempPathProvider::new();

        let run = || {
            let mut a = stream_of(&mem, &temp, &[1, 2, 3, 4, 5]);
            let mut out = Stream::new_temp(mem.clone(), &temp).unwrap();
            let mut obj = CopyThrough;
            scan(&mut obj, &mut [&mut a], &mut [&mut out]).unwrap();
            out.seek(0).unwrap();
            let mut got = Vec::new();
            while let Some(x) = out.read_item().unwrap() {
                got.push(x);
            }
            got
        };

        assert_eq!(run(), run());
    }
}
