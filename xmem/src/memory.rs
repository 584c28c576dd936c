//! Process-wide memory accounting (C1).
//!
//! Every sizeable buffer an external-memory algorithm allocates -- block
//! cache pages, run buffers, the loser tree, merge output buffers -- goes
//! through a [`MemoryManager`] so that the sum of all such allocations never
//! exceeds a caller-declared budget. The manager is an explicit handle
//! passed into stream/sort constructors, not a singleton reached for deep in
//! the call stack; [`MemoryManager::default_handle`] exists purely so a
//! caller that doesn't care about sharing a budget across multiple sorts
//! doesn't have to thread one through by hand.

use crate::error::{Error, Result};
use std::sync::{Mutex, OnceLock};

struct Inner {
    limit: u64,
    in_use: u64,
}

/// Tracks bytes currently reserved against a fixed budget.
///
/// Cloning is cheap and shares the same counter (it's an `Arc` under the
/// hood); every clone sees the same `in_use`/`limit`.
#[derive(Clone)]
pub struct MemoryManager(std::sync::Arc<Mutex<Inner>>);

impl MemoryManager {
    /// Creates a manager with the given byte budget.
    pub fn new(limit: u64) -> Self {
        MemoryManager(std::sync::Arc::new(Mutex::new(Inner { limit, in_use: 0 })))
    }

    /// A process-wide default instance, lazily created on first use with no
    /// limit set (callers that want a real budget should call
    /// [`MemoryManager::new`] and thread the handle through explicitly;
    /// this exists for convenience only).
    pub fn default_handle() -> &'static MemoryManager {
        static DEFAULT: OnceLock<MemoryManager> = OnceLock::new();
        DEFAULT.get_or_init(|| MemoryManager::new(u64::MAX))
    }

    /// Replaces the limit. Fails with [`Error::InvalidState`] if any bytes
    /// are currently reserved -- changing the budget mid-flight would make
    /// outstanding reservations inconsistent with the new limit.
    pub fn set_limit(&self, limit: u64) -> Result<()> {
        let mut inner = self.0.lock().unwrap();
        if inner.in_use != 0 {
            return Err(Error::InvalidState(
                "cannot change memory limit while allocations are outstanding".into(),
            ));
        }
        inner.limit = limit;
        Ok(())
    }

    /// Reserves `n` bytes against the budget, or fails with
    /// [`Error::MemoryExceeded`] if doing so would exceed the limit.
    pub fn register_allocation(&self, n: u64) -> Result<()> {
        let mut inner = self.0.lock().unwrap();
        let available = inner.limit.saturating_sub(inner.in_use);
        if n > available {
            return Err(Error::MemoryExceeded {
                requested: n,
                available,
            });
        }
        inner.in_use += n;
        Ok(())
    }

    /// Releases a previous reservation of `n` bytes.
    ///
    /// Releasing more than was ever reserved is a programming error, not a
    /// recoverable condition -- it indicates a bookkeeping bug in the
    /// caller, so it panics rather than returning `Result`.
    pub fn register_deallocation(&self, n: u64) {
        let mut inner = self.0.lock().unwrap();
        inner.in_use = inner
            .in_use
            .checked_sub(n)
            .expect("memory accounting underflow: deallocated more than was reserved");
    }

    pub fn in_use(&self) -> u64 {
        self.0.lock().unwrap().in_use
    }

    pub fn limit(&self) -> u64 {
        self.0.lock().unwrap().limit
    }

    pub fn available(&self) -> u64 {
        let inner = self.0.lock().unwrap();
        inner.limit.saturating_sub(inner.in_use)
    }
}

/// RAII guard releasing a memory reservation on drop.
///
/// Holding one of these for the lifetime of a buffer means a panicking or
/// early-returning (`?`) caller can never leak a reservation, the same
/// `Drop`-based discipline this crate's streams apply to file resources,
/// generalized here to memory accounting.
pub struct MemoryReservation {
    mem: MemoryManager,
    bytes: u64,
}

impl MemoryReservation {
    pub fn acquire(mem: &MemoryManager, bytes: u64) -> Result<Self> {
        mem.register_allocation(bytes)?;
        Ok(MemoryReservation {
            mem: mem.clone(),
            bytes,
        })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.mem.register_deallocation(self.bytes);
    }
}
