//! Trap dispatcher.
//!
//! Runs in trap context on any CPU. Everything reachable from
//! [`FbtProvider::invop`] is lock-free and allocation-free: the table lookup
//! reads atomics only, stack reads go through the host's guarded read, and
//! counters are relaxed atomics.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{Arch, Emulate};
use crate::engine::ProbeKind;
use crate::provider::FbtProvider;

/// Trap path counters.
pub struct DispatchStats {
    entry_fires: AtomicU64,
    return_fires: AtomicU64,
    misses: AtomicU64,
    bad_reads: AtomicU64,
}

/// Immutable snapshot of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub entry_fires: u64,
    pub return_fires: u64,
    /// Traps at addresses without a record.
    pub misses: u64,
    /// Stack words that faulted and were reported as 0.
    pub bad_reads: u64,
}

impl DispatchStats {
    pub const fn new() -> Self {
        Self {
            entry_fires: AtomicU64::new(0),
            return_fires: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bad_reads: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            entry_fires: self.entry_fires.load(Ordering::Relaxed),
            return_fires: self.return_fires.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bad_reads: self.bad_reads.load(Ordering::Relaxed),
        }
    }
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FbtProvider {
    /// Handle a trap at `addr`.
    ///
    /// `stack` is the trapped stack pointer and `rval` the value in the
    /// return register. Returns the instruction the host must emulate, or
    /// `None` if the trap is not ours.
    pub fn invop(&self, addr: usize, stack: usize, rval: usize) -> Option<Emulate> {
        let Some(hit) = self.table.lookup(addr) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let engine = &self.env.engine;

        if hit.roffset == 0 {
            let word = self.config.arch.word_size();
            let mut vals = [0usize; 6];
            for (i, val) in vals.iter_mut().enumerate() {
                *val = self.read_stack(stack.wrapping_add(i * word));
            }
            self.stats.entry_fires.fetch_add(1, Ordering::Relaxed);
            engine.fire(
                hit.id,
                ProbeKind::Entry,
                vals[0],
                [vals[1], vals[2], vals[3], vals[4], vals[5]],
            );
        } else {
            // At a bare ret the return address is still on top of the stack.
            let caller = match self.config.arch {
                Arch::X86_64 => self.read_stack(stack),
                Arch::I386 => 0,
            };
            self.stats.return_fires.fetch_add(1, Ordering::Relaxed);
            engine.fire(hit.id, ProbeKind::Return, caller, [hit.roffset, rval, 0, 0, 0]);
        }

        Some(hit.emulate)
    }

    #[inline]
    fn read_stack(&self, addr: usize) -> usize {
        match self.env.memory.read_word_nofault(addr) {
            Some(val) => val,
            None => {
                self.stats.bad_reads.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Trap path counters.
    pub fn dispatch_stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }
}
