//! Timestamp and CPU sources for trace events.
//!
//! The kernel build reads both from axhal. Everywhere else (hosted tests,
//! kernels without axhal) they come from a hand-driven clock in [`mock`].

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// =============================================================================
// Kernel Source (axhal)
// =============================================================================

#[cfg(all(not(test), feature = "axhal"))]
mod source {
    pub fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    pub fn cpu_id() -> u32 {
        axhal::percpu::this_cpu_id() as u32
    }
}

// =============================================================================
// Manual Source
// =============================================================================

static CLOCK_NS: AtomicU64 = AtomicU64::new(1_000_000_000);
static CPU: AtomicU32 = AtomicU32::new(0);

#[cfg(any(test, not(feature = "axhal")))]
mod source {
    use super::{CLOCK_NS, CPU, Ordering};

    pub fn time_ns() -> u64 {
        CLOCK_NS.load(Ordering::Relaxed)
    }

    pub fn cpu_id() -> u32 {
        CPU.load(Ordering::Relaxed)
    }
}

/// Controls for the manual source. Without axhal these decide what trace
/// events are stamped with.
pub mod mock {
    use super::{CLOCK_NS, CPU, Ordering};

    /// Pin the clock.
    pub fn set_time_ns(ns: u64) {
        CLOCK_NS.store(ns, Ordering::Relaxed);
    }

    /// Move the clock forward.
    pub fn advance_ns(ns: u64) {
        CLOCK_NS.fetch_add(ns, Ordering::Relaxed);
    }

    /// Pretend to run on `cpu`.
    pub fn set_cpu_id(cpu: u32) {
        CPU.store(cpu, Ordering::Relaxed);
    }
}

/// Monotonic time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    source::time_ns()
}

/// Id of the executing CPU.
#[inline]
pub fn cpu_id() -> u32 {
    source::cpu_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_and_cpu() {
        mock::set_time_ns(5000);
        mock::advance_ns(1000);
        assert_eq!(time_ns(), 6000);

        mock::set_cpu_id(3);
        assert_eq!(cpu_id(), 3);
    }
}
