//! Work-group dispatch model shared by the CPU and GPU back-ends.
//!
//! Both back-ends think in terms of fixed-size work-groups. On the GPU these
//! are real `@workgroup_size(256)` dispatches; on the CPU each stage is one
//! `rayon` parallel loop over invocation ids, and returning from that loop is
//! the global barrier between stages.

use std::sync::atomic::{AtomicU32, Ordering};

/// Invocations per work-group. Must match `@workgroup_size` in the shaders.
pub const WORKGROUP_SIZE: u32 = 256;

/// Elements processed by each invocation of the prefix scan.
pub const ITEMS_PER_THREAD: u32 = 2;

/// Elements scanned by one work-group in a single scan phase.
pub const SCAN_BLOCK: usize = (WORKGROUP_SIZE * ITEMS_PER_THREAD) as usize;

/// Largest array the two-level scan handles: phase B runs on exactly one
/// work-group, so there can be at most `SCAN_BLOCK` group sums.
pub const MAX_SCAN_ELEMENTS: usize = SCAN_BLOCK * SCAN_BLOCK;

/// Number of work-groups needed to cover `total` invocations.
#[inline]
pub fn dispatch_size(total: u32, workgroup_size: u32) -> u32 {
    total.div_ceil(workgroup_size)
}

/// Round `len` up to a whole number of scan blocks (at least one block).
#[inline]
pub fn padded_scan_len(len: usize) -> usize {
    len.max(1).div_ceil(SCAN_BLOCK) * SCAN_BLOCK
}

/// Scalar atomic accumulator handed to whichever stage needs one.
///
/// The simulation owns one of these per step; the particle updater bumps it
/// once per surviving particle and the kernel reads it as the length of the
/// active prefix after sorting.
#[derive(Debug, Default)]
pub struct ActiveCounter(AtomicU32);

impl ActiveCounter {
    /// A counter starting at zero.
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// A counter pre-set to `value`.
    pub fn with_value(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// Add one; safe to call from many invocations at once.
    #[inline]
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`.
    #[inline]
    pub fn add(&self, n: u32) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value. Only meaningful after the producing stage's barrier.
    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Overwrite the value.
    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Release);
    }

    /// Reset to zero at the start of a step.
    pub fn reset(&self) {
        self.set(0);
    }
}
