//! Two-level exclusive prefix scan over a 0/1 array.
//!
//! Phase A scans each `SCAN_BLOCK`-sized block independently (one work-group
//! per block, two items per invocation, Blelloch up-sweep / down-sweep) and
//! records the block total in the group-sums array. Phase B scans the
//! group-sums array with a single work-group. The consumer combines the two:
//! `prefix(i) = local[i] + group_sums[i / SCAN_BLOCK]`.
//!
//! The group-sums array has exactly `SCAN_BLOCK` slots, which caps the input
//! at [`MAX_SCAN_ELEMENTS`]. The cap is checked once in
//! [`PrefixScanEngine::new`]; the per-step path never checks it.

use rayon::prelude::*;

use crate::error::KernelError;
use crate::workgroup::{padded_scan_len, MAX_SCAN_ELEMENTS, SCAN_BLOCK, WORKGROUP_SIZE};

/// In-place work-efficient exclusive scan of one block held in "shared
/// memory". Returns the block total.
///
/// Each inner `for thread in ..` loop is what the `WORKGROUP_SIZE`
/// invocations of the group execute in lock-step between two workgroup
/// barriers.
fn blelloch_scan(shared: &mut [u32; SCAN_BLOCK]) -> u32 {
    let n = SCAN_BLOCK;
    let mut offset = 1;

    // Up-sweep (reduce).
    let mut active = n >> 1;
    while active > 0 {
        for thread in 0..active {
            let ai = offset * (2 * thread + 1) - 1;
            let bi = offset * (2 * thread + 2) - 1;
            shared[bi] = shared[bi].wrapping_add(shared[ai]);
        }
        offset <<= 1;
        active >>= 1;
    }

    let total = shared[n - 1];
    shared[n - 1] = 0;

    // Down-sweep.
    let mut active = 1;
    while active < n {
        offset >>= 1;
        for thread in 0..active {
            let ai = offset * (2 * thread + 1) - 1;
            let bi = offset * (2 * thread + 2) - 1;
            let t = shared[ai];
            shared[ai] = shared[bi];
            shared[bi] = shared[bi].wrapping_add(t);
        }
        active <<= 1;
    }

    total
}

/// Buffers and phases of the two-level scan.
#[derive(Debug, Clone)]
pub struct PrefixScanEngine {
    /// Input flags before phase A, block-local exclusive prefixes after.
    local: Vec<u32>,
    /// Block totals after phase A, their exclusive prefixes after phase B.
    group_sums: Vec<u32>,
    len: usize,
    total: u32,
}

impl PrefixScanEngine {
    /// Size the buffers for inputs of up to `len` elements.
    pub fn new(len: usize) -> Result<Self, KernelError> {
        let padded = padded_scan_len(len);
        if padded > MAX_SCAN_ELEMENTS {
            return Err(KernelError::CapacityExceeded {
                requested: len,
                max: MAX_SCAN_ELEMENTS,
            });
        }
        debug_assert_eq!(SCAN_BLOCK, 2 * WORKGROUP_SIZE as usize);
        Ok(Self {
            local: vec![0; padded],
            group_sums: vec![0; SCAN_BLOCK],
            len,
            total: 0,
        })
    }

    /// Logical input length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when sized for zero elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of phase-A work-groups.
    pub fn group_count(&self) -> usize {
        self.local.len() / SCAN_BLOCK
    }

    /// Input slot for the caller to fill with 0/1 flags before [`Self::run`].
    pub fn flags_mut(&mut self) -> &mut [u32] {
        &mut self.local[..self.len]
    }

    /// Phase A: scan every block, write block totals.
    pub fn scan_blocks(&mut self) {
        let len = self.len;
        let groups = self.group_count();
        self.group_sums[groups..].fill(0);

        self.local
            .par_chunks_mut(SCAN_BLOCK)
            .zip(self.group_sums.par_iter_mut())
            .enumerate()
            .for_each(|(group, (block, sum))| {
                let base = group * SCAN_BLOCK;
                let mut shared = [0u32; SCAN_BLOCK];
                // Padding past `len` reads as zero.
                let valid = len.saturating_sub(base).min(SCAN_BLOCK);
                shared[..valid].copy_from_slice(&block[..valid]);
                *sum = blelloch_scan(&mut shared);
                block.copy_from_slice(&shared);
            });
    }

    /// Phase B: a single work-group scans the block totals.
    pub fn scan_group_sums(&mut self) {
        let mut shared = [0u32; SCAN_BLOCK];
        shared.copy_from_slice(&self.group_sums);
        self.total = blelloch_scan(&mut shared);
        self.group_sums.copy_from_slice(&shared);
    }

    /// Both phases, with the barrier between them.
    pub fn run(&mut self) {
        self.scan_blocks();
        self.scan_group_sums();
    }

    /// Combined exclusive prefix for element `i`.
    #[inline]
    pub fn prefix(&self, i: usize) -> u32 {
        self.local[i] + self.group_sums[i / SCAN_BLOCK]
    }

    /// Sum of all input flags.
    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }
}

/// Serial exclusive scan, the reference the parallel engine must match.
pub fn exclusive_scan_serial(input: &[u32]) -> (Vec<u32>, u32) {
    let mut out = Vec::with_capacity(input.len());
    let mut running = 0u32;
    for &v in input {
        out.push(running);
        running += v;
    }
    (out, running)
}
