//! LSB-first binary radix sort of `(key, index)` pairs.
//!
//! One pass per key bit. Each pass flags the elements whose bit is zero, runs
//! the two-level prefix scan over the flags and scatters every pair into the
//! opposite half of a double buffer:
//!
//! * bit 0: destination `zeros_before(i)`
//! * bit 1: destination `total_zeros + (i - zeros_before(i))`
//!
//! The scatter is a permutation, so no two invocations write the same slot,
//! and the relative order inside each bucket is preserved, which makes the
//! whole sort stable. The current half flips after every pass; after an even
//! number of passes the result is back in half 0.

use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;

use crate::error::KernelError;
use crate::morton::{KeyGenerator, SortKey};
use crate::particle::{Particle, ParticleBuffer};
use crate::scan::PrefixScanEngine;

/// Number of binary passes: one per key bit.
pub const KEY_BITS: u32 = u32::BITS;

/// Split the key store into `(current, other)` halves.
fn halves(keys: &[AtomicU64], len: usize, current: usize) -> (&[AtomicU64], &[AtomicU64]) {
    let (a, b) = keys.split_at(len);
    if current == 0 {
        (a, b)
    } else {
        (b, a)
    }
}

/// Key double buffer plus the scan engine used by every pass.
///
/// Pairs are stored packed in `AtomicU64` slots so that the parallel scatter
/// writes through shared references.
#[derive(Debug)]
pub struct ParallelRadixSorter {
    keys: Vec<AtomicU64>,
    sorted: Vec<SortKey>,
    len: usize,
    current: usize,
    scan: PrefixScanEngine,
}

impl ParallelRadixSorter {
    /// Allocate buffers for `len` pairs.
    pub fn new(len: usize) -> Result<Self, KernelError> {
        let scan = PrefixScanEngine::new(len)?;
        Ok(Self {
            keys: (0..len * 2).map(|_| AtomicU64::new(0)).collect(),
            sorted: vec![SortKey::default(); len],
            len,
            current: 0,
            scan,
        })
    }

    /// Number of pairs sorted per call.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when sized for zero pairs.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Which half currently holds the latest pass output.
    pub fn current_half(&self) -> usize {
        self.current
    }

    /// Fill the current half with one key per particle slot.
    pub fn generate_keys(&mut self, generator: &KeyGenerator, particles: &[Particle]) {
        debug_assert_eq!(particles.len(), self.len);
        let len = self.len;
        let current = self.current;
        let (dst, _) = halves(&self.keys, len, current);
        dst.par_iter()
            .zip(particles.par_iter())
            .enumerate()
            .for_each(|(i, (slot, p))| {
                slot.store(generator.key(i, p).pack(), Ordering::Relaxed);
            });
    }

    /// Load externally produced pairs into the current half.
    pub fn load(&mut self, pairs: &[SortKey]) {
        debug_assert_eq!(pairs.len(), self.len);
        let (dst, _) = halves(&self.keys, self.len, self.current);
        dst.par_iter()
            .zip(pairs.par_iter())
            .for_each(|(slot, k)| slot.store(k.pack(), Ordering::Relaxed));
    }

    /// One binary pass on `bit`, ending with the half flip.
    pub fn pass(&mut self, bit: u32) {
        let (src, dst) = halves(&self.keys, self.len, self.current);

        // Extract: flag = 1 when the bit is zero.
        self.scan
            .flags_mut()
            .par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(flag, slot)| {
                let key = SortKey::unpack(slot.load(Ordering::Relaxed)).key;
                *flag = ((key >> bit) & 1 == 0) as u32;
            });

        self.scan.run();

        let scan = &self.scan;
        let total_zeros = scan.total();
        src.par_iter().enumerate().for_each(|(i, slot)| {
            let packed = slot.load(Ordering::Relaxed);
            let key = SortKey::unpack(packed).key;
            let zeros_before = scan.prefix(i);
            let dest = if (key >> bit) & 1 == 0 {
                zeros_before
            } else {
                total_zeros + (i as u32 - zeros_before)
            };
            dst[dest as usize].store(packed, Ordering::Relaxed);
        });

        self.current ^= 1;
    }

    /// All 32 passes, then snapshot the result into [`Self::sorted`].
    pub fn sort(&mut self) {
        for bit in 0..KEY_BITS {
            self.pass(bit);
        }
        let (src, _) = halves(&self.keys, self.len, self.current);
        self.sorted
            .par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(out, slot)| *out = SortKey::unpack(slot.load(Ordering::Relaxed)));
    }

    /// Pairs in sorted order, valid after [`Self::sort`].
    pub fn sorted(&self) -> &[SortKey] {
        &self.sorted
    }

    /// Gather the live particles into the scratch half in sorted order, then
    /// copy them back so the live half is in key order.
    pub fn reorder_particles(&self, buffer: &mut ParticleBuffer) {
        let (live, scratch) = buffer.halves_mut();
        let source: &[Particle] = &*live;
        scratch
            .par_iter_mut()
            .zip(self.sorted.par_iter())
            .for_each(|(out, k)| *out = source[k.index as usize]);
        live.par_iter_mut()
            .zip(scratch.par_iter())
            .for_each(|(out, p)| *out = *p);
    }
}
