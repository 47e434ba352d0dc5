//! Morton (Z-order) sort keys.
//!
//! Positions in `[-extent, extent]` are quantized to 10 bits per axis and
//! interleaved into a 20-bit key, x on the even bits and y on the odd bits.
//! Inactive particles get [`INACTIVE_KEY`] so the sort pushes them to the end.

use crate::particle::Particle;

/// Bits of quantization per axis.
pub const BITS_PER_AXIS: u32 = 10;

/// Number of quantization cells per axis.
pub const CELLS_PER_AXIS: u32 = 1 << BITS_PER_AXIS;

/// Key assigned to inactive particles: every bit set, so it sorts last.
pub const INACTIVE_KEY: u32 = u32::MAX;

/// Sort key paired with the index the particle had before sorting.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SortKey {
    /// Morton code, or [`INACTIVE_KEY`].
    pub key: u32,
    /// Pre-sort particle index.
    pub index: u32,
}

impl SortKey {
    /// Pack into one `u64` (key in the high word).
    #[inline]
    pub fn pack(self) -> u64 {
        ((self.key as u64) << 32) | self.index as u64
    }

    /// Inverse of [`SortKey::pack`].
    #[inline]
    pub fn unpack(packed: u64) -> Self {
        Self {
            key: (packed >> 32) as u32,
            index: packed as u32,
        }
    }
}

/// Spread the low 16 bits of `v` so that bit `k` moves to bit `2k`.
#[inline]
pub fn expand_bits(v: u32) -> u32 {
    let mut x = v & 0x0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333;
    x = (x | (x << 1)) & 0x5555_5555;
    x
}

/// Map a world coordinate to a cell in `[0, CELLS_PER_AXIS)`.
///
/// The value is clamped before the float-to-int truncation, so positions
/// outside the world box land on the border cells. NaN maps to cell 0.
#[inline]
pub fn quantize(coord: f32, extent: f32) -> u32 {
    let unit = (coord + extent) / (2.0 * extent);
    (unit * CELLS_PER_AXIS as f32).clamp(0.0, (CELLS_PER_AXIS - 1) as f32) as u32
}

/// Interleave two 10-bit cell coordinates.
#[inline]
pub fn morton_2d(cx: u32, cy: u32) -> u32 {
    expand_bits(cx) | (expand_bits(cy) << 1)
}

/// Key for one particle.
#[inline]
pub fn particle_key(particle: &Particle, extent: f32) -> u32 {
    if !particle.is_active() {
        return INACTIVE_KEY;
    }
    morton_2d(
        quantize(particle.x(), extent),
        quantize(particle.y(), extent),
    )
}

/// Turns particle positions into sortable keys.
#[derive(Debug, Clone, Copy)]
pub struct KeyGenerator {
    extent: f32,
}

impl KeyGenerator {
    /// `extent` is the half-width of the square world centred on the origin.
    pub fn new(extent: f32) -> Self {
        debug_assert!(extent > 0.0, "world extent must be positive");
        Self { extent }
    }

    /// Half-width of the world.
    pub fn extent(&self) -> f32 {
        self.extent
    }

    /// Sort key for the particle currently stored at `index`.
    #[inline]
    pub fn key(&self, index: usize, particle: &Particle) -> SortKey {
        SortKey {
            key: particle_key(particle, self.extent),
            index: index as u32,
        }
    }
}
