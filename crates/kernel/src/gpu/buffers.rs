//! GPU buffer management for the collision pipeline.
//!
//! Creates the storage buffers shared by every pipeline (group 1), the
//! dynamic-offset uniform buffer of per-pass parameters (group 0) and one
//! reusable staging buffer for readback.

use wgpu::util::DeviceExt;

use crate::bvh::BvhNode;
use crate::error::KernelError;
use crate::morton::SortKey;
use crate::particle::{Particle, PropertiesTable};
use crate::workgroup::{padded_scan_len, SCAN_BLOCK};

/// Stride between parameter slots; the default
/// `min_uniform_buffer_offset_alignment`.
pub const PARAM_SLOT_SIZE: u64 = 256;

/// Slot used by every pass that is not a radix pass.
pub const GENERIC_SLOT: u32 = 32;

/// Radix passes use slots `0..32`, everything else [`GENERIC_SLOT`].
pub const PARAM_SLOTS: u32 = GENERIC_SLOT + 1;

/// Per-pass parameters. Must match `Params` in `common.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuParams {
    pub count: u32,
    pub active_count: u32,
    pub bit: u32,
    pub current: u32,
    pub extent: f32,
    pub candidate_capacity: u32,
    pub padded: u32,
    pub group_count: u32,
}

/// Minimum buffer size (wgpu requires non-zero buffers).
const MIN_BUF_SIZE: u64 = 4;

/// Storage usage shared by every pipeline buffer.
const STORAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Create a zeroed storage buffer of `size` bytes.
fn create_storage_buf(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(MIN_BUF_SIZE),
        usage: STORAGE,
        mapped_at_creation: false,
    })
}

/// All buffers of one kernel.
pub struct GpuBuffers {
    pub params: wgpu::Buffer,

    /// `2 * capacity` particles: live half then scratch half.
    pub particles: wgpu::Buffer,
    pub properties: wgpu::Buffer,
    /// `2 * capacity` sort pairs: the radix double buffer.
    pub keys: wgpu::Buffer,
    pub scan_local: wgpu::Buffer,
    pub group_sums: wgpu::Buffer,
    /// `[0]` holds the zero count of the last scan.
    pub counters: wgpu::Buffer,
    pub nodes: wgpu::Buffer,
    /// Four `f32` bit patterns per node, merged atomically.
    pub boxes: wgpu::Buffer,
    pub visits: wgpu::Buffer,
    pub candidates: wgpu::Buffer,
    pub found: wgpu::Buffer,
    pub impulses: wgpu::Buffer,

    /// Large enough for the biggest readback.
    pub staging: wgpu::Buffer,

    pub capacity: u32,
    pub candidate_capacity: u32,
    pub padded: u32,
    pub group_count: u32,
}

impl GpuBuffers {
    /// Allocate everything for `capacity` particles.
    pub fn new(
        device: &wgpu::Device,
        capacity: usize,
        candidate_capacity: usize,
        properties: &PropertiesTable,
    ) -> Self {
        let particle_size = std::mem::size_of::<Particle>() as u64;
        let node_size = std::mem::size_of::<BvhNode>() as u64;
        let key_size = std::mem::size_of::<SortKey>() as u64;
        let cap = capacity as u64;
        let node_count = (2 * cap).saturating_sub(1);
        let slots = cap * candidate_capacity as u64;
        let padded = padded_scan_len(capacity);

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("params"),
            size: PARAM_SLOT_SIZE * PARAM_SLOTS as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let properties = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("properties"),
            contents: bytemuck::cast_slice(properties.as_slice()),
            usage: STORAGE,
        });

        let staging_size = [
            particle_size * cap,
            node_size * node_count,
            key_size * cap,
            4 * slots,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
        .max(MIN_BUF_SIZE);

        Self {
            params,
            particles: create_storage_buf(device, "particles", 2 * particle_size * cap),
            properties,
            keys: create_storage_buf(device, "sort_keys", 2 * key_size * cap),
            scan_local: create_storage_buf(device, "scan_local", 4 * padded as u64),
            group_sums: create_storage_buf(device, "group_sums", 4 * SCAN_BLOCK as u64),
            counters: create_storage_buf(device, "counters", 16),
            nodes: create_storage_buf(device, "bvh_nodes", node_size * node_count),
            boxes: create_storage_buf(device, "bvh_boxes", 16 * node_count),
            visits: create_storage_buf(device, "bvh_visits", 4 * cap),
            candidates: create_storage_buf(device, "candidates", 4 * slots),
            found: create_storage_buf(device, "found", 4 * cap),
            impulses: create_storage_buf(device, "impulses", 8 * slots),
            staging: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging"),
                size: staging_size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            capacity: capacity as u32,
            candidate_capacity: candidate_capacity as u32,
            padded: padded as u32,
            group_count: (padded / SCAN_BLOCK) as u32,
        }
    }

    /// Parameters shared by every slot; passes override `bit` and `current`.
    pub fn base_params(&self, active: u32, extent: f32) -> GpuParams {
        GpuParams {
            count: self.capacity,
            active_count: active,
            bit: 0,
            current: 0,
            extent,
            candidate_capacity: self.candidate_capacity,
            padded: self.padded,
            group_count: self.group_count,
        }
    }

    /// Write all parameter slots for one step.
    pub fn write_params(&self, queue: &wgpu::Queue, base: GpuParams) {
        let mut bytes = vec![0u8; (PARAM_SLOT_SIZE * PARAM_SLOTS as u64) as usize];
        for slot in 0..PARAM_SLOTS {
            let params = if slot < GENERIC_SLOT {
                GpuParams {
                    bit: slot,
                    current: slot & 1,
                    ..base
                }
            } else {
                base
            };
            let start = (slot as u64 * PARAM_SLOT_SIZE) as usize;
            let raw = bytemuck::bytes_of(&params);
            bytes[start..start + raw.len()].copy_from_slice(raw);
        }
        queue.write_buffer(&self.params, 0, &bytes);
    }

    /// Upload the live particles into the first half of the particle buffer.
    pub fn upload_particles(&self, queue: &wgpu::Queue, live: &[Particle]) {
        if !live.is_empty() {
            queue.write_buffer(&self.particles, 0, bytemuck::cast_slice(live));
        }
    }

    /// Copy the first `count` records of `source` back to the host.
    pub fn read<T: bytemuck::Pod>(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        source: &wgpu::Buffer,
        count: usize,
    ) -> Result<Vec<T>, KernelError> {
        let byte_len = (count * std::mem::size_of::<T>()) as u64;
        if byte_len == 0 {
            return Ok(Vec::new());
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(source, 0, &self.staging, 0, byte_len);
        queue.submit(std::iter::once(encoder.finish()));

        let slice = self.staging.slice(..byte_len);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| KernelError::GpuReadback(e.to_string()))?
            .map_err(|e| KernelError::GpuReadback(e.to_string()))?;

        let data = slice.get_mapped_range();
        let result: Vec<T> = bytemuck::cast_slice(&data)[..count].to_vec();
        drop(data);
        self.staging.unmap();
        Ok(result)
    }
}
