//! GPU (Metal/Vulkan via wgpu) implementation of the collision pipeline.
//!
//! `GpuKernel` implements `CollisionKernel` with WGSL compute shaders. The
//! host keeps a mirror of the live particles: it is uploaded at the start of
//! every step and read back at the end, so emitters and the updater can keep
//! editing particles on the CPU between steps.
//!
//! # Architecture
//! Each step encodes one compute pass per stage into a single command
//! encoder; wgpu orders the passes and inserts the barriers between them.
//!
//! 1. `generate_keys`
//! 2. 32 x (`extract_bits`, `scan_blocks`, `scan_group_sums`, `scatter_keys`)
//! 3. `gather_particles`, `copy_back`
//! 4. `init_nodes`, `build_tree`, `merge_boxes`, `finalize_boxes`
//! 5. `detect`
//! 6. `compute_impulses`, `apply_impulses`
//!
//! # Bind group layout
//! - Group 0: per-pass `Params` uniform, selected by dynamic offset
//! - Group 1: every storage buffer (see `common.wgsl`)

pub mod buffers;

use buffers::{GpuBuffers, GpuParams, GENERIC_SLOT, PARAM_SLOT_SIZE};

use crate::bvh::BvhNode;
use crate::detect::CandidateLists;
use crate::error::KernelError;
use crate::morton::SortKey;
use crate::particle::{Particle, PropertiesTable};
use crate::radix_sort::KEY_BITS;
use crate::workgroup::{dispatch_size, ActiveCounter, WORKGROUP_SIZE};
use crate::{CollisionKernel, PipelineConfig, PipelineSnapshot, StepStats};

/// Storage buffers bound in group 1.
const STORAGE_BINDINGS: u32 = 12;

/// One compute pipeline per shader entry point.
struct Pipelines {
    generate_keys: wgpu::ComputePipeline,
    extract_bits: wgpu::ComputePipeline,
    scan_blocks: wgpu::ComputePipeline,
    scan_group_sums: wgpu::ComputePipeline,
    scatter_keys: wgpu::ComputePipeline,
    gather_particles: wgpu::ComputePipeline,
    copy_back: wgpu::ComputePipeline,
    init_nodes: wgpu::ComputePipeline,
    build_tree: wgpu::ComputePipeline,
    merge_boxes: wgpu::ComputePipeline,
    finalize_boxes: wgpu::ComputePipeline,
    detect: wgpu::ComputePipeline,
    compute_impulses: wgpu::ComputePipeline,
    apply_impulses: wgpu::ComputePipeline,
}

/// GPU-accelerated collision kernel using wgpu compute shaders.
pub struct GpuKernel {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Pipelines,
    params_bind_group: wgpu::BindGroup,
    data_bind_group: wgpu::BindGroup,
    bufs: GpuBuffers,

    /// Live particles, valid between steps.
    host: Vec<Particle>,
    /// Candidate lists as of the last snapshot.
    candidates: CandidateLists,
    extent: f32,
    active: u32,
    stats: StepStats,
}

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

impl GpuKernel {
    /// Create a GPU kernel whose live buffer starts with `particles`.
    ///
    /// Returns `Err(KernelError::GpuInit)` if no suitable adapter or device
    /// is found, allowing callers to fall back to `CpuKernel`.
    pub fn new(
        config: &PipelineConfig,
        properties: PropertiesTable,
        particles: &[Particle],
    ) -> Result<Self, KernelError> {
        config.validate()?;
        if properties.is_empty() {
            return Err(KernelError::EmptyPropertiesTable);
        }
        let capacity = config.capacity;
        if particles.len() > capacity {
            return Err(KernelError::CapacityExceeded {
                requested: particles.len(),
                max: capacity,
            });
        }
        let candidates = CandidateLists::new(capacity, config.candidate_capacity)?;

        // --- Device initialization ---
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| KernelError::GpuInit("No suitable GPU adapter found".into()))?;

        tracing::info!("GPU adapter: {:?}", adapter.get_info().name);

        // Every pipeline binds all twelve storage buffers in group 1, above
        // the default limit of eight.
        let adapter_limits = adapter.limits();
        if adapter_limits.max_storage_buffers_per_shader_stage < STORAGE_BINDINGS {
            return Err(KernelError::GpuInit(format!(
                "adapter supports {} storage buffers per stage, {} required",
                adapter_limits.max_storage_buffers_per_shader_stage, STORAGE_BINDINGS
            )));
        }
        let required_limits = wgpu::Limits {
            max_storage_buffers_per_shader_stage: STORAGE_BINDINGS,
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("collision_gpu_device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| KernelError::GpuInit(format!("Failed to create device: {e}")))?;

        let bufs = GpuBuffers::new(&device, capacity, config.candidate_capacity, &properties);

        // --- Shaders ---
        let common = include_str!("shaders/common.wgsl");
        let module = |label: &str, body: &str| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(format!("{common}\n{body}").into()),
            })
        };
        let sort_shader = module("sort", include_str!("shaders/sort.wgsl"));
        let bvh_shader = module("bvh", include_str!("shaders/bvh.wgsl"));
        let collide_shader = module("collide", include_str!("shaders/collide.wgsl"));

        // --- Bind group layouts ---
        let bgl_params = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("params_bgl"),
            entries: &[bgl_uniform_dynamic(0, std::mem::size_of::<GpuParams>() as u64)],
        });
        let storage_entries: Vec<wgpu::BindGroupLayoutEntry> =
            (0..STORAGE_BINDINGS).map(bgl_storage_rw).collect();
        let bgl_data = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("data_bgl"),
            entries: &storage_entries,
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("collision_pl"),
            bind_group_layouts: &[&bgl_params, &bgl_data],
            push_constant_ranges: &[],
        });

        let pipeline = |module: &wgpu::ShaderModule, entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&layout),
                module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let pipelines = Pipelines {
            generate_keys: pipeline(&sort_shader, "generate_keys"),
            extract_bits: pipeline(&sort_shader, "extract_bits"),
            scan_blocks: pipeline(&sort_shader, "scan_blocks"),
            scan_group_sums: pipeline(&sort_shader, "scan_group_sums"),
            scatter_keys: pipeline(&sort_shader, "scatter_keys"),
            gather_particles: pipeline(&sort_shader, "gather_particles"),
            copy_back: pipeline(&sort_shader, "copy_back"),
            init_nodes: pipeline(&bvh_shader, "init_nodes"),
            build_tree: pipeline(&bvh_shader, "build_tree"),
            merge_boxes: pipeline(&bvh_shader, "merge_boxes"),
            finalize_boxes: pipeline(&bvh_shader, "finalize_boxes"),
            detect: pipeline(&collide_shader, "detect"),
            compute_impulses: pipeline(&collide_shader, "compute_impulses"),
            apply_impulses: pipeline(&collide_shader, "apply_impulses"),
        };

        // --- Bind groups ---
        let params_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("params_bg"),
            layout: &bgl_params,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &bufs.params,
                    offset: 0,
                    size: wgpu::BufferSize::new(std::mem::size_of::<GpuParams>() as u64),
                }),
            }],
        });
        let storage = [
            &bufs.particles,
            &bufs.properties,
            &bufs.keys,
            &bufs.scan_local,
            &bufs.group_sums,
            &bufs.counters,
            &bufs.nodes,
            &bufs.boxes,
            &bufs.visits,
            &bufs.candidates,
            &bufs.found,
            &bufs.impulses,
        ];
        let data_entries: Vec<wgpu::BindGroupEntry> = storage
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let data_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("data_bg"),
            layout: &bgl_data,
            entries: &data_entries,
        });

        let mut host = vec![Particle::inactive(); capacity];
        host[..particles.len()].copy_from_slice(particles);

        tracing::info!(
            capacity,
            candidate_capacity = config.candidate_capacity,
            world_extent = config.world_extent,
            "GPU collision kernel ready"
        );

        Ok(Self {
            device,
            queue,
            pipelines,
            params_bind_group,
            data_bind_group,
            bufs,
            host,
            candidates,
            extent: config.world_extent,
            active: 0,
            stats: StepStats::default(),
        })
    }

    /// Record one compute pass.
    fn dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::ComputePipeline,
        slot: u32,
        workgroups: u32,
    ) {
        if workgroups == 0 {
            return;
        }
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &self.params_bind_group, &[slot * PARAM_SLOT_SIZE as u32]);
        pass.set_bind_group(1, &self.data_bind_group, &[]);
        pass.dispatch_workgroups(workgroups, 1, 1);
    }

    /// Encode the whole pipeline for `n` active particles.
    fn encode_step(&self, encoder: &mut wgpu::CommandEncoder, n: u32) {
        let p = &self.pipelines;
        let cap = self.bufs.capacity;
        let wg_all = dispatch_size(cap, WORKGROUP_SIZE);
        let wg_padded = dispatch_size(self.bufs.padded, WORKGROUP_SIZE);
        let nodes = (2 * n).saturating_sub(1);

        // 1-2. Keys and the radix sort; slot `bit` carries bit and half.
        self.dispatch(encoder, &p.generate_keys, GENERIC_SLOT, wg_all);
        for bit in 0..KEY_BITS {
            self.dispatch(encoder, &p.extract_bits, bit, wg_padded);
            self.dispatch(encoder, &p.scan_blocks, bit, self.bufs.group_count);
            self.dispatch(encoder, &p.scan_group_sums, bit, 1);
            self.dispatch(encoder, &p.scatter_keys, bit, wg_all);
        }
        self.dispatch(encoder, &p.gather_particles, GENERIC_SLOT, wg_all);
        self.dispatch(encoder, &p.copy_back, GENERIC_SLOT, wg_all);

        // 3-4. Tree and boxes over the active prefix.
        self.dispatch(encoder, &p.init_nodes, GENERIC_SLOT, dispatch_size(nodes, WORKGROUP_SIZE));
        self.dispatch(
            encoder,
            &p.build_tree,
            GENERIC_SLOT,
            dispatch_size(n.saturating_sub(1), WORKGROUP_SIZE),
        );
        self.dispatch(encoder, &p.merge_boxes, GENERIC_SLOT, dispatch_size(n, WORKGROUP_SIZE));
        self.dispatch(encoder, &p.finalize_boxes, GENERIC_SLOT, dispatch_size(nodes, WORKGROUP_SIZE));

        // 5-6. Candidates for every slot, impulses for the active prefix.
        self.dispatch(encoder, &p.detect, GENERIC_SLOT, wg_all);
        self.dispatch(encoder, &p.compute_impulses, GENERIC_SLOT, dispatch_size(n, WORKGROUP_SIZE));
        self.dispatch(encoder, &p.apply_impulses, GENERIC_SLOT, dispatch_size(n, WORKGROUP_SIZE));
    }

    /// Read sort, tree and candidate state back from the device.
    pub fn read_snapshot(&mut self) -> Result<PipelineSnapshot, KernelError> {
        let cap = self.bufs.capacity as usize;
        let slots = cap * self.bufs.candidate_capacity as usize;
        let node_count = (2 * self.active as usize).saturating_sub(1);

        let sorted_keys: Vec<SortKey> = self.bufs.read(&self.device, &self.queue, &self.bufs.keys, cap)?;
        let nodes: Vec<BvhNode> = self.bufs.read(&self.device, &self.queue, &self.bufs.nodes, node_count)?;
        let raw_slots: Vec<u32> = self.bufs.read(&self.device, &self.queue, &self.bufs.candidates, slots)?;
        let found: Vec<u32> = self.bufs.read(&self.device, &self.queue, &self.bufs.found, cap)?;
        self.candidates.copy_from_raw(&raw_slots, &found);

        Ok(PipelineSnapshot {
            active: self.active as usize,
            sorted_keys,
            nodes,
            candidates: self.candidates.clone(),
        })
    }
}

impl CollisionKernel for GpuKernel {
    fn step(&mut self, active: &ActiveCounter) {
        // Inactive particles sort last, so the sorted active prefix is the
        // number of active records in the host mirror.
        let host_active = self.host.iter().filter(|p| p.is_active()).count() as u32;
        debug_assert_eq!(
            active.get(),
            host_active,
            "active counter disagrees with the particle buffer"
        );
        let n = active.get().min(host_active);

        self.bufs.upload_particles(&self.queue, &self.host);
        self.bufs
            .write_params(&self.queue, self.bufs.base_params(n, self.extent));

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("collision_step"),
        });
        self.encode_step(&mut encoder, n);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
        self.active = n;

        let cap = self.bufs.capacity as usize;
        let readback = self
            .bufs
            .read::<Particle>(&self.device, &self.queue, &self.bufs.particles, cap)
            .and_then(|particles| {
                let found: Vec<u32> =
                    self.bufs.read(&self.device, &self.queue, &self.bufs.found, cap)?;
                Ok((particles, found))
            });
        match readback {
            Ok((particles, found)) => {
                self.host.copy_from_slice(&particles);
                let cc = self.bufs.candidate_capacity as usize;
                let stats = found[..n as usize].iter().fold(
                    crate::detect::CandidateStats::default(),
                    |mut s, &f| {
                        s.found += f as u64;
                        s.stored += (f as usize).min(cc) as u64;
                        s.saturated += (f as usize > cc) as u32;
                        s
                    },
                );
                self.stats = StepStats {
                    active: n,
                    candidates: stats,
                };
            }
            Err(e) => tracing::error!("particle readback failed, keeping previous state: {e}"),
        }

        tracing::debug!(
            active = n,
            found = self.stats.candidates.found,
            saturated = self.stats.candidates.saturated,
            "gpu collision step"
        );
    }

    fn particles(&self) -> &[Particle] {
        &self.host
    }

    fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.host
    }

    fn capacity(&self) -> usize {
        self.bufs.capacity as usize
    }

    fn last_stats(&self) -> StepStats {
        self.stats
    }

    fn snapshot(&mut self) -> PipelineSnapshot {
        match self.read_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("snapshot readback failed: {e}");
                PipelineSnapshot {
                    active: 0,
                    sorted_keys: Vec::new(),
                    nodes: Vec::new(),
                    candidates: self.candidates.clone(),
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "gpu"
    }
}

// ---- Bind group layout entry helpers ----

fn bgl_uniform_dynamic(binding: u32, size: u64) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: true,
            min_binding_size: wgpu::BufferSize::new(size),
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
