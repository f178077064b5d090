//! wgpu host for the generated compute program
//!
//! Owns the particle, snapshot, scratch and grid buffers plus one buffer per
//! module binding, and encodes a step as the same phase sequence the CPU
//! pipeline runs. Particle identity stays on the host: the GPU only sees
//! records in slot order, and dead records are compacted after a readback.

use std::collections::HashMap;
use std::sync::mpsc;

use wgpu::util::DeviceExt;

use super::grid::GridConfig;
use super::layout::{BindingTable, bindings};
use super::program::{
    BUILD_GRID_ENTRY, CLEAR_GRID_ENTRY, GpuParticle, INTEGRATE_ENTRY, ProgramBuilder,
    ShaderProgram, SimUniforms,
};
use crate::module::{ModuleRegistry, Phase, UniformSink};
use crate::sim::particle::Particle;
use crate::sim::spatial::{BoundsTracker, Camera};
use crate::{KernelError, KernelSettings, Result};

const WORD: u64 = std::mem::size_of::<f32>() as u64;

/// Pushes registry writes straight into the module buffers
pub struct GpuUniformSink {
    queue: wgpu::Queue,
    /// Buffer and capacity in words, by binding
    buffers: HashMap<u32, (wgpu::Buffer, u64)>,
}

impl GpuUniformSink {
    fn write(&self, binding: u32, words: &[f32]) {
        let Some((buffer, capacity)) = self.buffers.get(&binding) else {
            log::warn!("No GPU buffer for binding {binding}");
            return;
        };
        let mut words = words;
        if words.len() as u64 > *capacity {
            log::warn!(
                "Binding {binding} holds {capacity} values, truncating write of {}",
                words.len()
            );
            words = &words[..*capacity as usize];
        }
        if !words.is_empty() {
            self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(words));
        }
    }
}

impl UniformSink for GpuUniformSink {
    fn write_uniform(&mut self, binding: u32, words: &[f32]) {
        self.write(binding, words);
    }

    fn write_array(&mut self, binding: u32, values: &[f32]) {
        self.write(binding, values);
    }

    fn array_capacity(&self, binding: u32) -> Option<usize> {
        self.buffers.get(&binding).map(|(_, capacity)| *capacity as usize)
    }
}

struct Pipelines {
    clear_grid: wgpu::ComputePipeline,
    build_grid: wgpu::ComputePipeline,
    integrate: wgpu::ComputePipeline,
    phases: Vec<(Phase, wgpu::ComputePipeline)>,
}

impl Pipelines {
    fn phase(&self, phase: Phase) -> Option<&wgpu::ComputePipeline> {
        self.phases.iter().find(|(p, _)| *p == phase).map(|(_, pipeline)| pipeline)
    }
}

struct PendingReadback {
    staging: wgpu::Buffer,
    count: u32,
    steps_at_request: u64,
    receiver: mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
}

/// Result of a completed readback
#[derive(Debug, Clone)]
pub struct GpuReadback {
    /// Live particles in slot order
    pub particles: Vec<Particle>,
    /// Records removed from the GPU buffers by compaction
    pub removed: usize,
    /// Grid insertions dropped by the last build
    pub dropped: u32,
}

pub struct GpuSimulation {
    device: wgpu::Device,
    queue: wgpu::Queue,
    program: ShaderProgram,
    pipelines: Pipelines,
    bind_group: wgpu::BindGroup,

    particles_buffer: wgpu::Buffer,
    prev_buffer: wgpu::Buffer,
    state_buffer: wgpu::Buffer,
    sim_buffer: wgpu::Buffer,
    grid_config_buffer: wgpu::Buffer,
    counts_buffer: wgpu::Buffer,

    capacity: u32,
    /// Host mirror carrying particle identity, in slot order
    host: Vec<Particle>,
    grid: BoundsTracker,
    max_per_cell: u32,
    constrain_iterations: u32,
    steps: u64,
    readback: Option<PendingReadback>,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_buffer(device: &wgpu::Device, label: &str, size: u64, extra: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(WORD),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | extra,
        mapped_at_creation: false,
    })
}

fn workgroups(threads: u32, size: u32) -> u32 {
    threads.div_ceil(size).max(1)
}

impl GpuSimulation {
    /// Build the program for `registry`, allocate every buffer and attach the
    /// registry's uniform sink so parameter writes reach the GPU.
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        registry: &mut ModuleRegistry,
        settings: &KernelSettings,
        camera: &Camera,
    ) -> Result<Self> {
        let program = ProgramBuilder::new(settings).build(registry)?;
        let capacity = settings.max_particles.max(1);
        let grid_cells = settings.gpu_grid_cells.max(1);
        let max_per_cell = settings.max_per_cell.max(1);
        let stride = program.state.stride() as u64;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("particle_program"),
            source: wgpu::ShaderSource::Wgsl(program.source.as_str().into()),
        });

        let particle_bytes = std::mem::size_of::<GpuParticle>() as u64 * capacity as u64;
        let copy_src = wgpu::BufferUsages::COPY_SRC;
        let particles_buffer = storage_buffer(&device, "particles", particle_bytes, copy_src);
        let prev_buffer = storage_buffer(&device, "particles_prev", particle_bytes, wgpu::BufferUsages::empty());
        let state_buffer = storage_buffer(&device, "sim_state", capacity as u64 * stride * WORD, copy_src);

        let max_cells = grid_cells as u64 * grid_cells as u64;
        // One trailing counter for dropped insertions
        let counts_buffer = storage_buffer(&device, "grid_counts", (max_cells + 1) * WORD, copy_src);
        let cells_buffer = storage_buffer(&device, "grid_cells", max_cells * max_per_cell as u64 * WORD, wgpu::BufferUsages::empty());

        let sim_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("sim_uniforms"),
            contents: bytemuck::bytes_of(&SimUniforms::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let grid = BoundsTracker::new(camera, settings.cell_size, settings.bounds_padding, grid_cells);
        let grid_bounds = *grid.bounds();
        let grid_config_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("grid_config"),
            contents: bytemuck::bytes_of(&GridConfig::new(&grid_bounds, max_per_cell)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let mut module_buffers = HashMap::new();
        for layout in &program.bindings.modules {
            let block = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("u_{}", layout.module)),
                size: layout.block_size(),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            module_buffers.insert(layout.binding, (block, layout.block_size() / WORD));
            for array in &layout.arrays {
                let label = format!("a_{}_{}", layout.module, array.name);
                let buffer = storage_buffer(&device, &label, capacity as u64 * WORD, wgpu::BufferUsages::empty());
                module_buffers.insert(array.binding, (buffer, capacity as u64));
            }
        }

        let layout_entries = Self::layout_entries(&program.bindings);
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("particle_bind_group_layout"),
            entries: &layout_entries,
        });

        let fixed = [
            (bindings::PARTICLES, &particles_buffer),
            (bindings::PARTICLES_PREV, &prev_buffer),
            (bindings::SIM_STATE, &state_buffer),
            (bindings::SIM_UNIFORMS, &sim_buffer),
            (bindings::GRID_CONFIG, &grid_config_buffer),
            (bindings::GRID_COUNTS, &counts_buffer),
            (bindings::GRID_CELLS, &cells_buffer),
        ];
        let mut group_entries: Vec<wgpu::BindGroupEntry> = fixed
            .iter()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        for entry in &layout_entries[fixed.len()..] {
            let (buffer, _) = module_buffers
                .get(&entry.binding)
                .ok_or_else(|| KernelError::Gpu(format!("binding {} has no buffer", entry.binding)))?;
            group_entries.push(wgpu::BindGroupEntry {
                binding: entry.binding,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("particle_bind_group"),
            layout: &bind_group_layout,
            entries: &group_entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("particle_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });
        let make = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let pipelines = Pipelines {
            clear_grid: make(CLEAR_GRID_ENTRY),
            build_grid: make(BUILD_GRID_ENTRY),
            integrate: make(INTEGRATE_ENTRY),
            phases: program
                .phase_entries
                .iter()
                .map(|(phase, entry)| (*phase, make(entry.as_str())))
                .collect(),
        };

        registry.attach_sink(Box::new(GpuUniformSink {
            queue: queue.clone(),
            buffers: module_buffers,
        }));

        log::info!(
            "GPU simulation ready: capacity {}, grid {}x{} (max {} per cell), {} bindings",
            capacity,
            grid_bounds.cols,
            grid_bounds.rows,
            max_per_cell,
            layout_entries.len()
        );

        Ok(Self {
            device,
            queue,
            program,
            pipelines,
            bind_group,
            particles_buffer,
            prev_buffer,
            state_buffer,
            sim_buffer,
            grid_config_buffer,
            counts_buffer,
            capacity,
            host: Vec::new(),
            grid,
            max_per_cell,
            constrain_iterations: settings.effective_constrain_iterations(),
            steps: 0,
            readback: None,
        })
    }

    fn layout_entries(table: &BindingTable) -> Vec<wgpu::BindGroupLayoutEntry> {
        let mut entries = vec![
            storage_entry(bindings::PARTICLES, false),
            storage_entry(bindings::PARTICLES_PREV, true),
            storage_entry(bindings::SIM_STATE, false),
            uniform_entry(bindings::SIM_UNIFORMS),
            uniform_entry(bindings::GRID_CONFIG),
            storage_entry(bindings::GRID_COUNTS, false),
            storage_entry(bindings::GRID_CELLS, false),
        ];
        for layout in &table.modules {
            entries.push(uniform_entry(layout.binding));
            entries.extend(layout.arrays.iter().map(|a| storage_entry(a.binding, true)));
        }
        entries
    }

    pub fn program(&self) -> &ShaderProgram {
        &self.program
    }

    pub fn particle_count(&self) -> u32 {
        self.host.len() as u32
    }

    pub fn set_constrain_iterations(&mut self, iterations: u32) {
        self.constrain_iterations = iterations.max(1);
    }

    /// Replace the GPU particle set. Scratch rows start zeroed.
    pub fn upload_particles(&mut self, particles: &[Particle]) {
        let count = particles.len().min(self.capacity as usize);
        if count < particles.len() {
            log::warn!(
                "Uploading {} particles into a buffer of {}, extra particles ignored",
                particles.len(),
                self.capacity
            );
        }
        self.host = particles[..count].to_vec();
        let records: Vec<GpuParticle> = self.host.iter().map(GpuParticle::from).collect();
        if !records.is_empty() {
            self.queue.write_buffer(&self.particles_buffer, 0, bytemuck::cast_slice(&records));
        }
        let zeroes = vec![0.0f32; count * self.program.state.stride() as usize];
        if !zeroes.is_empty() {
            self.queue.write_buffer(&self.state_buffer, 0, bytemuck::cast_slice(&zeroes));
        }
        // A pending readback refers to the old slot order
        self.readback = None;
    }

    fn track_camera(&mut self, camera: &Camera) {
        if !self.grid.track(camera) {
            return;
        }
        self.queue.write_buffer(
            &self.grid_config_buffer,
            0,
            bytemuck::bytes_of(&GridConfig::new(self.grid.bounds(), self.max_per_cell)),
        );
    }

    fn dispatch(&self, encoder: &mut wgpu::CommandEncoder, pipeline: &wgpu::ComputePipeline, label: &str, threads: u32) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.dispatch_workgroups(workgroups(threads, self.program.workgroup_size), 1, 1);
    }

    fn rebuild_grid(&self, encoder: &mut wgpu::CommandEncoder, count: u32) {
        let cells = self.grid.bounds().cell_count() as u32 + 1;
        self.dispatch(encoder, &self.pipelines.clear_grid, CLEAR_GRID_ENTRY, cells);
        self.dispatch(encoder, &self.pipelines.build_grid, BUILD_GRID_ENTRY, count);
    }

    fn snapshot(&self, encoder: &mut wgpu::CommandEncoder, count: u32) {
        let bytes = count as u64 * std::mem::size_of::<GpuParticle>() as u64;
        encoder.copy_buffer_to_buffer(&self.particles_buffer, 0, &self.prev_buffer, 0, bytes);
    }

    fn run_phase(&self, encoder: &mut wgpu::CommandEncoder, phase: Phase, count: u32) {
        if let Some(pipeline) = self.pipelines.phase(phase) {
            self.snapshot(encoder, count);
            self.dispatch(encoder, pipeline, phase.as_str(), count);
        }
    }

    /// Encode and submit one step
    pub fn step(&mut self, dt: f32, camera: &Camera) {
        let count = self.particle_count();
        if count == 0 {
            return;
        }
        self.track_camera(camera);
        self.queue.write_buffer(
            &self.sim_buffer,
            0,
            bytemuck::bytes_of(&SimUniforms {
                dt,
                particle_count: count,
                _pad: [0; 2],
            }),
        );

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("particle_step"),
        });
        self.rebuild_grid(&mut encoder, count);
        self.run_phase(&mut encoder, Phase::State, count);
        self.run_phase(&mut encoder, Phase::Apply, count);
        self.dispatch(&mut encoder, &self.pipelines.integrate, INTEGRATE_ENTRY, count);
        for _ in 0..self.constrain_iterations {
            self.rebuild_grid(&mut encoder, count);
            self.run_phase(&mut encoder, Phase::Constrain, count);
        }
        self.rebuild_grid(&mut encoder, count);
        self.run_phase(&mut encoder, Phase::Correct, count);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.steps += 1;
    }

    /// Start copying particles, scratch rows and the drop counter to the host
    pub fn request_readback(&mut self) {
        let count = self.particle_count();
        if count == 0 || self.readback.is_some() {
            return;
        }
        let particle_bytes = count as u64 * std::mem::size_of::<GpuParticle>() as u64;
        let state_bytes = count as u64 * self.program.state.stride() as u64 * WORD;
        let counter_offset = self.grid.bounds().cell_count() as u64 * WORD;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particle_readback"),
            size: particle_bytes + state_bytes + WORD,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("particle_readback"),
        });
        encoder.copy_buffer_to_buffer(&self.particles_buffer, 0, &staging, 0, particle_bytes);
        if state_bytes > 0 {
            encoder.copy_buffer_to_buffer(&self.state_buffer, 0, &staging, particle_bytes, state_bytes);
        }
        encoder.copy_buffer_to_buffer(
            &self.counts_buffer,
            counter_offset,
            &staging,
            particle_bytes + state_bytes,
            WORD,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.readback = Some(PendingReadback {
            staging,
            count,
            steps_at_request: self.steps,
            receiver,
        });
    }

    /// Finish a pending readback without blocking.
    ///
    /// Dead records are compacted out of the GPU buffers only when no step was
    /// submitted since the request; otherwise the compaction waits for the
    /// next readback.
    pub fn poll_readback(&mut self) -> Option<Result<GpuReadback>> {
        let pending = self.readback.as_ref()?;
        let _ = self.device.poll(wgpu::PollType::Poll);
        let outcome = match pending.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(mpsc::TryRecvError::Empty) => return None,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.readback = None;
                return Some(Err(KernelError::Gpu("readback channel closed".to_string())));
            }
        };
        let pending = self.readback.take()?;
        if let Err(e) = outcome {
            return Some(Err(KernelError::Gpu(format!("readback failed: {e}"))));
        }
        Some(Ok(self.finish_readback(pending)))
    }

    /// Block until a readback completes
    pub fn read_particles(&mut self) -> Result<GpuReadback> {
        self.request_readback();
        if self.readback.is_none() {
            return Ok(GpuReadback {
                particles: Vec::new(),
                removed: 0,
                dropped: 0,
            });
        }
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        match self.poll_readback() {
            Some(result) => result,
            None => Err(KernelError::Gpu("readback did not complete".to_string())),
        }
    }

    fn finish_readback(&mut self, pending: PendingReadback) -> GpuReadback {
        let count = pending.count as usize;
        let stride = self.program.state.stride() as usize;
        let particle_bytes = count * std::mem::size_of::<GpuParticle>();
        let state_bytes = count * stride * WORD as usize;

        let (records, state, dropped) = {
            let view = pending.staging.slice(..).get_mapped_range();
            let records: Vec<GpuParticle> = bytemuck::pod_collect_to_vec(&view[..particle_bytes]);
            let state: Vec<f32> = bytemuck::pod_collect_to_vec(&view[particle_bytes..particle_bytes + state_bytes]);
            let dropped: u32 = bytemuck::pod_read_unaligned(&view[particle_bytes + state_bytes..]);
            (records, state, dropped)
        };
        pending.staging.unmap();

        let mut particles = self.host.clone();
        for (particle, record) in particles.iter_mut().zip(&records) {
            record.apply_to(particle);
        }
        if dropped > 0 {
            log::warn!("GPU grid dropped {dropped} insertions (cell capacity {})", self.max_per_cell);
        }

        let keep: Vec<bool> = particles.iter().map(|p| p.is_alive()).collect();
        let removed = keep.iter().filter(|k| !**k).count();
        let live: Vec<Particle> = particles.iter().filter(|p| p.is_alive()).copied().collect();
        let current = pending.steps_at_request == self.steps;
        if current {
            self.host = particles;
        }
        if removed > 0 && current {
            self.host.retain(|p| p.is_alive());
            let records: Vec<GpuParticle> = self.host.iter().map(GpuParticle::from).collect();
            let rows: Vec<f32> = state
                .chunks(stride)
                .zip(&keep)
                .filter(|(_, k)| **k)
                .flat_map(|(row, _)| row.iter().copied())
                .collect();
            if !records.is_empty() {
                self.queue.write_buffer(&self.particles_buffer, 0, bytemuck::cast_slice(&records));
            }
            if !rows.is_empty() {
                self.queue.write_buffer(&self.state_buffer, 0, bytemuck::cast_slice(&rows));
            }
            log::debug!("Compacted {removed} dead particles, {} live", self.host.len());
        } else if removed > 0 {
            log::debug!("Steps submitted since readback, deferring compaction of {removed} particles");
        }

        GpuReadback {
            particles: live,
            removed: if current { removed } else { 0 },
            dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroup_count_rounds_up() {
        assert_eq!(workgroups(1, 64), 1);
        assert_eq!(workgroups(64, 64), 1);
        assert_eq!(workgroups(65, 64), 2);
        assert_eq!(workgroups(0, 64), 1);
    }

    #[test]
    fn test_layout_entries_cover_every_binding() {
        let registry = ModuleRegistry::with_modules(crate::modules::default_modules()).unwrap();
        let entries = GpuSimulation::layout_entries(registry.binding_table());
        let mut seen: Vec<u32> = entries.iter().map(|e| e.binding).collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..registry.binding_table().binding_count()).collect();
        assert_eq!(seen, expected);
    }
}
