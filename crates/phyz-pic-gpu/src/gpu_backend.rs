//! [`ComputeBackend`] running the field stencils and the push on a GPU.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use phyz_pic::{
    ComputeBackend, FieldArrays, FieldCoefficients, NodeRange, ParticleBatch, PicError, PushParams, Result,
};
use tracing::{debug, info};

use crate::gpu_state::{GpuParticle, GpuState};
use crate::shaders::{Kernel, dispatch_size, kernel_source};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Layout {
    padded: [u32; 4],
    ghost: i32,
    count: u32,
    _padding: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct StencilParams {
    layout: Layout,
    start: [i32; 4],
    extent: [u32; 4],
    inv_h: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GpuPushParams {
    layout: Layout,
    inv_h: [f32; 4],
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

/// Compute pipeline with its uniform buffer and bind group.
struct KernelPipeline {
    kernel: Kernel,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl KernelPipeline {
    fn new(
        device: &wgpu::Device,
        kernel: Kernel,
        entries: &[wgpu::BindGroupLayoutEntry],
        params_size: usize,
        buffers: &[&wgpu::Buffer],
    ) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.label()),
            source: wgpu::ShaderSource::Wgsl(kernel_source(kernel).into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kernel.label()),
            entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.label()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.label()),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernel_params"),
            size: params_size as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = Self::bind(device, kernel, &layout, &params, buffers);
        Self {
            kernel,
            pipeline,
            layout,
            params,
            bind_group,
        }
    }

    fn bind(
        device: &wgpu::Device,
        kernel: Kernel,
        layout: &wgpu::BindGroupLayout,
        params: &wgpu::Buffer,
        buffers: &[&wgpu::Buffer],
    ) -> wgpu::BindGroup {
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        entries.extend(buffers.iter().enumerate().map(|(i, b)| wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: b.as_entire_binding(),
        }));
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label()),
            layout,
            entries: &entries,
        })
    }

    fn rebind(&mut self, device: &wgpu::Device, buffers: &[&wgpu::Buffer]) {
        self.bind_group = Self::bind(device, self.kernel, &self.layout, &self.params, buffers);
    }

    fn dispatch(&self, device: &wgpu::Device, queue: &wgpu::Queue, threads: usize) {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(self.kernel.label()),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.kernel.label()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            let (x, y) = dispatch_size(threads);
            pass.dispatch_workgroups(x, y, 1);
        }
        queue.submit(Some(encoder.finish()));
    }
}

/// Single-precision GPU backend.
///
/// Field values round to `f32` on upload. Particle state stays on the
/// host in double precision and receives the kernel's increments.
pub struct GpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_name: String,
    state: GpuState,
    magnetic: KernelPipeline,
    electric: KernelPipeline,
    push: KernelPipeline,
    scratch: Vec<GpuParticle>,
}

impl GpuBackend {
    /// Open the default high-performance adapter and allocate fields for
    /// an `n` cell partition.
    pub fn new(n: [usize; 3]) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| PicError::Device("no GPU adapter found".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("phyz-pic-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| PicError::Device(format!("failed to create device: {e}")))?;

        let name = adapter.get_info().name;
        Self::with_device(Arc::new(device), Arc::new(queue), name, n)
    }

    /// Build on an existing device, e.g. one shared by several partitions.
    pub fn with_device(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        adapter_name: String,
        n: [usize; 3],
    ) -> Result<Self> {
        let state = GpuState::new(device.clone(), queue.clone(), n)?;

        let field_entries = [uniform_entry(0), storage_entry(1, false)];
        let stencil_size = std::mem::size_of::<StencilParams>();
        let magnetic = KernelPipeline::new(
            &device,
            Kernel::Magnetic,
            &field_entries,
            stencil_size,
            &[&state.field_buffer],
        );
        let electric = KernelPipeline::new(
            &device,
            Kernel::Electric,
            &field_entries,
            stencil_size,
            &[&state.field_buffer],
        );
        let push = KernelPipeline::new(
            &device,
            Kernel::Push,
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
            std::mem::size_of::<GpuPushParams>(),
            &[&state.field_buffer, &state.particle_buffer, &state.delta_buffer],
        );

        info!(adapter = %adapter_name, cells = ?n, "GPU backend ready");
        Ok(Self {
            device,
            queue,
            adapter_name,
            state,
            magnetic,
            electric,
            push,
            scratch: Vec::new(),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn layout(&self, count: usize) -> Layout {
        let p = self.state.padded;
        Layout {
            padded: [p[0] as u32, p[1] as u32, p[2] as u32, self.state.array_len as u32],
            ghost: phyz_pic::GHOST as i32,
            count: count as u32,
            _padding: [0; 2],
        }
    }

    fn run_stencil(&self, kernel: &KernelPipeline, coeffs: &FieldCoefficients, coef: f64, range: NodeRange) {
        if range.is_empty() {
            return;
        }
        let ih = coeffs.inv_h;
        let params = StencilParams {
            layout: self.layout(range.len()),
            start: [range.start[0] as i32, range.start[1] as i32, range.start[2] as i32, 0],
            extent: [range.extent[0] as u32, range.extent[1] as u32, range.extent[2] as u32, 0],
            inv_h: [ih[0] as f32, ih[1] as f32, ih[2] as f32, coef as f32],
        };
        self.queue.write_buffer(&kernel.params, 0, bytemuck::bytes_of(&params));
        kernel.dispatch(&self.device, &self.queue, range.len());
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &str {
        "gpu"
    }

    fn upload_fields(&mut self, fields: &FieldArrays) -> Result<()> {
        self.state.upload_fields(fields)
    }

    fn download_fields(&mut self, fields: &mut FieldArrays) -> Result<()> {
        self.state.download_fields(fields)
    }

    fn advance_magnetic(&mut self, coeffs: &FieldCoefficients, fraction: f64, range: NodeRange) -> Result<()> {
        self.run_stencil(&self.magnetic, coeffs, fraction * coeffs.tau, range);
        Ok(())
    }

    fn advance_electric(&mut self, coeffs: &FieldCoefficients, range: NodeRange) -> Result<()> {
        self.run_stencil(&self.electric, coeffs, coeffs.tau, range);
        Ok(())
    }

    fn push_particles(&mut self, batch: &mut ParticleBatch, params: &PushParams) -> Result<()> {
        let count = batch.len();
        if count == 0 {
            return Ok(());
        }
        if self.state.reserve_particles(count) {
            debug!(capacity = self.state.particle_capacity, "particle buffers grown");
            self.push.rebind(
                &self.device,
                &[&self.state.field_buffer, &self.state.particle_buffer, &self.state.delta_buffer],
            );
        }

        self.scratch.clear();
        self.scratch.extend(batch.particles.iter().map(|p| GpuParticle {
            position: [p.position[0] as f32, p.position[1] as f32, p.position[2] as f32, 0.0],
            momentum: [p.momentum[0] as f32, p.momentum[1] as f32, p.momentum[2] as f32, p.q_m as f32],
        }));
        self.state.upload_particles(&self.scratch);

        let uniforms = GpuPushParams {
            layout: self.layout(count),
            inv_h: [
                (1.0 / params.h[0]) as f32,
                (1.0 / params.h[1]) as f32,
                (1.0 / params.h[2]) as f32,
                params.tau as f32,
            ],
        };
        self.queue.write_buffer(&self.push.params, 0, bytemuck::bytes_of(&uniforms));
        self.push.dispatch(&self.device, &self.queue, count);

        let deltas = self.state.download_deltas(count)?;
        for (p, d) in batch.particles.iter_mut().zip(&deltas) {
            for axis in 0..3 {
                p.position[axis] += f64::from(d.dx[axis]);
                p.momentum[axis] += f64::from(d.du[axis]);
            }
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.state.field_buffer.destroy();
        self.state.field_staging.destroy();
        self.state.particle_buffer.destroy();
        self.state.delta_buffer.destroy();
        self.state.delta_staging.destroy();
        debug!(adapter = %self.adapter_name, "GPU buffers released");
        Ok(())
    }
}
