//! GPU buffer management for the field arrays and particle batches.
//!
//! All ten field arrays live in one storage buffer, ghost layers included,
//! in [`FieldComponent::ALL`] order. Values are stored in single precision.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use phyz_pic::{FieldArrays, FieldComponent, PicError, Result};

/// Particle as seen by the push kernel. `momentum[3]` holds q/m.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct GpuParticle {
    pub position: [f32; 4],
    pub momentum: [f32; 4],
}

/// Position and momentum increments written by the push kernel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct PushDelta {
    pub dx: [f32; 4],
    pub du: [f32; 4],
}

/// GPU-resident field arrays and particle scratch space of one partition.
pub struct GpuState {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub n: [usize; 3],
    pub padded: [usize; 3],
    /// Samples per array, ghosts included.
    pub array_len: usize,

    pub field_buffer: wgpu::Buffer,
    pub field_staging: wgpu::Buffer,

    // Grown on demand by `reserve_particles`
    pub particle_capacity: usize,
    pub particle_buffer: wgpu::Buffer,
    pub delta_buffer: wgpu::Buffer,
    pub delta_staging: wgpu::Buffer,
}

fn storage_buffer(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

fn staging_buffer(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn particle_buffers(device: &wgpu::Device, capacity: usize) -> (wgpu::Buffer, wgpu::Buffer, wgpu::Buffer) {
    let particles = (capacity * std::mem::size_of::<GpuParticle>()) as u64;
    let deltas = (capacity * std::mem::size_of::<PushDelta>()) as u64;
    (
        storage_buffer(device, "particle_buffer", particles),
        storage_buffer(device, "delta_buffer", deltas),
        staging_buffer(device, "delta_staging", deltas),
    )
}

impl GpuState {
    /// Minimum particle capacity allocated up front.
    pub const MIN_PARTICLES: usize = 1024;

    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, n: [usize; 3]) -> Result<Self> {
        let g = phyz_pic::GHOST;
        let padded = [n[0] + 2 * g, n[1] + 2 * g, n[2] + 2 * g];
        let array_len = padded[0] * padded[1] * padded[2];
        let field_bytes = (FieldComponent::ALL.len() * array_len * std::mem::size_of::<f32>()) as u64;

        let limit = u64::from(device.limits().max_storage_buffer_binding_size);
        if field_bytes > limit {
            return Err(PicError::Device(format!(
                "field arrays need {field_bytes} bytes, device binding limit is {limit}"
            )));
        }

        let field_buffer = storage_buffer(&device, "field_buffer", field_bytes);
        let field_staging = staging_buffer(&device, "field_staging", field_bytes);
        let (particle_buffer, delta_buffer, delta_staging) = particle_buffers(&device, Self::MIN_PARTICLES);

        Ok(Self {
            device,
            queue,
            n,
            padded,
            array_len,
            field_buffer,
            field_staging,
            particle_capacity: Self::MIN_PARTICLES,
            particle_buffer,
            delta_buffer,
            delta_staging,
        })
    }

    /// Make room for `count` particles. Returns whether the particle
    /// buffers were reallocated, in which case bind groups referencing
    /// them must be rebuilt.
    pub fn reserve_particles(&mut self, count: usize) -> bool {
        if count <= self.particle_capacity {
            return false;
        }
        let capacity = count.next_power_of_two();
        let (particles, deltas, staging) = particle_buffers(&self.device, capacity);
        self.particle_buffer = particles;
        self.delta_buffer = deltas;
        self.delta_staging = staging;
        self.particle_capacity = capacity;
        true
    }

    /// Upload every field array from the host.
    pub fn upload_fields(&self, fields: &FieldArrays) -> Result<()> {
        if fields.dims() != self.n {
            return Err(PicError::ShapeMismatch(format!(
                "host fields {:?}, device fields {:?}",
                fields.dims(),
                self.n
            )));
        }
        let mut data = Vec::with_capacity(FieldComponent::ALL.len() * self.array_len);
        for (_, array) in fields.iter() {
            data.extend(array.as_slice().iter().map(|&v| v as f32));
        }
        self.queue.write_buffer(&self.field_buffer, 0, bytemuck::cast_slice(&data));
        Ok(())
    }

    /// Read every field array back into `fields`.
    pub fn download_fields(&self, fields: &mut FieldArrays) -> Result<()> {
        if fields.dims() != self.n {
            return Err(PicError::ShapeMismatch(format!(
                "host fields {:?}, device fields {:?}",
                fields.dims(),
                self.n
            )));
        }
        let data: Vec<f32> = pollster::block_on(self.read_back(&self.field_buffer, &self.field_staging, None))?;
        for (component, chunk) in FieldComponent::ALL.into_iter().zip(data.chunks_exact(self.array_len)) {
            let target = fields.get_mut(component).as_mut_slice();
            for (dst, &src) in target.iter_mut().zip(chunk) {
                *dst = f64::from(src);
            }
        }
        Ok(())
    }

    /// Upload a packed particle batch.
    pub fn upload_particles(&self, particles: &[GpuParticle]) {
        self.queue
            .write_buffer(&self.particle_buffer, 0, bytemuck::cast_slice(particles));
    }

    /// Read back the increments of the first `count` particles.
    pub fn download_deltas(&self, count: usize) -> Result<Vec<PushDelta>> {
        let bytes = (count * std::mem::size_of::<PushDelta>()) as u64;
        pollster::block_on(self.read_back(&self.delta_buffer, &self.delta_staging, Some(bytes)))
    }

    /// Copy `size` bytes (all of `src` when `None`) through `staging` and
    /// map them on the host.
    async fn read_back<T: Pod>(
        &self,
        src: &wgpu::Buffer,
        staging: &wgpu::Buffer,
        size: Option<u64>,
    ) -> Result<Vec<T>> {
        let size = size.unwrap_or(src.size());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download_encoder"),
            });
        encoder.copy_buffer_to_buffer(src, 0, staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..size);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.receive()
            .await
            .ok_or_else(|| PicError::Device("buffer mapping was cancelled".into()))?
            .map_err(|e| PicError::Device(format!("GPU buffer mapping failed: {e:?}")))?;

        let mapped = slice.get_mapped_range();
        let values: Vec<T> = bytemuck::cast_slice(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        Ok(values)
    }
}
