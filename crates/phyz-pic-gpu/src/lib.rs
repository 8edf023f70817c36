//! GPU backend for the PIC kernel using wgpu compute shaders.
//!
//! [`GpuBackend`] implements [`phyz_pic::ComputeBackend`] in single
//! precision: the Yee stencils update a device copy of the field arrays in
//! place, and the Boris push returns per-particle increments that the host
//! applies to its double-precision particle state.

pub mod gpu_backend;
pub mod gpu_state;
pub mod shaders;

pub use gpu_backend::GpuBackend;
pub use gpu_state::GpuState;
