//! Compute backends for the field stencils and the particle push.
//!
//! A backend owns its own copy of the field arrays. [`crate::DeviceMirror`]
//! tracks which copy is current and moves data between them.

use std::ops::Range;

use rayon::prelude::*;

use crate::error::Result;
use crate::field::{FieldArrays, NodeRange};
use crate::field_solver::{FieldCoefficients, Stencil, evaluate_trace};
use crate::pusher::{FieldPatch, push_packed};

/// Particle state in the layout the push kernels consume. Positions are
/// relative to the local grid origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedParticle {
    pub position: [f64; 3],
    pub momentum: [f64; 3],
    pub q_m: f64,
}

/// Contiguous run of a batch belonging to one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSegment {
    /// Linear local cell index.
    pub cell: usize,
    pub range: Range<usize>,
}

/// All particles of a partition packed cell by cell.
#[derive(Debug, Clone, Default)]
pub struct ParticleBatch {
    pub particles: Vec<PackedParticle>,
    pub segments: Vec<BatchSegment>,
}

impl ParticleBatch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            particles: Vec::with_capacity(n),
            segments: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
}

/// Constants of one push.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushParams {
    pub tau: f64,
    pub h: [f64; 3],
    /// Local cell counts.
    pub cells: [usize; 3],
}

impl PushParams {
    pub fn cell_coords(&self, cell: usize) -> [usize; 3] {
        let [nx, ny, _] = self.cells;
        [cell % nx, (cell / nx) % ny, cell / (nx * ny)]
    }
}

/// Executes the field stencils and the particle push on some device.
pub trait ComputeBackend: Send {
    fn name(&self) -> &str;

    /// Replace the backend's field copy with `fields`.
    fn upload_fields(&mut self, fields: &FieldArrays) -> Result<()>;

    /// Copy the backend's field state into `fields`.
    fn download_fields(&mut self, fields: &mut FieldArrays) -> Result<()>;

    /// `H -= fraction * tau * curl E` over `range`.
    fn advance_magnetic(&mut self, coeffs: &FieldCoefficients, fraction: f64, range: NodeRange) -> Result<()>;

    /// `E += tau * (curl H - J)` over `range`.
    fn advance_electric(&mut self, coeffs: &FieldCoefficients, range: NodeRange) -> Result<()>;

    /// Advance every particle of `batch` by one step using the backend's fields.
    fn push_particles(&mut self, batch: &mut ParticleBatch, params: &PushParams) -> Result<()>;

    /// Free device resources.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Multithreaded host backend in double precision.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    fields: FieldArrays,
}

impl CpuBackend {
    pub fn new(n: [usize; 3]) -> Self {
        Self {
            fields: FieldArrays::zeros(n),
        }
    }

    pub fn fields(&self) -> &FieldArrays {
        &self.fields
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn upload_fields(&mut self, fields: &FieldArrays) -> Result<()> {
        self.fields.clone_from(fields);
        Ok(())
    }

    fn download_fields(&mut self, fields: &mut FieldArrays) -> Result<()> {
        fields.clone_from(&self.fields);
        Ok(())
    }

    fn advance_magnetic(&mut self, coeffs: &FieldCoefficients, fraction: f64, range: NodeRange) -> Result<()> {
        evaluate_trace(&mut self.fields, Stencil::Magnetic { fraction }, coeffs, range);
        Ok(())
    }

    fn advance_electric(&mut self, coeffs: &FieldCoefficients, range: NodeRange) -> Result<()> {
        evaluate_trace(&mut self.fields, Stencil::Electric, coeffs, range);
        Ok(())
    }

    fn push_particles(&mut self, batch: &mut ParticleBatch, params: &PushParams) -> Result<()> {
        let fields = &self.fields;

        // Split the batch into disjoint per-cell slices
        let mut work = Vec::with_capacity(batch.segments.len());
        let mut rest = batch.particles.as_mut_slice();
        let mut consumed = 0;
        for segment in &batch.segments {
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(segment.range.start - consumed);
            let (chunk, tail) = tail.split_at_mut(segment.range.len());
            work.push((segment.cell, chunk));
            rest = tail;
            consumed = segment.range.end;
        }

        work.into_par_iter().for_each(|(cell, chunk)| {
            let patch = FieldPatch::gather(fields, params.cell_coords(cell));
            for p in chunk.iter_mut() {
                push_packed(p, fields, Some(&patch), params);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldComponent;

    #[test]
    fn test_cell_coords() {
        let params = PushParams {
            tau: 0.1,
            h: [1.0; 3],
            cells: [4, 3, 2],
        };
        assert_eq!(params.cell_coords(0), [0, 0, 0]);
        assert_eq!(params.cell_coords(5), [1, 1, 0]);
        assert_eq!(params.cell_coords(23), [3, 2, 1]);
    }

    #[test]
    fn test_cpu_push_uses_uploaded_fields() {
        let n = [2, 2, 2];
        let mut fields = FieldArrays::zeros(n);
        fields.get_mut(FieldComponent::Ez).as_mut_slice().fill(1.0);
        let mut backend = CpuBackend::new(n);
        backend.upload_fields(&fields).unwrap();

        let particle = PackedParticle {
            position: [0.5, 0.5, 0.5],
            momentum: [0.0; 3],
            q_m: 1.0,
        };
        let mut batch = ParticleBatch {
            particles: vec![particle; 3],
            segments: vec![
                BatchSegment { cell: 0, range: 0..2 },
                BatchSegment { cell: 7, range: 2..3 },
            ],
        };
        batch.particles[2].position = [1.5, 1.5, 1.5];
        let params = PushParams {
            tau: 0.1,
            h: [1.0; 3],
            cells: n,
        };
        backend.push_particles(&mut batch, &params).unwrap();
        for p in &batch.particles {
            assert!((p.momentum[2] - 0.1).abs() < 1e-14);
            assert_eq!(p.momentum[0], 0.0);
        }
        assert!(batch.particles[2].position[2] > 1.5);
    }

    #[test]
    fn test_download_roundtrip() {
        let n = [2, 3, 2];
        let mut fields = FieldArrays::zeros(n);
        fields.get_mut(FieldComponent::Rho).set(1, 2, 0, 4.0);
        let mut backend = CpuBackend::new(n);
        backend.upload_fields(&fields).unwrap();
        let mut out = FieldArrays::zeros(n);
        backend.download_fields(&mut out).unwrap();
        assert_eq!(out, fields);
        assert_eq!(backend.name(), "cpu");
    }
}
