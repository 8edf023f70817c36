//! Relativistic Boris push with cloud-in-cell field interpolation.

use phyz_math::{Vec3, cic_stencil, corner_weight, from_array, to_array};

use crate::backend::{BatchSegment, ComputeBackend, PackedParticle, ParticleBatch, PushParams};
use crate::cell::CellGrid;
use crate::domain::{GridGeometry, SimulationDomain};
use crate::error::{PicError, Result};
use crate::field::{FieldArrays, FieldComponent};
use crate::mirror::DeviceMirror;
use crate::particle::lorentz_factor;

/// Components sampled by the push, E then H.
const PUSH_COMPONENTS: [FieldComponent; 6] = [
    FieldComponent::Ex,
    FieldComponent::Ey,
    FieldComponent::Ez,
    FieldComponent::Hx,
    FieldComponent::Hy,
    FieldComponent::Hz,
];

/// E and H samples of one cell and its immediate neighbours (base
/// offsets -1..=1), gathered once before the cell's particles are pushed.
#[derive(Debug, Clone)]
pub struct FieldPatch {
    origin: [isize; 3],
    values: [[f64; 27]; 6],
}

impl FieldPatch {
    pub fn gather(fields: &FieldArrays, cell: [usize; 3]) -> Self {
        let origin = [cell[0] as isize - 1, cell[1] as isize - 1, cell[2] as isize - 1];
        let mut values = [[0.0; 27]; 6];
        for (slot, &component) in PUSH_COMPONENTS.iter().enumerate() {
            let array = fields.get(component);
            for dz in 0..3 {
                for dy in 0..3 {
                    for dx in 0..3 {
                        values[slot][(dx + 3 * (dy + 3 * dz)) as usize] =
                            array.get(origin[0] + dx, origin[1] + dy, origin[2] + dz);
                    }
                }
            }
        }
        Self { origin, values }
    }

    /// Sample from the patch, falling back to the full array for nodes the
    /// patch does not cover.
    #[inline]
    fn sample(&self, fields: &FieldArrays, slot: usize, node: [isize; 3]) -> f64 {
        let l = [
            node[0] - self.origin[0],
            node[1] - self.origin[1],
            node[2] - self.origin[2],
        ];
        if l.iter().all(|&x| (0..3).contains(&x)) {
            self.values[slot][(l[0] + 3 * (l[1] + 3 * l[2])) as usize]
        } else {
            fields.get(PUSH_COMPONENTS[slot]).get(node[0], node[1], node[2])
        }
    }
}

/// Trilinear interpolation at `s` of samples staggered by `stagger`.
#[inline]
fn trilinear(stagger: [f64; 3], s: [f64; 3], sample: impl Fn([isize; 3]) -> f64) -> f64 {
    let st = [
        cic_stencil(s[0], stagger[0]),
        cic_stencil(s[1], stagger[1]),
        cic_stencil(s[2], stagger[2]),
    ];
    let mut value = 0.0;
    for c in 0..2 {
        for b in 0..2 {
            for a in 0..2 {
                let node = [
                    st[0].base + a as isize,
                    st[1].base + b as isize,
                    st[2].base + c as isize,
                ];
                value += corner_weight(&st[0], &st[1], &st[2], a, b, c) * sample(node);
            }
        }
    }
    value
}

fn interpolate_slot(fields: &FieldArrays, patch: Option<&FieldPatch>, slot: usize, s: [f64; 3]) -> f64 {
    let component = PUSH_COMPONENTS[slot];
    match patch {
        Some(p) => trilinear(component.stagger(), s, |node| p.sample(fields, slot, node)),
        None => interpolate(fields, component, s),
    }
}

/// Interpolate one component at local coordinate `s` (in cells).
pub fn interpolate(fields: &FieldArrays, component: FieldComponent, s: [f64; 3]) -> f64 {
    let array = fields.get(component);
    trilinear(component.stagger(), s, |[i, j, k]| array.get(i, j, k))
}

/// E and B (= H) at local coordinate `s`.
pub fn fields_at(fields: &FieldArrays, patch: Option<&FieldPatch>, s: [f64; 3]) -> (Vec3, Vec3) {
    let e = Vec3::new(
        interpolate_slot(fields, patch, 0, s),
        interpolate_slot(fields, patch, 1, s),
        interpolate_slot(fields, patch, 2, s),
    );
    let b = Vec3::new(
        interpolate_slot(fields, patch, 3, s),
        interpolate_slot(fields, patch, 4, s),
        interpolate_slot(fields, patch, 5, s),
    );
    (e, b)
}

/// One relativistic Boris step of momentum per unit mass `u`.
///
/// Half electric kick, rotation about B with `t = (q/m)(tau/2) B / gamma`,
/// second half kick.
pub fn boris_push(u: Vec3, e: Vec3, b: Vec3, q_m: f64, tau: f64) -> Vec3 {
    let half = 0.5 * q_m * tau;
    let u_minus = u + e * half;
    let gamma = lorentz_factor(&u_minus);
    let t = b * (half / gamma);
    let u_prime = u_minus + u_minus.cross(&t);
    let s = t * (2.0 / (1.0 + t.norm_squared()));
    let u_plus = u_minus + u_prime.cross(&s);
    u_plus + e * half
}

/// Push one packed particle in place. Positions are relative to the local
/// grid origin.
#[inline]
pub fn push_packed(p: &mut PackedParticle, fields: &FieldArrays, patch: Option<&FieldPatch>, params: &PushParams) {
    let s = [
        p.position[0] / params.h[0],
        p.position[1] / params.h[1],
        p.position[2] / params.h[2],
    ];
    let (e, b) = fields_at(fields, patch, s);
    let u_new = boris_push(from_array(p.momentum), e, b, p.q_m, params.tau);
    let dx = u_new * (params.tau / lorentz_factor(&u_new));
    p.momentum = to_array(&u_new);
    p.position = [p.position[0] + dx.x, p.position[1] + dx.y, p.position[2] + dx.z];
}

/// Moves particles between cell storage and a packed batch and runs the
/// selected backend over it.
#[derive(Debug, Clone)]
pub struct ParticlePusher {
    params: PushParams,
}

impl ParticlePusher {
    pub fn new(geometry: &GridGeometry, tau: f64) -> Self {
        Self {
            params: PushParams {
                tau,
                h: geometry.h,
                cells: geometry.n,
            },
        }
    }

    pub fn params(&self) -> &PushParams {
        &self.params
    }

    /// Pack every particle, cell by cell and species by species.
    pub fn pack(&self, grid: &CellGrid, domain: &SimulationDomain, geometry: &GridGeometry) -> Result<ParticleBatch> {
        let mut batch = ParticleBatch::with_capacity(grid.particle_count() as usize);
        for (idx, cell) in grid.cells().iter().enumerate() {
            let start = batch.particles.len();
            for (id, list) in cell.species_lists() {
                let q_m = domain
                    .species(id)
                    .map(|s| s.q_m())
                    .ok_or_else(|| PicError::InvalidConfig(format!("unknown species {id}")))?;
                for p in list {
                    batch.particles.push(PackedParticle {
                        position: to_array(&(p.position - geometry.origin)),
                        momentum: to_array(&p.momentum),
                        q_m,
                    });
                }
            }
            let end = batch.particles.len();
            if end > start {
                batch.segments.push(BatchSegment {
                    cell: idx,
                    range: start..end,
                });
            }
        }
        Ok(batch)
    }

    /// Write a pushed batch back in the order [`ParticlePusher::pack`] produced it.
    pub fn unpack(&self, batch: &ParticleBatch, grid: &mut CellGrid, geometry: &GridGeometry) -> Result<()> {
        let mut packed = batch.particles.iter();
        for cell in grid.cells_mut() {
            for (_, list) in cell.species_lists_mut() {
                for p in list.iter_mut() {
                    let q = packed.next().ok_or_else(|| {
                        PicError::Device("pushed batch is shorter than the particle set".into())
                    })?;
                    p.position = geometry.origin + from_array(q.position);
                    p.momentum = from_array(q.momentum);
                }
            }
        }
        if packed.next().is_some() {
            return Err(PicError::Device("pushed batch is longer than the particle set".into()));
        }
        Ok(())
    }

    /// Push every particle of the partition through the mirror's backend.
    /// The device fields must be current.
    pub fn push<B: ComputeBackend>(
        &self,
        mirror: &mut DeviceMirror<B>,
        grid: &mut CellGrid,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
    ) -> Result<usize> {
        let mut batch = self.pack(grid, domain, geometry)?;
        mirror.push_particles(&mut batch, &self.params)?;
        self.unpack(&batch, grid, geometry)?;
        Ok(batch.particles.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_no_field_keeps_momentum() {
        let u = Vec3::new(0.1, -0.2, 0.3);
        let u_new = boris_push(u, Vec3::zeros(), Vec3::zeros(), -1.0, 0.1);
        assert_eq!(u_new, u);
    }

    #[test]
    fn test_electric_kick() {
        let u_new = boris_push(Vec3::zeros(), Vec3::new(1.0, 0.0, 0.0), Vec3::zeros(), 2.0, 0.1);
        assert_relative_eq!(u_new.x, 0.2, epsilon = 1e-15);
    }

    #[test]
    fn test_gyration_preserves_energy() {
        let mut u = Vec3::new(0.5, 0.0, 0.1);
        let b = Vec3::new(0.0, 0.0, 2.0);
        let gamma0 = lorentz_factor(&u);
        for _ in 0..1000 {
            u = boris_push(u, Vec3::zeros(), b, -1.0, 0.05);
        }
        assert_relative_eq!(lorentz_factor(&u), gamma0, epsilon = 1e-12);
        assert_relative_eq!(u.z, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolate_uniform_and_linear() {
        let n = [4, 4, 4];
        let mut f = FieldArrays::zeros(n);
        f.get_mut(FieldComponent::Ey).as_mut_slice().fill(3.0);
        // Ex linear along x: value at sample (i + 1/2) equals i + 1/2
        for i in -2..6isize {
            for j in -2..6isize {
                for k in -2..6isize {
                    f.get_mut(FieldComponent::Ex).set(i, j, k, i as f64 + 0.5);
                }
            }
        }
        let s = [1.7, 2.2, 0.4];
        assert_relative_eq!(interpolate(&f, FieldComponent::Ey, s), 3.0, epsilon = 1e-14);
        assert_relative_eq!(interpolate(&f, FieldComponent::Ex, s), 1.7, epsilon = 1e-14);

        let patch = FieldPatch::gather(&f, [1, 2, 0]);
        let (e, _) = fields_at(&f, Some(&patch), s);
        assert_relative_eq!(e.x, 1.7, epsilon = 1e-14);
        assert_relative_eq!(e.y, 3.0, epsilon = 1e-14);
    }
}
