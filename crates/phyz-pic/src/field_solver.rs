//! Yee-scheme update of E and H in normalized units (c = 1).
//!
//! Implements the staggered curl equations
//!   dH/dt = -curl E
//!   dE/dt =  curl H - J
//! split into two half-steps per timestep. The stencils are exposed over
//! explicit [`NodeRange`]s so backends and callers decide which nodes they
//! own; ghost nodes are refreshed from periodic images afterwards.

use rayon::prelude::*;
use tracing::debug;

use crate::backend::ComputeBackend;
use crate::boundary::fill_components;
use crate::domain::GridGeometry;
use crate::error::{PicError, Result};
use crate::exchange::Exchange;
use crate::field::{Array3D, FieldArrays, FieldComponent, NodeRange};
use crate::mirror::DeviceMirror;

/// Timestep and inverse spacings used by the stencils.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldCoefficients {
    pub tau: f64,
    pub inv_h: [f64; 3],
}

impl FieldCoefficients {
    pub fn new(tau: f64, h: [f64; 3]) -> Self {
        Self {
            tau,
            inv_h: [1.0 / h[0], 1.0 / h[1], 1.0 / h[2]],
        }
    }
}

/// Which update a stencil evaluation performs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stencil {
    /// `H -= fraction * tau * curl E`
    Magnetic { fraction: f64 },
    /// `E += tau * (curl H - J)`
    Electric,
}

fn apply_increment<F>(target: &mut Array3D, nodes: &[[isize; 3]], increment: F)
where
    F: Fn(isize, isize, isize) -> f64 + Sync,
{
    let deltas: Vec<f64> = nodes.par_iter().map(|&[i, j, k]| increment(i, j, k)).collect();
    for (&[i, j, k], d) in nodes.iter().zip(deltas) {
        target.add(i, j, k, d);
    }
}

/// Apply `stencil` to every node of `range`.
///
/// The magnetic stencil reads E at `+1` along each axis, the electric one
/// reads H at `-1`, so ranges may reach one node into the ghost layer on
/// the corresponding side.
pub fn evaluate_trace(
    fields: &mut FieldArrays,
    stencil: Stencil,
    coeffs: &FieldCoefficients,
    range: NodeRange,
) {
    let nodes: Vec<[isize; 3]> = range.iter().collect();
    let [ix, iy, iz] = coeffs.inv_h;
    let view = fields.split_mut();

    match stencil {
        Stencil::Magnetic { fraction } => {
            let c = fraction * coeffs.tau;
            let (ex, ey, ez) = (&view.e[0], &view.e[1], &view.e[2]);
            let [hx, hy, hz] = view.h else {
                unreachable!("magnetic group has three components")
            };
            apply_increment(hx, &nodes, |i, j, k| {
                let curl = (ez.get(i, j + 1, k) - ez.get(i, j, k)) * iy
                    - (ey.get(i, j, k + 1) - ey.get(i, j, k)) * iz;
                -c * curl
            });
            apply_increment(hy, &nodes, |i, j, k| {
                let curl = (ex.get(i, j, k + 1) - ex.get(i, j, k)) * iz
                    - (ez.get(i + 1, j, k) - ez.get(i, j, k)) * ix;
                -c * curl
            });
            apply_increment(hz, &nodes, |i, j, k| {
                let curl = (ey.get(i + 1, j, k) - ey.get(i, j, k)) * ix
                    - (ex.get(i, j + 1, k) - ex.get(i, j, k)) * iy;
                -c * curl
            });
        }
        Stencil::Electric => {
            let t = coeffs.tau;
            let (hx, hy, hz) = (&view.h[0], &view.h[1], &view.h[2]);
            let (jx, jy, jz) = (&view.j[0], &view.j[1], &view.j[2]);
            let [ex, ey, ez] = view.e else {
                unreachable!("electric group has three components")
            };
            apply_increment(ex, &nodes, |i, j, k| {
                let curl = (hz.get(i, j, k) - hz.get(i, j - 1, k)) * iy
                    - (hy.get(i, j, k) - hy.get(i, j, k - 1)) * iz;
                t * curl - t * jx.get(i, j, k)
            });
            apply_increment(ey, &nodes, |i, j, k| {
                let curl = (hx.get(i, j, k) - hx.get(i, j, k - 1)) * iz
                    - (hz.get(i, j, k) - hz.get(i - 1, j, k)) * ix;
                t * curl - t * jy.get(i, j, k)
            });
            apply_increment(ez, &nodes, |i, j, k| {
                let curl = (hy.get(i, j, k) - hy.get(i - 1, j, k)) * ix
                    - (hx.get(i, j, k) - hx.get(i, j - 1, k)) * iy;
                t * curl - t * jz.get(i, j, k)
            });
        }
    }
}

/// Fail with [`PicError::NumericDivergence`] on the first NaN or infinity.
pub fn check_finite(fields: &FieldArrays, components: &[FieldComponent], step: u64) -> Result<()> {
    for &component in components {
        if let Some((index, value)) = fields.get(component).first_non_finite() {
            return Err(PicError::NumericDivergence {
                step,
                component,
                index,
                value,
            });
        }
    }
    Ok(())
}

/// Drives the two field half-steps through a [`DeviceMirror`].
#[derive(Debug, Clone)]
pub struct FieldSolver {
    coeffs: FieldCoefficients,
    n: [usize; 3],
}

impl FieldSolver {
    pub fn new(geometry: &GridGeometry, tau: f64) -> Self {
        Self {
            coeffs: FieldCoefficients::new(tau, geometry.h),
            n: geometry.n,
        }
    }

    pub fn coefficients(&self) -> &FieldCoefficients {
        &self.coeffs
    }

    /// H is also advanced on the first low ghost layer, so the electric
    /// update that follows on the device sees current H at `-1`.
    pub fn magnetic_range(&self) -> NodeRange {
        NodeRange::with_low_ghosts(self.n, 1)
    }

    pub fn electric_range(&self) -> NodeRange {
        NodeRange::interior(self.n)
    }

    /// `H^{n} -> H^{n+1/2}`, then ghost refresh of H.
    ///
    /// Uploads the host fields first. On return the host copy is current
    /// and the device copy is stale.
    pub fn first_half_step<B, X>(&self, mirror: &mut DeviceMirror<B>, exchange: &X, step: u64) -> Result<()>
    where
        B: ComputeBackend,
        X: Exchange + ?Sized,
    {
        mirror.upload()?;
        mirror.advance_magnetic(&self.coeffs, 0.5, self.magnetic_range())?;
        mirror.download()?;

        let fields = mirror.host_mut()?;
        fill_components(fields, &FieldComponent::MAGNETIC, exchange)?;
        check_finite(fields, &FieldComponent::MAGNETIC, step)?;
        debug!(step, "first field half-step done");
        Ok(())
    }

    /// `H -> H^{n+1}`, `E^{n} -> E^{n+1}` using the deposited J, then ghost
    /// refresh of E and H. Uploads the host fields (carrying J) first.
    pub fn second_half_step<B, X>(&self, mirror: &mut DeviceMirror<B>, exchange: &X, step: u64) -> Result<()>
    where
        B: ComputeBackend,
        X: Exchange + ?Sized,
    {
        mirror.upload()?;
        mirror.advance_magnetic(&self.coeffs, 0.5, self.magnetic_range())?;
        mirror.advance_electric(&self.coeffs, self.electric_range())?;
        mirror.download()?;

        let fields = mirror.host_mut()?;
        fill_components(fields, &FieldComponent::ELECTRIC, exchange)?;
        fill_components(fields, &FieldComponent::MAGNETIC, exchange)?;
        check_finite(fields, &FieldComponent::ELECTRIC, step)?;
        check_finite(fields, &FieldComponent::MAGNETIC, step)?;
        debug!(step, "second field half-step done");
        Ok(())
    }
}
