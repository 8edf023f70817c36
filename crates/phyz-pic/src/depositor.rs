//! Current and charge deposition with per-cell accumulation.
//!
//! Each cell accumulates the contributions of its own particles into a
//! private 4x4x4 patch (node offsets -1..=2 around the cell), in parallel
//! across cells. Contributions that fall outside the patch go to the cell's
//! spill list. The patches are then added into the global arrays in cell
//! order, so the result does not depend on thread scheduling.

use phyz_math::{cic_stencil, corner_weight};
use rayon::prelude::*;
use tracing::debug;

use crate::boundary::{fill_ghosts, fold_components, fold_ghosts};
use crate::cell::CellGrid;
use crate::domain::{GridGeometry, RhoMode, SimulationDomain};
use crate::error::{PicError, Result};
use crate::exchange::Exchange;
use crate::field::{FieldArrays, FieldComponent, GHOST, NodeRange};
use crate::particle::Particle;

const PATCH_WIDTH: usize = 4;
const PATCH_VOLUME: usize = PATCH_WIDTH * PATCH_WIDTH * PATCH_WIDTH;
const SOURCES: [FieldComponent; 4] = [
    FieldComponent::Jx,
    FieldComponent::Jy,
    FieldComponent::Jz,
    FieldComponent::Rho,
];

/// Per-cell source accumulator.
#[derive(Debug, Clone)]
pub struct CurrentPatch {
    base: [isize; 3],
    values: Vec<f64>,
    spill: Vec<(FieldComponent, [isize; 3], f64)>,
}

impl CurrentPatch {
    pub fn new(cell: [usize; 3]) -> Self {
        Self {
            base: [cell[0] as isize - 1, cell[1] as isize - 1, cell[2] as isize - 1],
            values: vec![0.0; SOURCES.len() * PATCH_VOLUME],
            spill: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.values.fill(0.0);
        self.spill.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.spill.is_empty() && self.values.iter().all(|&v| v == 0.0)
    }

    /// Contributions that landed outside the patch.
    pub fn spill_len(&self) -> usize {
        self.spill.len()
    }

    fn slot(component: FieldComponent) -> usize {
        match component {
            FieldComponent::Jx => 0,
            FieldComponent::Jy => 1,
            FieldComponent::Jz => 2,
            _ => 3,
        }
    }

    /// Accumulate `value` at `node` of `component` (a current or Rho).
    #[inline]
    pub fn add(&mut self, component: FieldComponent, node: [isize; 3], value: f64) {
        let l = [
            node[0] - self.base[0],
            node[1] - self.base[1],
            node[2] - self.base[2],
        ];
        let w = PATCH_WIDTH as isize;
        if l.iter().all(|&x| (0..w).contains(&x)) {
            let idx = (l[0] + w * (l[1] + w * l[2])) as usize;
            self.values[Self::slot(component) * PATCH_VOLUME + idx] += value;
        } else {
            self.spill.push((component, node, value));
        }
    }

    /// Add the patch into the global arrays.
    pub fn reduce_into(&self, fields: &mut FieldArrays) {
        let w = PATCH_WIDTH as isize;
        for (s, &component) in SOURCES.iter().enumerate() {
            let array = fields.get_mut(component);
            let values = &self.values[s * PATCH_VOLUME..(s + 1) * PATCH_VOLUME];
            for lz in 0..w {
                for ly in 0..w {
                    for lx in 0..w {
                        let v = values[(lx + w * (ly + w * lz)) as usize];
                        if v != 0.0 {
                            array.add(self.base[0] + lx, self.base[1] + ly, self.base[2] + lz, v);
                        }
                    }
                }
            }
        }
        for &(component, [i, j, k], v) in &self.spill {
            fields.get_mut(component).add(i, j, k, v);
        }
    }
}

/// Spread `value` over the eight samples of `component` around local
/// coordinate `s`. Returns false (depositing nothing) if a sample lies
/// outside the ghost layer.
fn deposit_cic(patch: &mut CurrentPatch, component: FieldComponent, s: [f64; 3], value: f64, n: [usize; 3]) -> bool {
    let stagger = component.stagger();
    let st = [
        cic_stencil(s[0], stagger[0]),
        cic_stencil(s[1], stagger[1]),
        cic_stencil(s[2], stagger[2]),
    ];
    let g = GHOST as isize;
    for a in 0..3 {
        if st[a].base < -g || st[a].base + 1 >= n[a] as isize + g {
            return false;
        }
    }
    for c in 0..2 {
        for b in 0..2 {
            for a in 0..2 {
                let w = corner_weight(&st[0], &st[1], &st[2], a, b, c);
                let node = [
                    st[0].base + a as isize,
                    st[1].base + b as isize,
                    st[2].base + c as isize,
                ];
                patch.add(component, node, w * value);
            }
        }
    }
    true
}

/// Which sources a deposition pass produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sources {
    pub current: bool,
    pub charge: bool,
}

fn deposit_particle(
    patch: &mut CurrentPatch,
    particle: &Particle,
    charge: f64,
    geometry: &GridGeometry,
    tau: f64,
    sources: Sources,
) -> Result<()> {
    let q = charge * particle.weight / geometry.cell_volume();
    let mut ok = true;
    if sources.current {
        let v = particle.velocity();
        let mid = particle.position - v * (0.5 * tau);
        let s = geometry.local_coords(&mid);
        for (axis, component) in FieldComponent::CURRENT.into_iter().enumerate() {
            ok &= deposit_cic(patch, component, s, q * v[axis], geometry.n);
        }
    }
    if sources.charge {
        let s = geometry.local_coords(&particle.position);
        ok &= deposit_cic(patch, FieldComponent::Rho, s, q, geometry.n);
    }
    if ok {
        Ok(())
    } else {
        Err(PicError::DepositionOutOfRange {
            particle: particle.id,
        })
    }
}

/// Zeroes and accumulates J and Rho from particle motion.
#[derive(Debug, Clone)]
pub struct CurrentDepositor {
    mode: RhoMode,
    rho_initialized: bool,
}

impl CurrentDepositor {
    pub fn new(mode: RhoMode) -> Self {
        Self {
            mode,
            rho_initialized: false,
        }
    }

    pub fn mode(&self) -> RhoMode {
        self.mode
    }

    fn deposits_rho(&self) -> bool {
        self.mode == RhoMode::Recompute || !self.rho_initialized
    }

    /// Reset the accumulators for a new step: J always, Rho when it is
    /// re-deposited. Calling it twice leaves the same all-zero state.
    pub fn zero(&self, fields: &mut FieldArrays) {
        fields.clear_sources(self.deposits_rho());
    }

    /// Deposit the initial charge density without any current.
    pub fn initialize_charge<X: Exchange + ?Sized>(
        &mut self,
        grid: &mut CellGrid,
        fields: &mut FieldArrays,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
        exchange: &X,
    ) -> Result<()> {
        fields.clear_sources(true);
        self.deposit_rho(grid, fields, domain, geometry, exchange)
    }

    /// Zero the sources and deposit this step's current at the step
    /// midpoint. In `Continuity` mode Rho is then advanced by `-tau div J`.
    ///
    /// Particles are at their pushed, not yet migrated, positions.
    pub fn deposit_current<X: Exchange + ?Sized>(
        &mut self,
        grid: &mut CellGrid,
        fields: &mut FieldArrays,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
        exchange: &X,
    ) -> Result<()> {
        self.zero(fields);
        let sources = Sources {
            current: true,
            charge: false,
        };
        let spilled = accumulate(grid, fields, domain, geometry, sources)?;
        fold_components(fields, &FieldComponent::CURRENT, exchange)?;

        if !self.deposits_rho() {
            advance_continuity(fields, geometry, domain.tau);
            fill_ghosts(fields.get_mut(FieldComponent::Rho), exchange)?;
        }
        debug!(spilled, rho = ?self.mode, "current deposition done");
        Ok(())
    }

    /// Deposit Rho at the new positions when this mode re-deposits it.
    ///
    /// Runs after migration, so every particle sits in the cell owning it.
    pub fn deposit_charge<X: Exchange + ?Sized>(
        &mut self,
        grid: &mut CellGrid,
        fields: &mut FieldArrays,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
        exchange: &X,
    ) -> Result<()> {
        if !self.deposits_rho() {
            return Ok(());
        }
        fields.get_mut(FieldComponent::Rho).clear();
        self.deposit_rho(grid, fields, domain, geometry, exchange)
    }

    fn deposit_rho<X: Exchange + ?Sized>(
        &mut self,
        grid: &mut CellGrid,
        fields: &mut FieldArrays,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
        exchange: &X,
    ) -> Result<()> {
        let sources = Sources {
            current: false,
            charge: true,
        };
        accumulate(grid, fields, domain, geometry, sources)?;
        fold_ghosts(fields.get_mut(FieldComponent::Rho), exchange)?;
        self.rho_initialized = true;
        Ok(())
    }
}

/// Accumulate per cell in parallel, then reduce in cell order. Returns the
/// number of spilled contributions.
fn accumulate(
    grid: &mut CellGrid,
    fields: &mut FieldArrays,
    domain: &SimulationDomain,
    geometry: &GridGeometry,
    sources: Sources,
) -> Result<usize> {
    let tau = domain.tau;
    grid.cells_mut().par_iter_mut().try_for_each(|cell| {
        let (patch, lists) = cell.patch_and_particles();
        patch.clear();
        for (id, list) in lists {
            let species = domain
                .species(id)
                .ok_or_else(|| PicError::InvalidConfig(format!("unknown species {id}")))?;
            for p in list {
                deposit_particle(patch, p, species.charge, geometry, tau, sources)?;
            }
        }
        Ok::<(), PicError>(())
    })?;

    let mut spilled = 0;
    for cell in grid.cells() {
        cell.current.reduce_into(fields);
        spilled += cell.current.spill_len();
    }
    Ok(spilled)
}

/// `Rho -= tau * div J` on interior nodes.
fn advance_continuity(fields: &mut FieldArrays, geometry: &GridGeometry, tau: f64) {
    let [ix, iy, iz] = [1.0 / geometry.h[0], 1.0 / geometry.h[1], 1.0 / geometry.h[2]];
    let view = fields.split_mut();
    let (jx, jy, jz) = (&view.j[0], &view.j[1], &view.j[2]);
    for [i, j, k] in NodeRange::interior(geometry.n).iter() {
        let div = (jx.get(i, j, k) - jx.get(i - 1, j, k)) * ix
            + (jy.get(i, j, k) - jy.get(i, j - 1, k)) * iy
            + (jz.get(i, j, k) - jz.get(i, j, k - 1)) * iz;
        view.rho.add(i, j, k, -tau * div);
    }
}
