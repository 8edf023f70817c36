//! Reassignment of particles to the cells owning their pushed positions.

use phyz_math::{Vec3, minimum_image_index, wrap_coordinate};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::cell::{CellGrid, Neighbor};
use crate::domain::{GridGeometry, MAX_HOPS, OvershootPolicy};
use crate::error::{PicError, Result};
use crate::exchange::{Exchange, Side};
use crate::particle::Particle;

/// Counts from one migration pass on this partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Particles that changed cell inside the partition.
    pub moved_local: usize,
    /// Particles handed to a neighbour partition.
    pub sent: usize,
    /// Particles received from neighbour partitions.
    pub received: usize,
    /// Particles placed by the clamp policy after the push.
    pub clamped: usize,
}

/// Where a leaving particle ends up after walking the neighbour table.
enum Route {
    Local(usize),
    Remote(Side),
}

/// Wrap a position into the global periodic box.
pub(crate) fn wrap_position(position: &Vec3, extents: &[f64; 3]) -> Vec3 {
    Vec3::new(
        wrap_coordinate(position.x, extents[0]),
        wrap_coordinate(position.y, extents[1]),
        wrap_coordinate(position.z, extents[2]),
    )
}

#[derive(Debug, Clone)]
pub struct CellMigrator {
    policy: OvershootPolicy,
    max_hops: usize,
}

impl CellMigrator {
    pub fn new(policy: OvershootPolicy, max_hops: usize) -> Self {
        Self {
            policy,
            max_hops: max_hops.clamp(1, MAX_HOPS),
        }
    }

    pub fn policy(&self) -> OvershootPolicy {
        self.policy
    }

    /// Most cells a particle may move in one step before the policy acts.
    fn hop_limit(&self) -> usize {
        match self.policy {
            OvershootPolicy::Walk => self.max_hops,
            OvershootPolicy::Clamp | OvershootPolicy::Fatal => 1,
        }
    }

    /// Apply the overshoot policy to freshly pushed particles, before
    /// anything is deposited from their positions. Afterwards every particle
    /// is within the hop limit of the cell holding it. Returns the number of
    /// clamped particles.
    pub fn resolve_overshoot(&self, grid: &mut CellGrid, geometry: &GridGeometry, tau: f64) -> Result<usize> {
        let limit = self.hop_limit();
        let per_cell: Vec<usize> = grid
            .cells_mut()
            .par_iter_mut()
            .map(|cell| {
                let from = global_index(geometry, cell.index);
                let mut clamped = 0;
                for (_, list) in cell.species_lists_mut() {
                    for p in list.iter_mut() {
                        let d = displacement(geometry, from, &p.position);
                        let hops = max_hops(d);
                        if hops <= limit {
                            continue;
                        }
                        if self.policy != OvershootPolicy::Clamp {
                            return Err(PicError::BoundaryViolation { particle: p.id, hops });
                        }
                        warn!(particle = p.id, hops, "clamping overshooting particle to adjacent cell");
                        clamp_to_adjacent(p, geometry, from, d, tau);
                        clamped += 1;
                    }
                }
                Ok(clamped)
            })
            .collect::<Result<_>>()?;
        Ok(per_cell.into_iter().sum())
    }

    /// Move every particle to the cell owning its position, exchanging
    /// partition-crossing particles with the X neighbours, then reorder and
    /// compact cell storage.
    ///
    /// The global particle count is checked before and after; a change is
    /// [`PicError::ParticleCountMismatch`].
    pub fn migrate<X: Exchange + ?Sized>(
        &self,
        grid: &mut CellGrid,
        geometry: &GridGeometry,
        exchange: &X,
        step: u64,
    ) -> Result<MigrationReport> {
        let before = global_count(grid, exchange)?;

        // Wrap positions and pull out particles that left their cell
        let leavers: Vec<Vec<Particle>> = grid
            .cells_mut()
            .par_iter_mut()
            .map(|cell| {
                let owned = cell.index;
                let mut out = Vec::new();
                for (_, list) in cell.species_lists_mut() {
                    for p in list.iter_mut() {
                        p.position = wrap_position(&p.position, &geometry.extents);
                    }
                    if list.iter().any(|p| !owns(geometry, owned, &p.position)) {
                        let (stay, leave): (Vec<Particle>, Vec<Particle>) = std::mem::take(list)
                            .into_iter()
                            .partition(|p| owns(geometry, owned, &p.position));
                        *list = stay;
                        out.extend(leave);
                    }
                }
                out
            })
            .collect();

        let mut report = MigrationReport::default();
        let mut moves: Vec<(usize, Particle)> = Vec::new();
        let mut to_low = Vec::new();
        let mut to_high = Vec::new();

        for (source, list) in leavers.into_iter().enumerate() {
            for p in list {
                match self.route(grid, geometry, source, &p)? {
                    Route::Local(dest) => moves.push((dest, p)),
                    Route::Remote(Side::Low) => to_low.push(p),
                    Route::Remote(Side::High) => to_high.push(p),
                }
            }
        }

        report.moved_local = moves.len();
        for (dest, p) in moves {
            grid.cell_mut(dest).insert(p);
        }

        report.sent = to_low.len() + to_high.len();
        let received = exchange.exchange_particles(to_low, to_high)?;
        report.received = received.len();
        for mut p in received {
            p.position = wrap_position(&p.position, &geometry.extents);
            grid.insert(geometry, p)?;
        }

        grid.compact();

        let after = global_count(grid, exchange)?;
        if before != after {
            return Err(PicError::ParticleCountMismatch { step, before, after });
        }
        debug!(
            step,
            moved = report.moved_local,
            sent = report.sent,
            received = report.received,
            "migration done"
        );
        Ok(report)
    }

    /// Walk from `source` towards the cell owning `p`.
    fn route(&self, grid: &CellGrid, geometry: &GridGeometry, source: usize, p: &Particle) -> Result<Route> {
        let from = global_index(geometry, grid.cell(source).index);
        let mut d = displacement(geometry, from, &p.position);
        let hops = max_hops(d);
        if hops > self.hop_limit() {
            return Err(PicError::BoundaryViolation { particle: p.id, hops });
        }

        let mut current = source;
        while d != [0, 0, 0] {
            let hop = [d[0].signum(), d[1].signum(), d[2].signum()];
            match grid.cell(current).neighbor(hop) {
                Neighbor::Local(next) => current = next,
                Neighbor::Remote(side) => return Ok(Route::Remote(side)),
            }
            for a in 0..3 {
                d[a] -= hop[a];
            }
        }
        Ok(Route::Local(current))
    }
}

/// Minimum-image cell offset from global cell `from` to the cell owning
/// `position`.
fn displacement(geometry: &GridGeometry, from: [isize; 3], position: &Vec3) -> [isize; 3] {
    let target = geometry.global_cell(&wrap_position(position, &geometry.extents));
    let mut d = [0isize; 3];
    for a in 0..3 {
        d[a] = minimum_image_index(from[a], target[a] as isize, geometry.n_global[a]);
    }
    d
}

fn max_hops(d: [isize; 3]) -> usize {
    d.iter().map(|x| x.unsigned_abs()).max().unwrap_or(0)
}

/// Move `p` to the centre of the adjacent cell on every axis where it
/// overshot. Its velocity on those axes is cut to the clamped displacement,
/// so the current deposited from the step midpoint follows the charge.
fn clamp_to_adjacent(p: &mut Particle, geometry: &GridGeometry, from: [isize; 3], d: [isize; 3], tau: f64) {
    let v = p.velocity();
    let start = p.position - v * tau;
    let mut velocity = v;
    for a in 0..3 {
        if d[a].abs() <= 1 {
            continue;
        }
        p.position[a] = ((from[a] + d[a].signum()) as f64 + 0.5) * geometry.h[a];
        let moved = v[a] * tau;
        if moved != 0.0 {
            velocity[a] = v[a] * ((p.position[a] - start[a]) / moved).clamp(0.0, 1.0);
        }
    }
    if velocity != v {
        p.momentum = velocity / (1.0 - velocity.norm_squared()).sqrt();
    }
}

fn global_index(geometry: &GridGeometry, local: [usize; 3]) -> [isize; 3] {
    [
        (local[0] + geometry.x_offset) as isize,
        local[1] as isize,
        local[2] as isize,
    ]
}

fn owns(geometry: &GridGeometry, local: [usize; 3], position: &Vec3) -> bool {
    let g = geometry.global_cell(position);
    g == [local[0] + geometry.x_offset, local[1], local[2]]
}

fn global_count<X: Exchange + ?Sized>(grid: &CellGrid, exchange: &X) -> Result<u64> {
    let total = exchange.all_reduce_sum(&[grid.particle_count() as f64])?;
    total
        .first()
        .map(|&v| v.round() as u64)
        .ok_or_else(|| PicError::Exchange("empty reduction result".into()))
}
