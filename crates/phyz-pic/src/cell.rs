//! Cells of one partition and their index-based neighbour links.

use std::collections::BTreeMap;

use phyz_math::wrap_index;

use crate::depositor::CurrentPatch;
use crate::domain::{GridGeometry, SpeciesId};
use crate::error::{PicError, Result};
use crate::exchange::Side;
use crate::particle::Particle;

/// Link from a cell to one of its 26 neighbours (or itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbor {
    /// Cell index in the same partition.
    Local(usize),
    /// The neighbour lives in the adjacent partition along X.
    Remote(Side),
}

/// Slot of offset `d` (each component in -1..=1) in a neighbour table.
#[inline]
pub fn neighbor_slot(d: [isize; 3]) -> usize {
    ((d[0] + 1) + 3 * (d[1] + 1) + 9 * (d[2] + 1)) as usize
}

/// One grid cell: its particles, neighbour links and current accumulator.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Local cell coordinates.
    pub index: [usize; 3],
    particles: BTreeMap<SpeciesId, Vec<Particle>>,
    neighbors: [Neighbor; 27],
    boundary: bool,
    pub current: CurrentPatch,
}

impl Cell {
    pub fn particles(&self, species: SpeciesId) -> &[Particle] {
        self.particles.get(&species).map_or(&[], |v| v.as_slice())
    }

    pub fn particles_mut(&mut self, species: SpeciesId) -> Option<&mut Vec<Particle>> {
        self.particles.get_mut(&species)
    }

    /// Per-species lists in ascending species id.
    pub fn species_lists(&self) -> impl Iterator<Item = (SpeciesId, &Vec<Particle>)> {
        self.particles.iter().map(|(&s, v)| (s, v))
    }

    pub fn species_lists_mut(&mut self) -> impl Iterator<Item = (SpeciesId, &mut Vec<Particle>)> {
        self.particles.iter_mut().map(|(&s, v)| (s, v))
    }

    /// Append a particle to its species list.
    pub fn insert(&mut self, particle: Particle) {
        self.particles.entry(particle.species).or_default().push(particle);
    }

    pub fn count(&self) -> usize {
        self.particles.values().map(Vec::len).sum()
    }

    #[inline]
    pub fn neighbor(&self, d: [isize; 3]) -> Neighbor {
        self.neighbors[neighbor_slot(d)]
    }

    /// Lies on a partition or periodic boundary face.
    pub fn is_boundary(&self) -> bool {
        self.boundary
    }

    /// The current accumulator together with read access to the particles.
    pub(crate) fn patch_and_particles(
        &mut self,
    ) -> (&mut CurrentPatch, impl Iterator<Item = (SpeciesId, &Vec<Particle>)>) {
        (&mut self.current, self.particles.iter().map(|(&s, v)| (s, v)))
    }

    /// Order every species list by particle id and release spare capacity.
    pub fn compact(&mut self) {
        for list in self.particles.values_mut() {
            list.sort_unstable_by_key(|p| p.id);
            list.shrink_to_fit();
        }
    }
}

/// All cells of one partition, X fastest.
#[derive(Debug, Clone)]
pub struct CellGrid {
    n: [usize; 3],
    cells: Vec<Cell>,
}

impl CellGrid {
    /// Build the cells of `geometry` with empty lists for every species.
    pub fn new(geometry: &GridGeometry, species: &[SpeciesId]) -> Self {
        let n = geometry.n;
        let mut cells = Vec::with_capacity(n[0] * n[1] * n[2]);
        for k in 0..n[2] {
            for j in 0..n[1] {
                for i in 0..n[0] {
                    let index = [i, j, k];
                    let mut neighbors = [Neighbor::Local(0); 27];
                    for dz in -1..=1isize {
                        for dy in -1..=1isize {
                            for dx in -1..=1isize {
                                let ni = i as isize + dx;
                                let link = if ni < 0 {
                                    Neighbor::Remote(Side::Low)
                                } else if ni >= n[0] as isize {
                                    Neighbor::Remote(Side::High)
                                } else {
                                    let nj = wrap_index(j as isize + dy, n[1]);
                                    let nk = wrap_index(k as isize + dz, n[2]);
                                    Neighbor::Local(ni as usize + n[0] * (nj + n[1] * nk))
                                };
                                neighbors[neighbor_slot([dx, dy, dz])] = link;
                            }
                        }
                    }
                    let boundary = (0..3).any(|a| index[a] == 0 || index[a] + 1 == n[a]);
                    cells.push(Cell {
                        index,
                        particles: species.iter().map(|&s| (s, Vec::new())).collect(),
                        neighbors,
                        boundary,
                        current: CurrentPatch::new(index),
                    });
                }
            }
        }
        Self { n, cells }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.n
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn linear_index(&self, c: [usize; 3]) -> usize {
        c[0] + self.n[0] * (c[1] + self.n[1] * c[2])
    }

    pub fn cell(&self, index: usize) -> &Cell {
        &self.cells[index]
    }

    pub fn cell_mut(&mut self, index: usize) -> &mut Cell {
        &mut self.cells[index]
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    /// Local cell owning a wrapped global position, if it is in this partition.
    pub fn locate(&self, geometry: &GridGeometry, particle: &Particle) -> Option<usize> {
        let g = geometry.global_cell(&particle.position);
        if !geometry.owns_x(g[0]) {
            return None;
        }
        Some(self.linear_index([g[0] - geometry.x_offset, g[1], g[2]]))
    }

    /// Place a particle in the cell owning its (wrapped) position.
    pub fn insert(&mut self, geometry: &GridGeometry, particle: Particle) -> Result<()> {
        match self.locate(geometry, &particle) {
            Some(idx) => {
                self.cells[idx].insert(particle);
                Ok(())
            }
            None => Err(PicError::BoundaryViolation {
                particle: particle.id,
                hops: 0,
            }),
        }
    }

    /// Number of particles in this partition.
    pub fn particle_count(&self) -> u64 {
        self.cells.iter().map(|c| c.count() as u64).sum()
    }

    /// Particles per species in this partition.
    pub fn species_counts(&self) -> BTreeMap<SpeciesId, u64> {
        let mut counts = BTreeMap::new();
        for cell in &self.cells {
            for (s, list) in cell.species_lists() {
                *counts.entry(s).or_insert(0) += list.len() as u64;
            }
        }
        counts
    }

    /// Every particle, cell by cell.
    pub fn particles(&self) -> impl Iterator<Item = &Particle> {
        self.cells
            .iter()
            .flat_map(|c| c.particles.values().flat_map(|v| v.iter()))
    }

    /// Index of the first cell holding a particle it does not own.
    pub fn first_misplaced(&self, geometry: &GridGeometry) -> Option<usize> {
        self.cells.iter().enumerate().find_map(|(idx, cell)| {
            cell.particles
                .values()
                .flatten()
                .any(|p| self.locate(geometry, p) != Some(idx))
                .then_some(idx)
        })
    }

    pub fn compact(&mut self) {
        for cell in &mut self.cells {
            cell.compact();
        }
    }
}
