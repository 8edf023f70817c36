//! Initial two-stream plasma: electrons, an electron beam and ions.

use std::f64::consts::PI;

use phyz_math::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::{info, warn};

use crate::cell::CellGrid;
use crate::domain::{GridGeometry, SimulationDomain, SpeciesId};
use crate::error::{PicError, Result};
use crate::exchange::Exchange;
use crate::particle::Particle;

pub const ELECTRONS: SpeciesId = 0;
pub const BEAM: SpeciesId = 1;
pub const IONS: SpeciesId = 2;

/// Fallback electron temperature when sampled velocities are superluminal.
pub const DEFAULT_TEMPERATURE: f64 = 0.001;
/// Fallback beam velocity.
pub const DEFAULT_BEAM_VELOCITY: f64 = 0.14;

/// Ratio between the full width at half maximum and the standard deviation
/// of a Gaussian.
const FWHM_PER_SIGMA: f64 = 2.355;

/// Spatial density profile along X.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadProfile {
    /// `n_per_cell` triplets in every cell, with the beam.
    Uniform,
    /// `(1 + amplitude cos(2 pi i / Nx)) n_per_cell` triplets per cell, no beam.
    Sinusoidal { amplitude: f64 },
}

#[derive(Debug, Clone)]
pub struct PlasmaLoader {
    pub profile: LoadProfile,
    pub electron_temperature: f64,
    pub beam_velocity: f64,
    pub seed: u64,
}

impl Default for PlasmaLoader {
    fn default() -> Self {
        Self {
            profile: LoadProfile::Uniform,
            electron_temperature: DEFAULT_TEMPERATURE,
            beam_velocity: DEFAULT_BEAM_VELOCITY,
            seed: 0,
        }
    }
}

/// Sampled particles of one cell before insertion.
struct CellLoad {
    particles: Vec<Particle>,
    superluminal: bool,
}

impl PlasmaLoader {
    /// Triplets in global X cell `gx`.
    pub fn triplets(&self, gx: usize, nx: usize, n_per_cell: usize) -> usize {
        match self.profile {
            LoadProfile::Uniform => n_per_cell,
            LoadProfile::Sinusoidal { amplitude } => {
                let scale = 1.0 + amplitude * (2.0 * PI * gx as f64 / nx as f64).cos();
                (scale * n_per_cell as f64).max(0.0) as usize
            }
        }
    }

    /// Id range reserved per cell, four particles per triplet.
    fn id_stride(&self, n_per_cell: usize) -> u64 {
        let max_triplets = match self.profile {
            LoadProfile::Uniform => n_per_cell,
            LoadProfile::Sinusoidal { amplitude } => {
                ((1.0 + amplitude.abs()) * n_per_cell as f64) as usize + 1
            }
        };
        4 * max_triplets as u64
    }

    fn check_species(&self, domain: &SimulationDomain) -> Result<[f64; 3]> {
        let get = |id: SpeciesId| {
            domain
                .species(id)
                .ok_or_else(|| PicError::InvalidConfig(format!("plasma loader needs species {id}")))
        };
        let (e, b, i) = (get(ELECTRONS)?, get(BEAM)?, get(IONS)?);
        let net = 2.0 * e.charge + b.charge + i.charge;
        let scale = e.charge.abs().max(b.charge.abs()).max(i.charge.abs());
        if net.abs() > 1e-12 * scale {
            return Err(PicError::InvalidConfig(format!(
                "plasma is not neutral: 2 q0 + q1 + q2 = {net}"
            )));
        }
        Ok([e.mass, b.mass, i.mass])
    }

    /// Fill the cells of this partition. Collective: every partition calls
    /// it so the superluminal fallback is taken everywhere or nowhere.
    /// Returns the number of particles loaded locally.
    pub fn load<X: Exchange + ?Sized>(
        &self,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
        grid: &mut CellGrid,
        exchange: &X,
    ) -> Result<usize> {
        let masses = self.check_species(domain)?;
        let mut te = self.electron_temperature;
        let mut vb = self.beam_velocity;
        if !(te.is_finite() && te >= 0.0) {
            return Err(PicError::InvalidConfig(format!("electron temperature {te}")));
        }

        let loads = loop {
            let loads = self.sample(domain, geometry, masses, te, vb)?;
            let bad = loads.iter().any(|l| l.superluminal) || vb.abs() >= 1.0;
            let bad_anywhere = exchange.all_reduce_sum(&[f64::from(u8::from(bad))])?;
            if bad_anywhere.first().copied().unwrap_or(0.0) == 0.0 {
                break loads;
            }
            if te == DEFAULT_TEMPERATURE && vb == DEFAULT_BEAM_VELOCITY {
                return Err(PicError::InvalidConfig(
                    "default plasma parameters give superluminal particles".into(),
                ));
            }
            warn!(
                temperature = te,
                beam_velocity = vb,
                "superluminal particle sampled, reloading with defaults"
            );
            te = DEFAULT_TEMPERATURE;
            vb = DEFAULT_BEAM_VELOCITY;
        };

        let mut loaded = 0;
        for load in loads {
            for p in load.particles {
                grid.insert(geometry, p)?;
                loaded += 1;
            }
        }
        grid.compact();
        info!(loaded, temperature = te, beam_velocity = vb, profile = ?self.profile, "plasma loaded");
        Ok(loaded)
    }

    fn sample(
        &self,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
        masses: [f64; 3],
        te: f64,
        vb: f64,
    ) -> Result<Vec<CellLoad>> {
        let sigma = te / FWHM_PER_SIGMA;
        let thermal = Normal::new(0.0, sigma)
            .map_err(|e| PicError::InvalidConfig(format!("electron temperature {te}: {e}")))?;
        let with_beam = matches!(self.profile, LoadProfile::Uniform);
        let drift = if with_beam { -(masses[1] / masses[0]) * vb / 2.0 } else { 0.0 };
        let beam_u = vb / (1.0 - vb * vb).max(f64::MIN_POSITIVE).sqrt();
        let weight = 1.0 / domain.n_per_cell as f64;
        let stride = self.id_stride(domain.n_per_cell);
        let [nx, ny, nz] = geometry.n_global;
        let h = geometry.h;

        let mut loads = Vec::with_capacity(geometry.cell_count());
        for gz in 0..nz {
            for gy in 0..ny {
                for gx in geometry.x_offset..geometry.x_offset + geometry.n[0] {
                    let cell = (gx + nx * (gy + ny * gz)) as u64;
                    let mut rng = StdRng::seed_from_u64(self.seed ^ cell.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                    let mut load = CellLoad {
                        particles: Vec::new(),
                        superluminal: false,
                    };
                    for t in 0..self.triplets(gx, nx, domain.n_per_cell) as u64 {
                        let position = Vec3::new(
                            (gx as f64 + rng.r#gen::<f64>()) * h[0],
                            (gy as f64 + rng.r#gen::<f64>()) * h[1],
                            (gz as f64 + rng.r#gen::<f64>()) * h[2],
                        );
                        // Without the beam the electron pair gets a position of
                        // its own instead of sitting on the ion.
                        let electron_position = if with_beam {
                            position
                        } else {
                            Vec3::new(
                                (gx as f64 + rng.r#gen::<f64>()) * h[0],
                                (gy as f64 + rng.r#gen::<f64>()) * h[1],
                                (gz as f64 + rng.r#gen::<f64>()) * h[2],
                            )
                        };
                        let id = cell * stride + 4 * t;

                        let tx = thermal.sample(&mut rng);
                        for (slot, sign) in [(0u64, 1.0), (1, -1.0)] {
                            let v = Vec3::new(
                                drift + sign * tx,
                                thermal.sample(&mut rng),
                                thermal.sample(&mut rng),
                            );
                            if v.norm() >= 1.0 {
                                load.superluminal = true;
                                continue;
                            }
                            load.particles.push(Particle::with_velocity(id + slot, ELECTRONS, electron_position, v, weight));
                        }
                        if with_beam {
                            load.particles.push(Particle::new(
                                id + 2,
                                BEAM,
                                position,
                                Vec3::new(beam_u, 0.0, 0.0),
                                weight,
                            ));
                        }
                        load.particles.push(Particle::at_rest(id + 3, IONS, position, weight));
                    }
                    loads.push(load);
                }
            }
        }
        Ok(loads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainConfig, SpeciesConfig};
    use crate::exchange::{Decomposition, LocalExchange};
    use std::collections::HashSet;

    fn two_stream(cells: [usize; 3], n_per_cell: usize, ion_charge: f64) -> SimulationDomain {
        let species = [("electrons", -1.0, 1.0), ("beam", -1.0, 1.0), ("ions", ion_charge, 1836.0)]
            .into_iter()
            .enumerate()
            .map(|(id, (name, charge, mass))| SpeciesConfig {
                id: id as SpeciesId,
                name: name.into(),
                charge,
                mass,
            })
            .collect();
        SimulationDomain::new(DomainConfig {
            cells,
            extents: [cells[0] as f64, cells[1] as f64, cells[2] as f64],
            tau: 0.2,
            n_per_cell,
            species,
            rho_mode: Default::default(),
            overshoot: Default::default(),
            max_hops: 2,
        })
        .unwrap()
    }

    fn load(domain: &SimulationDomain, loader: &PlasmaLoader, d: Decomposition) -> CellGrid {
        let geom = domain.geometry(&d);
        let mut grid = CellGrid::new(&geom, &domain.species_ids());
        loader.load(domain, &geom, &mut grid, &LocalExchange).unwrap();
        grid
    }

    #[test]
    fn test_uniform_load() {
        let domain = two_stream([4, 2, 2], 3, 3.0);
        let loader = PlasmaLoader {
            electron_temperature: 0.01,
            beam_velocity: 0.2,
            ..Default::default()
        };
        let grid = load(&domain, &loader, Decomposition::single(domain.cells));
        let counts = grid.species_counts();
        assert_eq!(counts[&ELECTRONS], 2 * 16 * 3);
        assert_eq!(counts[&BEAM], 16 * 3);
        assert_eq!(counts[&IONS], 16 * 3);

        let ids: HashSet<u64> = grid.particles().map(|p| p.id).collect();
        assert_eq!(ids.len() as u64, grid.particle_count());

        let beam_u = 0.2 / (1.0 - 0.04f64).sqrt();
        for p in grid.particles() {
            match p.species {
                BEAM => assert!((p.momentum.x - beam_u).abs() < 1e-12),
                IONS => assert_eq!(p.momentum, Vec3::zeros()),
                _ => assert!(p.velocity().norm() < 1.0),
            }
            assert!((p.weight - 1.0 / 3.0).abs() < 1e-15);
        }
        assert_eq!(grid.first_misplaced(&domain.geometry(&Decomposition::single(domain.cells))), None);
    }

    #[test]
    fn test_sinusoidal_profile() {
        let loader = PlasmaLoader {
            profile: LoadProfile::Sinusoidal { amplitude: 0.5 },
            ..Default::default()
        };
        assert_eq!(loader.triplets(0, 4, 10), 15);
        assert_eq!(loader.triplets(2, 4, 10), 5);

        let domain = two_stream([4, 2, 2], 10, 3.0);
        let grid = load(&domain, &loader, Decomposition::single(domain.cells));
        assert_eq!(grid.species_counts()[&BEAM], 0);
        let per_column: usize = (0..4).map(|gx| loader.triplets(gx, 4, 10)).sum();
        assert_eq!(grid.species_counts()[&IONS], 4 * per_column as u64);
        assert_eq!(grid.species_counts()[&ELECTRONS], 8 * per_column as u64);
    }

    #[test]
    fn test_electron_positions_by_profile() {
        let domain = two_stream([4, 2, 2], 3, 3.0);
        let at = |grid: &CellGrid, id: u64| grid.particles().find(|p| p.id == id).map(|p| p.position);
        let first_ion = |grid: &CellGrid| grid.particles().filter(|p| p.species == IONS).map(|p| p.id).min();

        // Uniform: the electron pair shares the ion's position
        let grid = load(&domain, &PlasmaLoader::default(), Decomposition::single(domain.cells));
        let ion = first_ion(&grid).unwrap();
        assert_eq!(at(&grid, ion - 3), at(&grid, ion));
        assert_eq!(at(&grid, ion - 2), at(&grid, ion));

        // Sinusoidal: the pair is sampled apart from the ion
        let loader = PlasmaLoader {
            profile: LoadProfile::Sinusoidal { amplitude: 0.5 },
            ..Default::default()
        };
        let grid = load(&domain, &loader, Decomposition::single(domain.cells));
        let ion = first_ion(&grid).unwrap();
        let electron = at(&grid, ion - 3).unwrap();
        assert_eq!(at(&grid, ion - 2), Some(electron));
        assert_ne!(Some(electron), at(&grid, ion));
        assert_eq!(grid.first_misplaced(&domain.geometry(&Decomposition::single(domain.cells))), None);
    }

    #[test]
    fn test_same_plasma_for_every_decomposition() {
        let domain = two_stream([6, 2, 2], 2, 3.0);
        let loader = PlasmaLoader {
            seed: 42,
            ..Default::default()
        };
        let whole = load(&domain, &loader, Decomposition::single(domain.cells));
        let mut parts: Vec<Particle> = (0..2)
            .flat_map(|rank| {
                let grid = load(&domain, &loader, Decomposition::slab(domain.cells, rank, 2).unwrap());
                grid.particles().cloned().collect::<Vec<_>>()
            })
            .collect();
        let mut all: Vec<Particle> = whole.particles().cloned().collect();
        parts.sort_by_key(|p| p.id);
        all.sort_by_key(|p| p.id);
        assert_eq!(parts, all);
    }

    #[test]
    fn test_superluminal_fallback_and_neutrality() {
        let domain = two_stream([2, 2, 2], 2, 3.0);
        let loader = PlasmaLoader {
            beam_velocity: 1.5,
            ..Default::default()
        };
        let grid = load(&domain, &loader, Decomposition::single(domain.cells));
        let beam_u = DEFAULT_BEAM_VELOCITY / (1.0 - DEFAULT_BEAM_VELOCITY.powi(2)).sqrt();
        let beam = grid.particles().find(|p| p.species == BEAM).unwrap();
        assert!((beam.momentum.x - beam_u).abs() < 1e-12);

        let charged = two_stream([2, 2, 2], 2, 1.0);
        let geom = charged.geometry(&Decomposition::single(charged.cells));
        let mut grid = CellGrid::new(&geom, &charged.species_ids());
        let err = PlasmaLoader::default().load(&charged, &geom, &mut grid, &LocalExchange);
        assert!(matches!(err, Err(PicError::InvalidConfig(_))));
    }
}
