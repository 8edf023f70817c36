//! Global run configuration and the local grid geometry derived from it.

use std::collections::BTreeMap;
use std::path::Path;

use phyz_math::Vec3;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PicError, Result};
use crate::exchange::Decomposition;
use crate::field::GHOST;

/// Largest `max_hops` a walk may take. A particle that walked this far has
/// its step midpoint within `GHOST - 1` cells of its old cell, where the
/// current stencil still fits in the ghost layer.
pub const MAX_HOPS: usize = 2 * (GHOST - 1);

/// Species identifier.
pub type SpeciesId = u32;

/// Particle species as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesConfig {
    pub id: SpeciesId,
    pub name: String,
    pub charge: f64,
    pub mass: f64,
}

/// Physical species description.
#[derive(Debug, Clone, PartialEq)]
pub struct Species {
    pub id: SpeciesId,
    pub name: String,
    pub charge: f64,
    pub mass: f64,
}

impl Species {
    /// Charge-to-mass ratio.
    #[inline]
    pub fn q_m(&self) -> f64 {
        self.charge / self.mass
    }
}

/// How charge density is obtained each step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RhoMode {
    /// Zero and re-deposit from particle positions every step.
    #[default]
    Recompute,
    /// Deposit once, then advance with the continuity equation.
    Continuity,
}

/// What migration does with a particle that moved more than one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OvershootPolicy {
    /// Walk the neighbour table for up to `max_hops` hops.
    #[default]
    Walk,
    /// Place the particle in the adjacent cell and warn.
    Clamp,
    /// Abort with a boundary violation.
    Fatal,
}

fn default_max_hops() -> usize {
    2
}

/// Run configuration, loaded once and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Global cell counts (Nx, Ny, Nz).
    pub cells: [usize; 3],
    /// Physical extents (Lx, Ly, Lz).
    pub extents: [f64; 3],
    /// Timestep.
    pub tau: f64,
    /// Target particle triplets per cell.
    pub n_per_cell: usize,
    pub species: Vec<SpeciesConfig>,
    #[serde(default)]
    pub rho_mode: RhoMode,
    #[serde(default)]
    pub overshoot: OvershootPolicy,
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

/// Validated, read-only simulation domain shared by all components.
#[derive(Debug, Clone)]
pub struct SimulationDomain {
    pub cells: [usize; 3],
    pub extents: [f64; 3],
    pub tau: f64,
    pub n_per_cell: usize,
    pub rho_mode: RhoMode,
    pub overshoot: OvershootPolicy,
    pub max_hops: usize,
    species: BTreeMap<SpeciesId, Species>,
}

impl SimulationDomain {
    /// Validate a configuration and build the domain.
    pub fn new(config: DomainConfig) -> Result<Self> {
        for (axis, &n) in config.cells.iter().enumerate() {
            if n < 2 {
                return Err(PicError::InvalidConfig(format!(
                    "axis {axis} has {n} cells, at least 2 required"
                )));
            }
        }
        for (axis, &l) in config.extents.iter().enumerate() {
            if !(l.is_finite() && l > 0.0) {
                return Err(PicError::InvalidConfig(format!(
                    "axis {axis} has extent {l}, must be positive and finite"
                )));
            }
        }
        if !(config.tau.is_finite() && config.tau > 0.0) {
            return Err(PicError::InvalidConfig(format!(
                "timestep {} must be positive and finite",
                config.tau
            )));
        }

        if config.max_hops > MAX_HOPS {
            return Err(PicError::InvalidConfig(format!(
                "max_hops {} exceeds the limit of {MAX_HOPS}",
                config.max_hops
            )));
        }

        let mut species = BTreeMap::new();
        for s in config.species {
            if !(s.mass.is_finite() && s.mass != 0.0) {
                return Err(PicError::InvalidConfig(format!(
                    "species {} has mass {}",
                    s.id, s.mass
                )));
            }
            if !s.charge.is_finite() {
                return Err(PicError::InvalidConfig(format!(
                    "species {} has charge {}",
                    s.id, s.charge
                )));
            }
            let id = s.id;
            let entry = Species {
                id,
                name: s.name,
                charge: s.charge,
                mass: s.mass,
            };
            if species.insert(id, entry).is_some() {
                return Err(PicError::InvalidConfig(format!("duplicate species id {id}")));
            }
        }

        let domain = Self {
            cells: config.cells,
            extents: config.extents,
            tau: config.tau,
            n_per_cell: config.n_per_cell,
            rho_mode: config.rho_mode,
            overshoot: config.overshoot,
            max_hops: config.max_hops.max(1),
            species,
        };

        if !domain.is_stable() {
            warn!(
                tau = domain.tau,
                limit = domain.courant_limit(),
                "timestep exceeds the Courant limit"
            );
        }
        info!(
            cells = ?domain.cells,
            extents = ?domain.extents,
            tau = domain.tau,
            species = domain.species.len(),
            "simulation domain configured"
        );
        Ok(domain)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DomainConfig = serde_json::from_str(json)?;
        Self::new(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PicError::InvalidConfig(format!("cannot read configuration: {e}")))?;
        Self::from_json_str(&text)
    }

    /// Check that `decomposition` splits this domain into slabs no narrower
    /// than `max_hops`, so a walking particle never skips a partition.
    pub fn check_decomposition(&self, decomposition: &Decomposition) -> Result<()> {
        let nx = self.cells[0];
        if decomposition.size == 0
            || decomposition.rank >= decomposition.size
            || decomposition.x_offset + decomposition.nx_local > nx
        {
            return Err(PicError::InvalidConfig(format!(
                "{decomposition:?} does not fit {nx} x cells"
            )));
        }
        let narrowest = nx / decomposition.size;
        if decomposition.size > 1 && self.max_hops > narrowest {
            return Err(PicError::InvalidConfig(format!(
                "max_hops {} exceeds the narrowest slab of {narrowest} cells",
                self.max_hops
            )));
        }
        Ok(())
    }

    /// Grid spacing per axis.
    pub fn spacing(&self) -> [f64; 3] {
        [
            self.extents[0] / self.cells[0] as f64,
            self.extents[1] / self.cells[1] as f64,
            self.extents[2] / self.cells[2] as f64,
        ]
    }

    /// Volume of one cell.
    pub fn cell_volume(&self) -> f64 {
        let h = self.spacing();
        h[0] * h[1] * h[2]
    }

    /// Largest stable timestep of the 3D Yee scheme (c = 1).
    pub fn courant_limit(&self) -> f64 {
        let h = self.spacing();
        h[0].min(h[1]).min(h[2]) / 3_f64.sqrt()
    }

    pub fn is_stable(&self) -> bool {
        self.tau <= self.courant_limit()
    }

    pub fn species(&self, id: SpeciesId) -> Option<&Species> {
        self.species.get(&id)
    }

    /// All species in ascending id order.
    pub fn species_iter(&self) -> impl Iterator<Item = &Species> {
        self.species.values()
    }

    pub fn species_ids(&self) -> Vec<SpeciesId> {
        self.species.keys().copied().collect()
    }

    /// Geometry of the partition owned by `decomposition`.
    pub fn geometry(&self, decomposition: &Decomposition) -> GridGeometry {
        let h = self.spacing();
        GridGeometry {
            n: [decomposition.nx_local, self.cells[1], self.cells[2]],
            n_global: self.cells,
            x_offset: decomposition.x_offset,
            h,
            origin: Vec3::new(decomposition.x_offset as f64 * h[0], 0.0, 0.0),
            extents: self.extents,
        }
    }
}

/// Geometry of one partition's local grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    /// Local cell counts.
    pub n: [usize; 3],
    pub n_global: [usize; 3],
    /// First global x cell of this partition.
    pub x_offset: usize,
    pub h: [f64; 3],
    /// Position of local node (0, 0, 0).
    pub origin: Vec3,
    pub extents: [f64; 3],
}

impl GridGeometry {
    /// Position measured in local cell units.
    #[inline]
    pub fn local_coords(&self, x: &Vec3) -> [f64; 3] {
        [
            (x.x - self.origin.x) / self.h[0],
            (x.y - self.origin.y) / self.h[1],
            (x.z - self.origin.z) / self.h[2],
        ]
    }

    /// Global cell containing a wrapped position. A position on a face
    /// belongs to the higher-index cell.
    #[inline]
    pub fn global_cell(&self, x: &Vec3) -> [usize; 3] {
        let p = [x.x, x.y, x.z];
        let mut c = [0usize; 3];
        for a in 0..3 {
            let s = (p[a] / self.h[a]).floor();
            c[a] = if s <= 0.0 {
                0
            } else {
                (s as usize).min(self.n_global[a] - 1)
            };
        }
        c
    }

    pub fn cell_volume(&self) -> f64 {
        self.h[0] * self.h[1] * self.h[2]
    }

    pub fn cell_count(&self) -> usize {
        self.n[0] * self.n[1] * self.n[2]
    }

    /// Whether a global x cell lies in this partition.
    #[inline]
    pub fn owns_x(&self, gx: usize) -> bool {
        gx >= self.x_offset && gx < self.x_offset + self.n[0]
    }
}
