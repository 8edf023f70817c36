//! Macro-particle state.

use phyz_math::Vec3;

use crate::domain::SpeciesId;

/// A charged macro-particle.
///
/// `momentum` is the relativistic momentum per unit mass, `u = gamma v`,
/// in units where c = 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    /// Stable identifier, unique for the whole run.
    pub id: u64,
    pub position: Vec3,
    pub momentum: Vec3,
    pub species: SpeciesId,
    /// Statistical weight (number of physical particles represented).
    pub weight: f64,
}

impl Particle {
    pub fn new(id: u64, species: SpeciesId, position: Vec3, momentum: Vec3, weight: f64) -> Self {
        Self {
            id,
            position,
            momentum,
            species,
            weight,
        }
    }

    /// Particle at rest.
    pub fn at_rest(id: u64, species: SpeciesId, position: Vec3, weight: f64) -> Self {
        Self::new(id, species, position, Vec3::zeros(), weight)
    }

    /// Build a particle from its velocity (|v| < 1).
    pub fn with_velocity(
        id: u64,
        species: SpeciesId,
        position: Vec3,
        velocity: Vec3,
        weight: f64,
    ) -> Self {
        let gamma = 1.0 / (1.0 - velocity.norm_squared()).sqrt();
        Self::new(id, species, position, velocity * gamma, weight)
    }

    /// Lorentz factor.
    #[inline]
    pub fn gamma(&self) -> f64 {
        lorentz_factor(&self.momentum)
    }

    #[inline]
    pub fn velocity(&self) -> Vec3 {
        self.momentum / self.gamma()
    }
}

/// `sqrt(1 + |u|^2)` for momentum per unit mass `u`.
#[inline]
pub fn lorentz_factor(u: &Vec3) -> f64 {
    (1.0 + u.norm_squared()).sqrt()
}
