//! Global energy, charge and particle-count diagnostics.
//!
//! Quantities are computed only; reporting them is left to the caller.

use std::collections::BTreeMap;

use crate::cell::CellGrid;
use crate::domain::{GridGeometry, SimulationDomain, SpeciesId};
use crate::error::{PicError, Result};
use crate::exchange::Exchange;
use crate::field::{FieldArrays, FieldComponent};

/// `1/2 sum(E^2 + H^2) V` over this partition's interior.
pub fn field_energy(fields: &FieldArrays, geometry: &GridGeometry) -> f64 {
    let sum: f64 = FieldComponent::ELECTRIC
        .iter()
        .chain(FieldComponent::MAGNETIC.iter())
        .map(|&c| fields.get(c).interior_norm_squared())
        .sum();
    0.5 * sum * geometry.cell_volume()
}

/// `sum w m (gamma - 1)` over this partition's particles.
pub fn kinetic_energy(grid: &CellGrid, domain: &SimulationDomain) -> f64 {
    grid.particles()
        .map(|p| {
            let mass = domain.species(p.species).map_or(0.0, |s| s.mass);
            p.weight * mass * (p.gamma() - 1.0)
        })
        .sum()
}

/// `sum Rho V` over this partition's interior.
pub fn total_charge(fields: &FieldArrays, geometry: &GridGeometry) -> f64 {
    fields.get(FieldComponent::Rho).interior_sum() * geometry.cell_volume()
}

/// Charge carried by particles, `sum q w`.
pub fn particle_charge(grid: &CellGrid, domain: &SimulationDomain) -> f64 {
    grid.particles()
        .map(|p| domain.species(p.species).map_or(0.0, |s| s.charge) * p.weight)
        .sum()
}

/// Diagnostics summed over every partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub field_energy: f64,
    pub kinetic_energy: f64,
    pub total_charge: f64,
    pub species_counts: BTreeMap<SpeciesId, u64>,
}

impl Diagnostics {
    /// Collective: every partition must call it.
    pub fn gather<X: Exchange + ?Sized>(
        fields: &FieldArrays,
        grid: &CellGrid,
        domain: &SimulationDomain,
        geometry: &GridGeometry,
        exchange: &X,
    ) -> Result<Self> {
        let ids = domain.species_ids();
        let local_counts = grid.species_counts();
        let mut local = vec![
            field_energy(fields, geometry),
            kinetic_energy(grid, domain),
            total_charge(fields, geometry),
        ];
        local.extend(ids.iter().map(|id| local_counts.get(id).copied().unwrap_or(0) as f64));

        let global = exchange.all_reduce_sum(&local)?;
        if global.len() != local.len() {
            return Err(PicError::Exchange(format!(
                "reduction returned {} values, expected {}",
                global.len(),
                local.len()
            )));
        }
        Ok(Self {
            field_energy: global[0],
            kinetic_energy: global[1],
            total_charge: global[2],
            species_counts: ids
                .iter()
                .zip(&global[3..])
                .map(|(&id, &n)| (id, n.round() as u64))
                .collect(),
        })
    }

    pub fn total_energy(&self) -> f64 {
        self.field_energy + self.kinetic_energy
    }

    pub fn particle_count(&self) -> u64 {
        self.species_counts.values().sum()
    }
}

/// Baseline quantities to track drift against.
#[derive(Debug, Clone)]
pub struct ConservationState {
    pub baseline_energy: f64,
    pub baseline_charge: f64,
    pub baseline_count: u64,
}

impl ConservationState {
    pub fn new(diagnostics: &Diagnostics) -> Self {
        Self {
            baseline_energy: diagnostics.total_energy(),
            baseline_charge: diagnostics.total_charge,
            baseline_count: diagnostics.particle_count(),
        }
    }
}

/// Drift from a [`ConservationState`].
#[derive(Debug, Clone)]
pub struct ConservationMonitor {
    /// Relative energy error: |E - E0| / |E0|
    pub energy_error: f64,
    /// Absolute charge error.
    pub charge_error: f64,
    pub count_delta: i64,
}

impl ConservationMonitor {
    pub fn check(baseline: &ConservationState, diagnostics: &Diagnostics) -> Self {
        let energy = diagnostics.total_energy();
        let energy_error = if baseline.baseline_energy.abs() > 1e-12 {
            (energy - baseline.baseline_energy).abs() / baseline.baseline_energy.abs()
        } else {
            (energy - baseline.baseline_energy).abs()
        };
        Self {
            energy_error,
            charge_error: (diagnostics.total_charge - baseline.baseline_charge).abs(),
            count_delta: diagnostics.particle_count() as i64 - baseline.baseline_count as i64,
        }
    }

    pub fn is_violated(&self, energy_tol: f64, charge_tol: f64) -> bool {
        self.energy_error > energy_tol || self.charge_error > charge_tol || self.count_delta != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Decomposition, LocalExchange};
    use crate::particle::Particle;
    use crate::test_support::electron_domain;
    use approx::assert_relative_eq;
    use phyz_math::Vec3;

    #[test]
    fn test_energies_and_charge() {
        let domain = electron_domain([2, 2, 2], 0.1);
        let geom = domain.geometry(&Decomposition::single(domain.cells));
        let mut grid = CellGrid::new(&geom, &domain.species_ids());
        grid.insert(&geom, Particle::new(0, 0, Vec3::new(0.5, 0.5, 0.5), Vec3::new(0.75, 0.0, 0.0), 2.0))
            .unwrap();
        let mut fields = FieldArrays::zeros(geom.n);
        fields.get_mut(FieldComponent::Ex).set(0, 0, 0, 2.0);
        fields.get_mut(FieldComponent::Hz).set(1, 1, 1, 1.0);
        fields.get_mut(FieldComponent::Rho).set(1, 0, 0, -0.5);

        // gamma = sqrt(1 + 0.5625) = 1.25
        assert_relative_eq!(kinetic_energy(&grid, &domain), 0.5, epsilon = 1e-14);
        assert_relative_eq!(field_energy(&fields, &geom), 2.5);
        assert_relative_eq!(total_charge(&fields, &geom), -0.5);
        assert_relative_eq!(particle_charge(&grid, &domain), -2.0);

        let d = Diagnostics::gather(&fields, &grid, &domain, &geom, &LocalExchange).unwrap();
        assert_eq!(d.species_counts[&0], 1);
        assert_relative_eq!(d.total_energy(), 3.0, epsilon = 1e-14);

        let baseline = ConservationState::new(&d);
        let monitor = ConservationMonitor::check(&baseline, &d);
        assert!(!monitor.is_violated(1e-12, 1e-12));
    }
}
