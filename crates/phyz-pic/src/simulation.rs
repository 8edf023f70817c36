//! Step driver tying the components together.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, debug_span, info, warn};

use crate::backend::ComputeBackend;
use crate::boundary::fill_components;
use crate::cell::CellGrid;
use crate::control_point::ControlPoint;
use crate::depositor::CurrentDepositor;
use crate::diagnostics::Diagnostics;
use crate::domain::{GridGeometry, SimulationDomain};
use crate::error::{PicError, Result};
use crate::exchange::{Decomposition, Exchange};
use crate::field::{FieldArrays, FieldComponent};
use crate::field_solver::FieldSolver;
use crate::loader::PlasmaLoader;
use crate::migrator::{CellMigrator, MigrationReport, wrap_position};
use crate::mirror::DeviceMirror;
use crate::particle::Particle;
use crate::pusher::ParticlePusher;
use crate::validator::{CheckpointValidator, ValidationReport};

/// Outcome of a step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    /// A registered control point was reached and its error exceeds the
    /// tolerance.
    ValidationExceeded,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    /// Steps completed, including this one.
    pub step: u64,
    pub status: StepStatus,
    pub pushed: usize,
    pub migration: MigrationReport,
    pub validation: Option<ValidationReport>,
    pub elapsed: Duration,
}

/// One partition of a PIC run.
///
/// All methods documented as collective must be called by every partition
/// in the same order.
pub struct Simulation<B: ComputeBackend, X: Exchange> {
    domain: SimulationDomain,
    decomposition: Decomposition,
    geometry: GridGeometry,
    grid: CellGrid,
    mirror: DeviceMirror<B>,
    exchange: X,
    solver: FieldSolver,
    pusher: ParticlePusher,
    depositor: CurrentDepositor,
    migrator: CellMigrator,
    validator: CheckpointValidator,
    control_point: Option<(ControlPoint, f64)>,
    step: u64,
}

impl<B: ComputeBackend, X: Exchange> Simulation<B, X> {
    /// Allocate the partition's cells and fields and upload them to `backend`.
    pub fn new(domain: SimulationDomain, decomposition: Decomposition, backend: B, exchange: X) -> Result<Self> {
        domain.check_decomposition(&decomposition)?;
        let geometry = domain.geometry(&decomposition);
        let grid = CellGrid::new(&geometry, &domain.species_ids());
        let mirror = DeviceMirror::new(FieldArrays::zeros(geometry.n), backend)?;
        info!(
            rank = decomposition.rank,
            size = decomposition.size,
            x_offset = decomposition.x_offset,
            nx = decomposition.nx_local,
            "partition initialized"
        );
        Ok(Self {
            solver: FieldSolver::new(&geometry, domain.tau),
            pusher: ParticlePusher::new(&geometry, domain.tau),
            depositor: CurrentDepositor::new(domain.rho_mode),
            migrator: CellMigrator::new(domain.overshoot, domain.max_hops),
            validator: CheckpointValidator::periodic(domain.extents),
            control_point: None,
            step: 0,
            domain,
            decomposition,
            geometry,
            grid,
            mirror,
            exchange,
        })
    }

    pub fn domain(&self) -> &SimulationDomain {
        &self.domain
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.decomposition
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    pub fn exchange(&self) -> &X {
        &self.exchange
    }

    /// Host fields. Current between steps.
    pub fn fields(&self) -> &FieldArrays {
        self.mirror.host()
    }

    /// Mutable host fields, e.g. to impose initial E or H. Call
    /// [`Simulation::refresh_field_ghosts`] afterwards.
    pub fn fields_mut(&mut self) -> Result<&mut FieldArrays> {
        self.mirror.host_mut()
    }

    /// Refill the E and H ghost layers from their periodic images. Collective.
    pub fn refresh_field_ghosts(&mut self) -> Result<()> {
        let fields = self.mirror.host_mut()?;
        fill_components(fields, &FieldComponent::ELECTRIC, &self.exchange)?;
        fill_components(fields, &FieldComponent::MAGNETIC, &self.exchange)
    }

    /// Completed steps.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Insert the particles of `particles` owned by this partition and
    /// redeposit the charge density. Others are skipped, so every partition
    /// may be handed the same list. Collective.
    ///
    /// The whole list is checked before anything is inserted: an unknown
    /// species, or an id repeated in the list or already held by this
    /// partition, is [`PicError::InvalidConfig`].
    pub fn add_particles(&mut self, particles: impl IntoIterator<Item = Particle>) -> Result<usize> {
        let mut ids: HashSet<u64> = self.grid.particles().map(|p| p.id).collect();
        let mut owned = Vec::new();
        for mut p in particles {
            if self.domain.species(p.species).is_none() {
                return Err(PicError::InvalidConfig(format!(
                    "particle {} has unknown species {}",
                    p.id, p.species
                )));
            }
            if !ids.insert(p.id) {
                return Err(PicError::InvalidConfig(format!("duplicate particle id {}", p.id)));
            }
            p.position = wrap_position(&p.position, &self.geometry.extents);
            if self.grid.locate(&self.geometry, &p).is_some() {
                owned.push(p);
            }
        }

        let added = owned.len();
        for p in owned {
            self.grid.insert(&self.geometry, p)?;
        }
        self.grid.compact();
        self.refresh_charge()?;
        Ok(added)
    }

    /// Fill this partition with `loader` and deposit the charge density.
    /// Collective.
    pub fn load_plasma(&mut self, loader: &PlasmaLoader) -> Result<usize> {
        let loaded = loader.load(&self.domain, &self.geometry, &mut self.grid, &self.exchange)?;
        self.refresh_charge()?;
        Ok(loaded)
    }

    fn refresh_charge(&mut self) -> Result<()> {
        let fields = self.mirror.host_mut()?;
        self.depositor
            .initialize_charge(&mut self.grid, fields, &self.domain, &self.geometry, &self.exchange)
    }

    /// Validate against `control_point` once the run reaches its step.
    /// An error above `tolerance` marks that step's status.
    pub fn set_control_point(&mut self, control_point: ControlPoint, tolerance: f64) {
        self.control_point = Some((control_point, tolerance));
    }

    /// Snapshot of the live state.
    pub fn capture(&self) -> ControlPoint {
        ControlPoint::capture(self.step, self.mirror.host(), &self.grid, &self.domain.species_ids())
    }

    /// Compare the live state with `reference`. Never mutates state.
    pub fn validate(&self, reference: &ControlPoint) -> Result<ValidationReport> {
        self.validator.validate(reference, &self.capture())
    }

    /// Global diagnostics. Collective.
    pub fn diagnostics(&self) -> Result<Diagnostics> {
        Diagnostics::gather(self.mirror.host(), &self.grid, &self.domain, &self.geometry, &self.exchange)
    }

    /// Advance one timestep. Collective.
    pub fn step(&mut self) -> Result<StepReport> {
        let step = self.step;
        let span = debug_span!("step", step);
        let _enter = span.enter();
        let start = Instant::now();

        self.solver.first_half_step(&mut self.mirror, &self.exchange, step)?;

        self.mirror.upload()?;
        let pushed = self.pusher.push(&mut self.mirror, &mut self.grid, &self.domain, &self.geometry)?;
        let clamped = self
            .migrator
            .resolve_overshoot(&mut self.grid, &self.geometry, self.domain.tau)?;
        debug!(pushed, clamped, "push done");

        let fields = self.mirror.host_mut()?;
        self.depositor
            .deposit_current(&mut self.grid, fields, &self.domain, &self.geometry, &self.exchange)?;

        let mut migration = self.migrator.migrate(&mut self.grid, &self.geometry, &self.exchange, step)?;
        migration.clamped = clamped;

        let fields = self.mirror.host_mut()?;
        self.depositor
            .deposit_charge(&mut self.grid, fields, &self.domain, &self.geometry, &self.exchange)?;

        self.solver.second_half_step(&mut self.mirror, &self.exchange, step)?;
        self.step += 1;

        let mut status = StepStatus::Completed;
        let mut validation = None;
        if let Some((reference, tolerance)) = &self.control_point {
            if reference.step() == self.step {
                let report = self.validator.validate(reference, &self.capture())?;
                if report.exceeds(*tolerance) {
                    warn!(
                        magnitude = report.magnitude(),
                        worst = report.worst().as_deref().unwrap_or("none"),
                        "control point validation exceeds tolerance"
                    );
                    status = StepStatus::ValidationExceeded;
                }
                validation = Some(report);
            }
        }

        let elapsed = start.elapsed();
        debug!(elapsed_us = elapsed.as_micros() as u64, "step done");
        Ok(StepReport {
            step: self.step,
            status,
            pushed,
            migration,
            validation,
            elapsed,
        })
    }

    /// Run `steps` timesteps, stopping at the first error. Collective.
    pub fn run(&mut self, steps: u64) -> Result<Vec<StepReport>> {
        (0..steps).map(|_| self.step()).collect()
    }

    /// Release the backend and return the final host fields.
    pub fn shutdown(self) -> Result<FieldArrays> {
        info!(steps = self.step, "shutting down partition");
        self.mirror.teardown()
    }
}
