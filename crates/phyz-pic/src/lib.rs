//! Three-dimensional electromagnetic particle-in-cell plasma kernel.
//!
//! Advances a kinetic plasma by alternating a staggered-grid (Yee) Maxwell
//! solver with a relativistic Boris push of charged macro-particles:
//! - Field half-steps with periodic ghost layers
//! - Particle push through a selectable [`ComputeBackend`]
//! - Deterministic current and charge deposition
//! - Cell migration with hand-off between X slab partitions
//! - Binary control points and numerical validation against them
//!
//! # Example
//!
//! ```
//! use phyz_pic::{
//!     CpuBackend, Decomposition, DomainConfig, LocalExchange, Particle, Simulation,
//!     SimulationDomain, SpeciesConfig,
//! };
//! use phyz_math::Vec3;
//!
//! let domain = SimulationDomain::new(DomainConfig {
//!     cells: [4, 4, 4],
//!     extents: [1.0, 1.0, 1.0],
//!     tau: 0.1,
//!     n_per_cell: 1,
//!     species: vec![SpeciesConfig { id: 0, name: "electrons".into(), charge: -1.0, mass: 1.0 }],
//!     rho_mode: Default::default(),
//!     overshoot: Default::default(),
//!     max_hops: 2,
//! })
//! .unwrap();
//!
//! let decomposition = Decomposition::single(domain.cells);
//! let backend = CpuBackend::new(domain.geometry(&decomposition).n);
//! let mut sim = Simulation::new(domain, decomposition, backend, LocalExchange).unwrap();
//! sim.add_particles([Particle::at_rest(0, 0, Vec3::new(0.5, 0.5, 0.5), 1.0)]).unwrap();
//!
//! let report = sim.step().unwrap();
//! assert_eq!(report.step, 1);
//! ```

pub mod backend;
pub mod boundary;
pub mod cell;
pub mod control_point;
pub mod depositor;
pub mod diagnostics;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod field;
pub mod field_solver;
pub mod loader;
pub mod migrator;
pub mod mirror;
pub mod particle;
pub mod pusher;
pub mod simulation;
pub mod validator;

pub use backend::{BatchSegment, ComputeBackend, CpuBackend, PackedParticle, ParticleBatch, PushParams};
pub use cell::{Cell, CellGrid, Neighbor};
pub use control_point::{ControlPoint, SpeciesSnapshot};
pub use depositor::CurrentDepositor;
pub use diagnostics::{ConservationMonitor, ConservationState, Diagnostics};
pub use domain::{
    DomainConfig, GridGeometry, MAX_HOPS, OvershootPolicy, RhoMode, SimulationDomain, Species, SpeciesConfig,
    SpeciesId,
};
pub use error::{PicError, Result};
pub use exchange::{ChannelExchange, Decomposition, Exchange, LocalExchange, Side};
pub use field::{Array3D, FieldArrays, FieldComponent, GHOST, NodeRange};
pub use field_solver::{FieldCoefficients, FieldSolver, Stencil};
pub use loader::{LoadProfile, PlasmaLoader};
pub use migrator::{CellMigrator, MigrationReport};
pub use mirror::{DeviceMirror, Residency};
pub use particle::Particle;
pub use pusher::ParticlePusher;
pub use simulation::{Simulation, StepReport, StepStatus};
pub use validator::{ArrayError, CheckpointValidator, SpeciesError, ValidationReport};
