//! End-to-end tests of the PIC step on the CPU backend.

use std::collections::HashSet;

use approx::assert_relative_eq;
use phyz_math::Vec3;
use phyz_pic::{
    ChannelExchange, CheckpointValidator, ControlPoint, CpuBackend, CurrentDepositor, Decomposition,
    DomainConfig, Exchange, FieldArrays, FieldComponent, LocalExchange, OvershootPolicy, Particle,
    PicError, PlasmaLoader, RhoMode, Simulation, SimulationDomain, SpeciesConfig, StepStatus,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn species(id: u32, name: &str, charge: f64, mass: f64) -> SpeciesConfig {
    SpeciesConfig {
        id,
        name: name.into(),
        charge,
        mass,
    }
}

fn domain(cells: [usize; 3], extents: [f64; 3], tau: f64, species: Vec<SpeciesConfig>, rho_mode: RhoMode) -> SimulationDomain {
    SimulationDomain::new(DomainConfig {
        cells,
        extents,
        tau,
        n_per_cell: 2,
        species,
        rho_mode,
        overshoot: Default::default(),
        max_hops: 2,
    })
    .unwrap()
}

fn electrons(cells: [usize; 3], tau: f64, rho_mode: RhoMode) -> SimulationDomain {
    let extents = [cells[0] as f64, cells[1] as f64, cells[2] as f64];
    domain(cells, extents, tau, vec![species(0, "electrons", -1.0, 1.0)], rho_mode)
}

fn two_stream(cells: [usize; 3]) -> SimulationDomain {
    let extents = [cells[0] as f64, cells[1] as f64, cells[2] as f64];
    domain(
        cells,
        extents,
        0.2,
        vec![
            species(0, "electrons", -1.0, 1.0),
            species(1, "beam", -1.0, 1.0),
            species(2, "ions", 3.0, 1836.0),
        ],
        RhoMode::Recompute,
    )
}

/// Cells of width 0.25 stepped with tau = 0.5, so a particle at v = 0.9
/// crosses 1.8 cells per step.
fn fast_electrons(cells: [usize; 3], overshoot: OvershootPolicy) -> SimulationDomain {
    SimulationDomain::new(DomainConfig {
        cells,
        extents: [0.25 * cells[0] as f64, 0.25 * cells[1] as f64, 0.25 * cells[2] as f64],
        tau: 0.5,
        n_per_cell: 1,
        species: vec![species(0, "electrons", -1.0, 1.0)],
        rho_mode: RhoMode::Recompute,
        overshoot,
        max_hops: 2,
    })
    .unwrap()
}

fn single(domain: SimulationDomain) -> Simulation<CpuBackend, LocalExchange> {
    let decomposition = Decomposition::single(domain.cells);
    let backend = CpuBackend::new(domain.geometry(&decomposition).n);
    Simulation::new(domain, decomposition, backend, LocalExchange).unwrap()
}

fn cell_of(sim: &Simulation<CpuBackend, LocalExchange>, id: u64) -> usize {
    sim.grid()
        .cells()
        .iter()
        .position(|c| c.species_lists().any(|(_, l)| l.iter().any(|p| p.id == id)))
        .unwrap()
}

fn random_electrons(n: usize, extents: [f64; 3], seed: u64) -> Vec<Particle> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n as u64)
        .map(|id| {
            let x = Vec3::new(
                rng.r#gen::<f64>() * extents[0],
                rng.r#gen::<f64>() * extents[1],
                rng.r#gen::<f64>() * extents[2],
            );
            let v = Vec3::new(
                rng.gen_range(-0.3..0.3),
                rng.gen_range(-0.3..0.3),
                rng.gen_range(-0.3..0.3),
            );
            Particle::with_velocity(id, 0, x, v, 0.5)
        })
        .collect()
}

#[test]
fn test_particle_at_rest_stays_put() {
    let mut sim = single(electrons([4, 4, 4], 0.25, RhoMode::Recompute));
    let centre = Vec3::new(2.0, 2.0, 2.0);
    sim.add_particles([Particle::at_rest(0, 0, centre, 1.0)]).unwrap();
    let before = cell_of(&sim, 0);

    sim.step().unwrap();

    let p = sim.grid().particles().next().unwrap();
    assert_eq!(p.position, centre);
    assert_eq!(p.momentum, Vec3::zeros());
    assert_eq!(cell_of(&sim, 0), before);
}

#[test]
fn test_single_cell_crossing() {
    let mut sim = single(electrons([4, 4, 4], 0.5, RhoMode::Recompute));
    sim.add_particles([Particle::with_velocity(
        0,
        0,
        Vec3::new(1.9, 1.5, 1.5),
        Vec3::new(0.5, 0.0, 0.0),
        1.0,
    )])
    .unwrap();
    let src = sim.grid().linear_index([1, 1, 1]);
    let dst = sim.grid().linear_index([2, 1, 1]);

    let report = sim.step().unwrap();

    assert_eq!(report.migration.moved_local, 1);
    assert_eq!(sim.grid().cell(src).count(), 0);
    assert_eq!(sim.grid().cell(dst).count(), 1);
    let p = sim.grid().particles().next().unwrap();
    assert_relative_eq!(p.position.x, 2.15, epsilon = 1e-12);
}

#[test]
fn test_face_tie_break_is_deterministic() {
    let owner = || {
        let mut sim = single(electrons([4, 4, 4], 0.25, RhoMode::Recompute));
        sim.add_particles([Particle::at_rest(0, 0, Vec3::new(2.0, 1.0, 3.0), 1.0)]).unwrap();
        sim.step().unwrap();
        cell_of(&sim, 0)
    };
    let first = owner();
    let second = owner();
    assert_eq!(first, second);
    let sim = single(electrons([4, 4, 4], 0.25, RhoMode::Recompute));
    assert_eq!(first, sim.grid().linear_index([2, 1, 3]));
}

#[test]
fn test_conservation_and_unique_ownership() {
    let mut sim = single(two_stream([8, 4, 4]));
    let loaded = sim.load_plasma(&PlasmaLoader { seed: 3, ..Default::default() }).unwrap() as u64;

    for _ in 0..5 {
        sim.step().unwrap();
        let grid = sim.grid();
        assert_eq!(grid.particle_count(), loaded);
        let ids: HashSet<u64> = grid.particles().map(|p| p.id).collect();
        assert_eq!(ids.len() as u64, loaded);
        assert_eq!(grid.first_misplaced(sim.geometry()), None);
    }
}

#[test]
fn test_fields_periodic_after_step() {
    let mut sim = single(two_stream([6, 4, 4]));
    sim.load_plasma(&PlasmaLoader {
        electron_temperature: 0.05,
        seed: 9,
        ..Default::default()
    })
    .unwrap();
    sim.run(3).unwrap();

    let [nx, ny, nz] = sim.geometry().n.map(|n| n as isize);
    for c in FieldComponent::ELECTRIC.into_iter().chain(FieldComponent::MAGNETIC) {
        let a = sim.fields().get(c);
        for j in 0..ny {
            for k in 0..nz {
                assert_eq!(a.get(nx, j, k), a.get(0, j, k));
                assert_eq!(a.get(-1, j, k), a.get(nx - 1, j, k));
            }
        }
        for i in 0..nx {
            assert_eq!(a.get(i, ny, 0), a.get(i, 0, 0));
            assert_eq!(a.get(i, 1, -2), a.get(i, 1, nz - 2));
        }
    }
}

#[test]
fn test_zeroing_is_idempotent() {
    let depositor = CurrentDepositor::new(RhoMode::Recompute);
    let mut fields = FieldArrays::zeros([3, 3, 3]);
    for c in FieldComponent::ALL {
        fields.get_mut(c).as_mut_slice().fill(1.25);
    }
    depositor.zero(&mut fields);
    let once = fields.clone();
    depositor.zero(&mut fields);
    assert_eq!(fields, once);
    for c in FieldComponent::CURRENT.into_iter().chain([FieldComponent::Rho]) {
        assert!(fields.get(c).as_slice().iter().all(|&v| v == 0.0));
    }
    assert!(fields.get(FieldComponent::Ex).as_slice().iter().all(|&v| v == 1.25));
}

#[test]
fn test_control_point_of_live_state_validates_to_zero() {
    let mut sim = single(two_stream([4, 4, 4]));
    sim.load_plasma(&PlasmaLoader::default()).unwrap();
    sim.run(2).unwrap();

    let cp = sim.capture();
    let report = sim.validate(&cp).unwrap();
    assert!(report.magnitude() <= f64::EPSILON);

    // An identical run reaching the registered step reports no drift
    let mut replay = single(two_stream([4, 4, 4]));
    replay.load_plasma(&PlasmaLoader::default()).unwrap();
    replay.set_control_point(cp, 1e-12);
    let reports = replay.run(2).unwrap();
    assert!(reports[0].validation.is_none());
    let last = reports[1].validation.as_ref().unwrap();
    assert_eq!(last.magnitude(), 0.0);
    assert_eq!(reports[1].status, StepStatus::Completed);
}

#[test]
fn test_drift_is_reported_not_fatal() {
    let mut sim = single(two_stream([4, 4, 4]));
    sim.load_plasma(&PlasmaLoader::default()).unwrap();
    let mut other = single(two_stream([4, 4, 4]));
    other.load_plasma(&PlasmaLoader { seed: 1, ..Default::default() }).unwrap();
    other.run(1).unwrap();

    sim.set_control_point(other.capture(), 1e-6);
    let report = sim.step().unwrap();
    assert_eq!(report.status, StepStatus::ValidationExceeded);
    assert!(report.validation.unwrap().magnitude() > 1e-6);
}

#[test]
fn test_both_rho_modes_conserve_charge() {
    for mode in [RhoMode::Recompute, RhoMode::Continuity] {
        let mut sim = single(electrons([6, 4, 4], 0.2, mode));
        let particles = random_electrons(200, [6.0, 4.0, 4.0], 11);
        sim.add_particles(particles).unwrap();
        let expected = -0.5 * 200.0;

        let initial = sim.diagnostics().unwrap().total_charge;
        assert_relative_eq!(initial, expected, max_relative = 1e-12);
        for _ in 0..4 {
            sim.step().unwrap();
            let charge = sim.diagnostics().unwrap().total_charge;
            assert_relative_eq!(charge, expected, max_relative = 1e-10);
        }
    }
}

#[test]
fn test_two_partitions_match_one() {
    let domain = two_stream([8, 4, 4]);
    let loader = PlasmaLoader {
        electron_temperature: 0.05,
        beam_velocity: 0.3,
        seed: 5,
        ..Default::default()
    };
    let steps = 4;

    let mut whole = single(domain.clone());
    whole.load_plasma(&loader).unwrap();
    whole.run(steps).unwrap();
    let reference = whole.capture();
    let hx = domain.spacing()[0];

    let parts: Vec<(Decomposition, ControlPoint, u64)> = std::thread::scope(|s| {
        let handles: Vec<_> = ChannelExchange::ring(2)
            .into_iter()
            .map(|exchange| {
                let domain = domain.clone();
                let loader = loader.clone();
                s.spawn(move || {
                    let decomposition = Decomposition::slab(domain.cells, exchange.rank(), 2).unwrap();
                    let backend = CpuBackend::new(domain.geometry(&decomposition).n);
                    let mut sim = Simulation::new(domain, decomposition, backend, exchange).unwrap();
                    sim.load_plasma(&loader).unwrap();
                    let sent: u64 = sim
                        .run(steps)
                        .unwrap()
                        .iter()
                        .map(|r| r.migration.sent as u64)
                        .sum();
                    (decomposition, sim.capture(), sent)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let total_sent: u64 = parts.iter().map(|(_, _, sent)| sent).sum();
    assert!(total_sent > 0, "no particle crossed a partition boundary");
    for (decomposition, live, _) in &parts {
        let slab = reference
            .x_slab(decomposition.x_offset, decomposition.nx_local, hx)
            .unwrap();
        let report = CheckpointValidator::periodic(domain.extents).validate(&slab, live).unwrap();
        assert!(report.magnitude() < 1e-9, "rank {}: {report:?}", decomposition.rank);
        for (_, e) in &report.species {
            assert_eq!(e.missing, 0);
            assert_eq!(e.unexpected, 0);
        }
    }
}

#[test]
fn test_control_point_file_roundtrip() {
    let mut sim = single(two_stream([4, 4, 4]));
    sim.load_plasma(&PlasmaLoader::default()).unwrap();
    sim.step().unwrap();
    let cp = sim.capture();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("step1.ctrl");
    cp.write(&path).unwrap();
    let back = ControlPoint::read(&path).unwrap();
    assert_eq!(back, cp);
    assert_eq!(sim.validate(&back).unwrap().magnitude(), 0.0);

    let bytes = std::fs::read(&path).unwrap();
    let truncated = dir.path().join("truncated.ctrl");
    std::fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(
        ControlPoint::read(&truncated),
        Err(PicError::MalformedControlPoint(_))
    ));
    assert!(matches!(
        ControlPoint::read(dir.path().join("missing.ctrl")),
        Err(PicError::ControlPointIo(_))
    ));

    // A failed read leaves the live state untouched
    assert_eq!(sim.capture(), cp);
}

#[test]
fn test_shutdown_returns_fields() {
    let mut sim = single(two_stream([4, 4, 4]));
    sim.load_plasma(&PlasmaLoader::default()).unwrap();
    sim.step().unwrap();
    let live = sim.fields().clone();
    let fields = sim.shutdown().unwrap();
    assert_eq!(fields, live);
}

#[test]
fn test_overshoot_outcome_does_not_depend_on_start_cell() {
    const POLICIES: [OvershootPolicy; 3] = [OvershootPolicy::Walk, OvershootPolicy::Clamp, OvershootPolicy::Fatal];
    // (start y, v_y, start cell); the last two cross the periodic y faces
    let starts = [(0.70, 0.9, 2isize), (1.90, 0.9, 7), (0.10, -0.9, 0)];

    for policy in POLICIES {
        for &(y, vy, cell) in &starts {
            let mut sim = single(fast_electrons([8, 8, 8], policy));
            sim.add_particles([Particle::with_velocity(
                0,
                0,
                Vec3::new(1.1, y, 1.1),
                Vec3::new(0.0, vy, 0.0),
                1.0,
            )])
            .unwrap();
            let sign = vy.signum() as isize;

            let result = sim.step();
            let expected_y = match policy {
                OvershootPolicy::Walk => cell + 2 * sign,
                OvershootPolicy::Clamp => cell + sign,
                OvershootPolicy::Fatal => {
                    assert!(
                        matches!(result, Err(PicError::BoundaryViolation { particle: 0, hops: 2 })),
                        "start y = {y}: {result:?}"
                    );
                    continue;
                }
            };
            let report = result.unwrap_or_else(|e| panic!("{policy:?} from y = {y}: {e}"));
            assert_eq!(report.migration.clamped, usize::from(policy == OvershootPolicy::Clamp));
            let p = sim.grid().particles().next().unwrap();
            let owner = sim.geometry().global_cell(&p.position);
            assert_eq!(owner, [4, expected_y.rem_euclid(8) as usize, 4], "{policy:?} from y = {y}");
            assert_eq!(sim.grid().first_misplaced(sim.geometry()), None);
            assert_relative_eq!(sim.diagnostics().unwrap().total_charge, -1.0, max_relative = 1e-12);
        }
    }
}

/// Step a two-partition run once; each rank reports the global cells of
/// the particles it owns afterwards.
fn step_partitioned(domain: &SimulationDomain, particles: &[Particle]) -> Vec<Result<Vec<(u64, [usize; 3])>, PicError>> {
    std::thread::scope(|s| {
        let handles: Vec<_> = ChannelExchange::ring(2)
            .into_iter()
            .map(|exchange| {
                let domain = domain.clone();
                let particles = particles.to_vec();
                s.spawn(move || -> Result<Vec<(u64, [usize; 3])>, PicError> {
                    let decomposition = Decomposition::slab(domain.cells, exchange.rank(), 2)?;
                    let backend = CpuBackend::new(domain.geometry(&decomposition).n);
                    let mut sim = Simulation::new(domain, decomposition, backend, exchange)?;
                    sim.add_particles(particles)?;
                    sim.step()?;
                    Ok(sim
                        .grid()
                        .particles()
                        .map(|p| (p.id, sim.geometry().global_cell(&p.position)))
                        .collect())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_overshoot_between_partitions() {
    // id 0 walks from rank 0 into rank 1, id 1 from rank 1 across the
    // periodic x face into rank 0
    let particles = [
        Particle::with_velocity(0, 0, Vec3::new(0.90, 1.1, 1.1), Vec3::new(0.9, 0.0, 0.0), 1.0),
        Particle::with_velocity(1, 0, Vec3::new(1.90, 1.1, 1.1), Vec3::new(0.9, 0.0, 0.0), 1.0),
    ];

    let walk = step_partitioned(&fast_electrons([8, 8, 8], OvershootPolicy::Walk), &particles);
    assert_eq!(walk[0].as_ref().unwrap(), &vec![(1, [1, 4, 4])]);
    assert_eq!(walk[1].as_ref().unwrap(), &vec![(0, [5, 4, 4])]);

    let clamp = step_partitioned(&fast_electrons([8, 8, 8], OvershootPolicy::Clamp), &particles);
    assert_eq!(clamp[0].as_ref().unwrap(), &vec![(1, [0, 4, 4])]);
    assert_eq!(clamp[1].as_ref().unwrap(), &vec![(0, [4, 4, 4])]);

    let fatal = step_partitioned(&fast_electrons([8, 8, 8], OvershootPolicy::Fatal), &particles);
    assert!(matches!(fatal[0], Err(PicError::BoundaryViolation { particle: 0, hops: 2 })));
    assert!(matches!(fatal[1], Err(PicError::BoundaryViolation { particle: 1, hops: 2 })));
}

#[test]
fn test_walk_longer_than_a_slab_is_rejected() {
    let domain = fast_electrons([8, 8, 8], OvershootPolicy::Walk);
    let narrow = Decomposition {
        rank: 0,
        size: 8,
        x_offset: 0,
        nx_local: 1,
    };
    let result = Simulation::new(domain, narrow, CpuBackend::new([1, 8, 8]), LocalExchange);
    assert!(matches!(result, Err(PicError::InvalidConfig(_))));

    let mut config = DomainConfig {
        cells: [8, 8, 8],
        extents: [2.0; 3],
        tau: 0.5,
        n_per_cell: 1,
        species: vec![species(0, "electrons", -1.0, 1.0)],
        rho_mode: RhoMode::Recompute,
        overshoot: OvershootPolicy::Walk,
        max_hops: 3,
    };
    assert!(matches!(SimulationDomain::new(config.clone()), Err(PicError::InvalidConfig(_))));
    config.max_hops = 2;
    assert!(SimulationDomain::new(config).is_ok());
}

#[test]
fn test_rejected_particles_leave_the_grid_untouched() {
    let mut sim = single(electrons([4, 4, 4], 0.25, RhoMode::Recompute));
    sim.add_particles([Particle::at_rest(7, 0, Vec3::new(1.5, 1.5, 1.5), 1.0)]).unwrap();

    let unknown = Particle::at_rest(8, 5, Vec3::new(2.5, 1.5, 1.5), 1.0);
    let fine = Particle::at_rest(9, 0, Vec3::new(0.5, 0.5, 0.5), 1.0);
    let result = sim.add_particles([fine, unknown]);
    assert!(matches!(result, Err(PicError::InvalidConfig(_))));
    assert_eq!(sim.grid().particle_count(), 1);

    let duplicate = Particle::at_rest(7, 0, Vec3::new(3.5, 3.5, 3.5), 1.0);
    assert!(matches!(sim.add_particles([duplicate]), Err(PicError::InvalidConfig(_))));
    let twice = Particle::at_rest(10, 0, Vec3::new(3.5, 3.5, 3.5), 1.0);
    assert!(matches!(sim.add_particles([twice.clone(), twice]), Err(PicError::InvalidConfig(_))));
    assert_eq!(sim.grid().particle_count(), 1);

    // still steps and deposits the one valid particle
    sim.step().unwrap();
    assert_relative_eq!(sim.diagnostics().unwrap().total_charge, -1.0, max_relative = 1e-12);
}
