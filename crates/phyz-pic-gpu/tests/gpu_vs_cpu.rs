//! Tests comparing the GPU backend against the CPU backend.
//!
//! Every test returns early when no adapter is available.

use approx::assert_relative_eq;
use phyz_pic::{
    BatchSegment, CheckpointValidator, ComputeBackend, CpuBackend, Decomposition, DomainConfig,
    FieldArrays, FieldCoefficients, FieldComponent, LocalExchange, NodeRange, PackedParticle,
    ParticleBatch, PlasmaLoader, PushParams, Simulation, SimulationDomain, SpeciesConfig,
};
use phyz_pic_gpu::GpuBackend;

fn gpu(n: [usize; 3]) -> Option<GpuBackend> {
    match GpuBackend::new(n) {
        Ok(backend) => Some(backend),
        Err(e) => {
            eprintln!("skipping GPU test: {e}");
            None
        }
    }
}

/// Smooth non-trivial values everywhere, ghosts included.
fn make_fields(n: [usize; 3]) -> FieldArrays {
    let mut fields = FieldArrays::zeros(n);
    for c in FieldComponent::ALL {
        let phase = c.index() as f64;
        for (i, v) in fields.get_mut(c).as_mut_slice().iter_mut().enumerate() {
            *v = 0.1 * (0.37 * i as f64 + phase).sin();
        }
    }
    fields
}

fn assert_arrays_close(a: &FieldArrays, b: &FieldArrays, components: &[FieldComponent]) {
    for &c in components {
        for [i, j, k] in NodeRange::interior(a.dims()).iter() {
            assert_relative_eq!(a.get(c).get(i, j, k), b.get(c).get(i, j, k), epsilon = 1e-5);
        }
    }
}

#[test]
fn test_gpu_stencils_vs_cpu() {
    let n = [6, 5, 4];
    let Some(mut gpu) = gpu(n) else { return };
    let mut cpu = CpuBackend::new(n);
    let fields = make_fields(n);
    let coeffs = FieldCoefficients::new(0.3, [1.0, 0.8, 1.25]);

    for backend in [&mut cpu as &mut dyn ComputeBackend, &mut gpu] {
        backend.upload_fields(&fields).unwrap();
        backend
            .advance_magnetic(&coeffs, 0.5, NodeRange::with_low_ghosts(n, 1))
            .unwrap();
        backend.advance_electric(&coeffs, NodeRange::interior(n)).unwrap();
    }

    let mut from_cpu = FieldArrays::zeros(n);
    let mut from_gpu = FieldArrays::zeros(n);
    cpu.download_fields(&mut from_cpu).unwrap();
    gpu.download_fields(&mut from_gpu).unwrap();
    assert_arrays_close(&from_cpu, &from_gpu, &FieldComponent::ALL);
}

#[test]
fn test_gpu_push_vs_cpu() {
    let n = [4, 4, 4];
    let Some(mut gpu) = gpu(n) else { return };
    let mut cpu = CpuBackend::new(n);
    let fields = make_fields(n);
    cpu.upload_fields(&fields).unwrap();
    gpu.upload_fields(&fields).unwrap();

    let params = PushParams {
        tau: 0.2,
        h: [1.0; 3],
        cells: n,
    };
    let mut particles = Vec::new();
    let mut segments = Vec::new();
    for cell in 0..64 {
        let [i, j, k] = params.cell_coords(cell);
        let start = particles.len();
        for s in 0..3 {
            let f = 0.2 + 0.3 * s as f64;
            particles.push(PackedParticle {
                position: [i as f64 + f, j as f64 + 0.5, k as f64 + 1.0 - f],
                momentum: [0.1 * f, -0.2, 0.05],
                q_m: if s == 2 { 1.0 / 1836.0 } else { -1.0 },
            });
        }
        segments.push(BatchSegment {
            cell,
            range: start..particles.len(),
        });
    }
    let mut on_cpu = ParticleBatch { particles, segments };
    let mut on_gpu = on_cpu.clone();

    cpu.push_particles(&mut on_cpu, &params).unwrap();
    gpu.push_particles(&mut on_gpu, &params).unwrap();

    for (a, b) in on_cpu.particles.iter().zip(&on_gpu.particles) {
        for axis in 0..3 {
            assert_relative_eq!(a.position[axis], b.position[axis], epsilon = 1e-5);
            assert_relative_eq!(a.momentum[axis], b.momentum[axis], epsilon = 1e-5);
        }
    }
}

#[test]
fn test_gpu_particle_at_rest_is_exact() {
    let n = [4, 4, 4];
    let Some(mut gpu) = gpu(n) else { return };
    gpu.upload_fields(&FieldArrays::zeros(n)).unwrap();
    let particle = PackedParticle {
        position: [1.1234567890123, 2.5, 3.75],
        momentum: [0.0; 3],
        q_m: -1.0,
    };
    let mut batch = ParticleBatch {
        particles: vec![particle],
        segments: vec![BatchSegment { cell: 0, range: 0..1 }],
    };
    let params = PushParams {
        tau: 0.1,
        h: [1.0; 3],
        cells: n,
    };
    gpu.push_particles(&mut batch, &params).unwrap();
    assert_eq!(batch.particles[0], particle);
}

fn two_stream(cells: [usize; 3]) -> SimulationDomain {
    let species = |id, name: &str, charge, mass| SpeciesConfig {
        id,
        name: name.into(),
        charge,
        mass,
    };
    SimulationDomain::new(DomainConfig {
        cells,
        extents: [cells[0] as f64, cells[1] as f64, cells[2] as f64],
        tau: 0.2,
        n_per_cell: 2,
        species: vec![
            species(0, "electrons", -1.0, 1.0),
            species(1, "beam", -1.0, 1.0),
            species(2, "ions", 3.0, 1836.0),
        ],
        rho_mode: Default::default(),
        overshoot: Default::default(),
        max_hops: 2,
    })
    .unwrap()
}

#[test]
fn test_gpu_simulation_tracks_cpu() {
    let domain = two_stream([8, 4, 4]);
    let decomposition = Decomposition::single(domain.cells);
    let n = domain.geometry(&decomposition).n;
    let Some(gpu) = gpu(n) else { return };
    let loader = PlasmaLoader {
        electron_temperature: 0.05,
        ..Default::default()
    };

    let mut on_gpu = Simulation::new(domain.clone(), decomposition, gpu, LocalExchange).unwrap();
    let mut on_cpu = Simulation::new(domain, decomposition, CpuBackend::new(n), LocalExchange).unwrap();
    on_gpu.load_plasma(&loader).unwrap();
    on_cpu.load_plasma(&loader).unwrap();
    on_gpu.run(3).unwrap();
    on_cpu.run(3).unwrap();

    let report = CheckpointValidator::periodic(on_cpu.domain().extents)
        .validate(&on_cpu.capture(), &on_gpu.capture())
        .unwrap();
    for (_, e) in &report.species {
        assert!(e.position.max_abs < 1e-4, "{report:?}");
        assert_eq!(e.missing, 0);
    }
    on_gpu.shutdown().unwrap();
}
