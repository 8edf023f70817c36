//! Two-stream instability on X slab partitions.
//!
//! A cold beam streams through a drifting thermal electron background over
//! immobile ions. Each partition runs on its own thread and exchanges
//! ghost planes and particles with its neighbours over channels.
//!
//! Usage: `two_stream [ranks] [steps] [domain.json] [out.ctrl]`

use phyz_pic::{
    ChannelExchange, ConservationMonitor, ConservationState, CpuBackend, Decomposition,
    DomainConfig, Exchange, PlasmaLoader, Simulation, SimulationDomain, SpeciesConfig,
};

fn default_domain() -> SimulationDomain {
    let species = |id, name: &str, charge, mass| SpeciesConfig {
        id,
        name: name.into(),
        charge,
        mass,
    };
    SimulationDomain::new(DomainConfig {
        cells: [32, 8, 8],
        extents: [32.0, 8.0, 8.0],
        tau: 0.25,
        n_per_cell: 4,
        species: vec![
            species(0, "electrons", -1.0, 1.0),
            species(1, "beam", -1.0, 1.0),
            species(2, "ions", 3.0, 1836.0),
        ],
        rho_mode: Default::default(),
        overshoot: Default::default(),
        max_hops: 2,
    })
    .expect("default domain is valid")
}

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let ranks: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(2);
    let steps: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(100);
    let domain = match args.get(3) {
        Some(path) => SimulationDomain::from_json_file(path).expect("failed to read domain"),
        None => default_domain(),
    };
    let output = args.get(4).cloned();

    println!("Two-stream instability");
    println!("======================");
    println!("Grid: {:?}, ranks: {}", domain.cells, ranks);
    println!("tau = {}, Courant limit = {:.4}", domain.tau, domain.courant_limit());
    println!();

    let loader = PlasmaLoader {
        beam_velocity: 0.2,
        electron_temperature: 0.01,
        ..Default::default()
    };
    let print_every = (steps / 10).max(1);

    std::thread::scope(|s| {
        for exchange in ChannelExchange::ring(ranks) {
            let domain = domain.clone();
            let loader = loader.clone();
            let output = output.clone();
            s.spawn(move || {
                let rank = exchange.rank();
                let decomposition = Decomposition::slab(domain.cells, rank, ranks).expect("bad decomposition");
                let backend = CpuBackend::new(domain.geometry(&decomposition).n);
                let mut sim = Simulation::new(domain, decomposition, backend, exchange).expect("setup failed");
                sim.load_plasma(&loader).expect("load failed");

                let baseline = ConservationState::new(&sim.diagnostics().expect("diagnostics failed"));
                for _ in 0..steps {
                    let report = sim.step().expect("step failed");
                    if report.step % print_every == 0 {
                        let diag = sim.diagnostics().expect("diagnostics failed");
                        let monitor = ConservationMonitor::check(&baseline, &diag);
                        if rank == 0 {
                            println!(
                                "Step {:5}: W_field = {:.6e}, W_kin = {:.6e}, dE/E = {:+.3e}, particles = {}",
                                report.step,
                                diag.field_energy,
                                diag.kinetic_energy,
                                monitor.energy_error,
                                diag.particle_count()
                            );
                        }
                    }
                }

                if let Some(path) = output {
                    let path = format!("{path}.rank{rank}");
                    sim.capture().write(&path).expect("failed to write control point");
                    println!("rank {rank}: control point written to {path}");
                }
                sim.shutdown().expect("shutdown failed");
            });
        }
    });
}
