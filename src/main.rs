//! Particle Kernel entry point
//!
//! Headless demo: spawns a seeded particle cloud, runs the CPU pipeline and
//! logs a step report every second of simulated time. `--wgsl` prints the
//! generated compute program instead.

use std::process::ExitCode;

use clap::Parser;
use glam::{Vec2, Vec4};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use particle_kernel::consts::DEFAULT_DT;
use particle_kernel::gpu::ProgramBuilder;
use particle_kernel::module::ModuleRegistry;
use particle_kernel::modules::{BoundaryParam, EnvironmentParam, JointsParam, default_modules};
use particle_kernel::sim::{Camera, CpuPipeline, ParticleInit, ParticleStore};
use particle_kernel::{KernelSettings, Result};

/// Headless particle kernel demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Steps to simulate
    #[arg(long, default_value_t = 600)]
    steps: u32,

    /// Seed for the spawned cloud
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Particles to spawn
    #[arg(short, long, default_value_t = 500)]
    count: u32,

    /// Settings JSON to load
    #[arg(short, long)]
    settings: Option<String>,

    /// Print the generated compute program and exit
    #[arg(long)]
    wgsl: bool,
}

fn spawn_cloud(store: &mut ParticleStore, count: u32, seed: u64) {
    let mut rng = Pcg32::seed_from_u64(seed);
    for _ in 0..count {
        let position = Vec2::new(rng.random_range(-300.0..300.0), rng.random_range(-200.0..200.0));
        let velocity = Vec2::new(rng.random_range(-40.0..40.0), rng.random_range(-40.0..40.0));
        let hue: f32 = rng.random_range(0.3..1.0);
        store.spawn(ParticleInit {
            position,
            velocity,
            size: rng.random_range(3.0..6.0),
            mass: rng.random_range(0.5..2.0),
            color: Vec4::new(hue, 0.6, 1.0 - hue, 1.0),
        });
    }
}

fn configure(registry: &mut ModuleRegistry, count: u32) -> Result<()> {
    registry.handle("environment")?.set(EnvironmentParam::GravityY, -200.0);
    let mut boundary = registry.handle("boundary")?;
    boundary.set(BoundaryParam::Restitution, 0.6);
    boundary.set(BoundaryParam::MaxY, 300.0);

    // Chain the first few particles together
    let links = count.min(8).saturating_sub(1);
    let a: Vec<f32> = (0..links).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..links).map(|i| (i + 1) as f32).collect();
    let mut joints = registry.handle("joints")?;
    joints.set_array(JointsParam::AIndexes, a);
    joints.set_array(JointsParam::BIndexes, b);
    joints.set_array(JointsParam::RestLengths, vec![12.0; links as usize]);
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let settings = match &args.settings {
        Some(path) => KernelSettings::load(path)?,
        None => KernelSettings::default(),
    };
    let mut registry = ModuleRegistry::with_modules(default_modules())?;
    configure(&mut registry, args.count)?;

    if args.wgsl {
        let program = ProgramBuilder::new(&settings).build(&registry)?;
        println!("{}", program.source);
        return Ok(());
    }

    let mut store = ParticleStore::with_capacity(args.count as usize);
    spawn_cloud(&mut store, args.count, args.seed);
    let mut pipeline = CpuPipeline::new(&settings, Camera::default());

    let report_every = (1.0 / DEFAULT_DT).round() as u32;
    for step in 1..=args.steps {
        let report = pipeline.step(&mut store, &registry, DEFAULT_DT);
        if step % report_every == 0 || step == args.steps {
            log::info!(
                "step {}: {} live, {} removed, {} faults",
                step,
                report.live,
                report.removed,
                report.faults
            );
        }
    }

    let energy: f32 = store
        .particles()
        .iter()
        .filter(|p| !p.is_pinned())
        .map(|p| 0.5 * p.mass * p.velocity.length_squared())
        .sum();
    println!("{} particles after {} steps, kinetic energy {:.1}", store.len(), args.steps, energy);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
