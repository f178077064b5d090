//! CPU phase dispatcher
//!
//! One step runs every phase over the whole live set before moving on:
//! state → apply → integrate → constrain × N → correct, then compaction.
//! Within a phase, modules run in registration order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use glam::Vec2;

use super::particle::{Particle, ParticleStore};
use super::spatial::{Camera, SpatialGrid};
use super::state::StateTable;
use crate::KernelSettings;
use crate::consts::{SLOT_POST_X, SLOT_POST_Y, SLOT_PRE_X, SLOT_PRE_Y};
use crate::module::{ModuleRegistry, ParticleContext, Phase, PhaseFault};

/// Outcome of one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Isolated per-particle module failures
    pub faults: u32,
    /// Particles compacted out at the end of the step
    pub removed: usize,
    /// Particles alive after compaction
    pub live: usize,
}

pub struct CpuPipeline {
    grid: SpatialGrid,
    state: StateTable,
    camera: Camera,
    constrain_iterations: u32,
}

impl CpuPipeline {
    pub fn new(settings: &KernelSettings, camera: Camera) -> Self {
        Self {
            grid: SpatialGrid::new(
                &camera,
                settings.cell_size,
                settings.bounds_padding,
                settings.cpu_grid_cells,
            ),
            state: StateTable::new(0),
            camera,
            constrain_iterations: settings.effective_constrain_iterations(),
        }
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    pub fn set_constrain_iterations(&mut self, iterations: u32) {
        self.constrain_iterations = iterations.max(1);
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    /// Scratch table as left by the last step (rows follow the live array)
    pub fn state_table(&self) -> &StateTable {
        &self.state
    }

    /// Advance the simulation by `dt`
    pub fn step(
        &mut self,
        store: &mut ParticleStore,
        registry: &ModuleRegistry,
        dt: f32,
    ) -> StepReport {
        let mut report = StepReport::default();
        let stride = registry.state_layout().stride();
        if self.state.stride() != stride {
            self.state = StateTable::new(stride);
        }
        self.state.resize(store.len());
        self.grid.track_camera(&self.camera);

        let particles = store.particles_mut();
        self.grid.build(particles);
        self.run_phase(Phase::State, particles, registry, dt, &mut report);
        self.run_phase(Phase::Apply, particles, registry, dt, &mut report);

        self.integrate(particles, dt);

        for _ in 0..self.constrain_iterations {
            self.grid.build(particles);
            self.run_phase(Phase::Constrain, particles, registry, dt, &mut report);
        }

        self.grid.build(particles);
        self.run_phase(Phase::Correct, particles, registry, dt, &mut report);

        let keep: Vec<bool> = particles.iter().map(Particle::is_alive).collect();
        self.state.retain_rows(&keep);
        report.removed = store.compact();
        report.live = store.len();

        log::debug!(
            "CPU step: {} live, {} removed, {} faults",
            report.live,
            report.removed,
            report.faults
        );
        report
    }

    fn run_phase(
        &mut self,
        phase: Phase,
        particles: &mut [Particle],
        registry: &ModuleRegistry,
        dt: f32,
        report: &mut StepReport,
    ) {
        let snapshot = particles.to_vec();
        let layout = registry.state_layout();

        for (module, params) in registry.modules() {
            if !module.role().implements(phase) || !params.enabled() {
                continue;
            }
            let mut first_fault = true;
            for (index, particle) in particles.iter_mut().enumerate() {
                if !particle.is_alive() {
                    continue;
                }
                let mut ctx = ParticleContext::new(
                    module.name(),
                    index as u32,
                    particle,
                    dt,
                    params,
                    &snapshot,
                    &self.grid,
                    layout,
                    &mut self.state,
                );
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| module.run(phase, &mut ctx)));
                let fault = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(fault)) => fault,
                    Err(payload) => PhaseFault::new(panic_message(payload.as_ref())),
                };
                report.faults += 1;
                if first_fault {
                    log::warn!(
                        "Module `{}` failed in {} for particle {}: {}",
                        module.name(),
                        phase,
                        index,
                        fault
                    );
                    first_fault = false;
                }
            }
        }
    }

    /// Semi-implicit Euler, recording pre/post positions for `correct`
    fn integrate(&mut self, particles: &mut [Particle], dt: f32) {
        for (index, p) in particles.iter_mut().enumerate() {
            if !p.is_alive() {
                continue;
            }
            self.state.set(index, SLOT_PRE_X, p.position.x);
            self.state.set(index, SLOT_PRE_Y, p.position.y);
            if p.is_pinned() {
                p.velocity = Vec2::ZERO;
            } else {
                p.velocity += p.acceleration * dt;
                p.position += p.velocity * dt;
            }
            p.acceleration = Vec2::ZERO;
            self.state.set(index, SLOT_POST_X, p.position.x);
            self.state.set(index, SLOT_POST_Y, p.position.y);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::module::{FragmentAccessors, Module, ModuleRole, ParamDecl, PhaseSet};
    use crate::modules::{Boundary, Collisions, Environment, Fluid, Joints};
    use crate::sim::particle::ParticleInit;

    fn pipeline() -> CpuPipeline {
        let settings = KernelSettings {
            constrain_iterations: 1,
            ..Default::default()
        };
        CpuPipeline::new(&settings, Camera::default())
    }

    fn particle(x: f32, y: f32) -> ParticleInit {
        ParticleInit {
            position: Vec2::new(x, y),
            ..Default::default()
        }
    }

    /// Records `(module, phase)` calls and can be told to misbehave
    struct Recorder {
        name: &'static str,
        phases: PhaseSet,
        log: Arc<Mutex<Vec<String>>>,
        fail_index: Option<u32>,
        panic_index: Option<u32>,
        kill_index: Option<u32>,
    }

    impl Recorder {
        fn new(name: &'static str, phases: &[Phase], log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                phases: PhaseSet::of(phases),
                log,
                fail_index: None,
                panic_index: None,
                kill_index: None,
            }
        }
    }

    impl Module for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn role(&self) -> ModuleRole {
            ModuleRole::Force(self.phases)
        }

        fn params(&self) -> &'static [ParamDecl] {
            &[]
        }

        fn state_fields(&self) -> &'static [&'static str] {
            &["seen_accel"]
        }

        fn run(&self, phase: Phase, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.name, phase, ctx.index));
            if Some(ctx.index) == self.panic_index {
                panic!("recorder panic");
            }
            if Some(ctx.index) == self.fail_index {
                return Err(PhaseFault::new("recorder failure"));
            }
            if Some(ctx.index) == self.kill_index {
                ctx.particle.kill();
            }
            match phase {
                Phase::State => {
                    let seen = ctx.particle.acceleration.x;
                    ctx.set_state("seen_accel", seen)
                }
                Phase::Apply => {
                    ctx.particle.acceleration.x += 5.0;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn fragment(&self, _phase: Phase, _acc: &FragmentAccessors<'_>) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_constant_acceleration_one_step() {
        let mut registry = ModuleRegistry::new();
        registry.register(Environment).unwrap();
        registry.set("environment", "gravity_y", -10.0).unwrap();

        let mut store = ParticleStore::new();
        let id = store.spawn(particle(0.0, 0.0));
        let report = pipeline().step(&mut store, &registry, 0.1);

        let p = store.get(id).unwrap();
        assert!((p.velocity - Vec2::new(0.0, -1.0)).length() < 1e-6);
        assert!((p.position - Vec2::new(0.0, -0.1)).length() < 1e-6);
        assert_eq!(p.acceleration, Vec2::ZERO);
        assert_eq!(report.faults, 0);
        assert_eq!(report.live, 1);
    }

    #[test]
    fn test_overlapping_pair_separates_in_one_pass() {
        let mut registry = ModuleRegistry::new();
        registry.register(Collisions).unwrap();

        let mut store = ParticleStore::new();
        let size = 3.0;
        let a = store.spawn(ParticleInit {
            size,
            velocity: Vec2::new(1.0, 0.0),
            ..particle(0.0, 0.0)
        });
        let b = store.spawn(ParticleInit {
            size,
            velocity: Vec2::new(-1.0, 0.0),
            ..particle(5.0, 0.0)
        });
        let momentum_before = Vec2::new(1.0, 0.0) + Vec2::new(-1.0, 0.0);

        pipeline().step(&mut store, &registry, 0.01);

        let (pa, pb) = (*store.get(a).unwrap(), *store.get(b).unwrap());
        assert!(pa.position.distance(pb.position) >= 2.0 * size - 1e-4);
        let momentum_after = pa.velocity * pa.mass + pb.velocity * pb.mass;
        assert!((momentum_after - momentum_before).length() < 1e-5);
        // Approach speed reversed and scaled by restitution (0.5)
        let relative = (pb.velocity - pa.velocity).x;
        assert!((relative - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_coincident_pair_separates() {
        let mut registry = ModuleRegistry::new();
        registry.register(Collisions).unwrap();
        let mut store = ParticleStore::new();
        store.spawn(particle(10.0, 10.0));
        store.spawn(particle(10.0, 10.0));

        pipeline().step(&mut store, &registry, 0.0);

        let ps = store.particles();
        assert!(ps[0].position.distance(ps[1].position) >= 10.0 - 1e-4);
    }

    #[test]
    fn test_pinned_particle_does_not_move() {
        let mut registry = ModuleRegistry::new();
        registry.register(Environment).unwrap();
        registry.register(Collisions).unwrap();
        registry.set("environment", "gravity_y", -10.0).unwrap();

        let mut store = ParticleStore::new();
        let pinned = store.spawn(ParticleInit {
            mass: -1.0,
            ..particle(0.0, 0.0)
        });
        store.spawn(particle(4.0, 0.0));
        pipeline().step(&mut store, &registry, 0.1);

        let p = store.get(pinned).unwrap();
        assert_eq!(p.position, Vec2::ZERO);
        assert_eq!(p.velocity, Vec2::ZERO);
        // The free particle takes the whole correction
        assert!(store.particles()[1].position.length() >= 10.0 - 1e-4);
    }

    #[test]
    fn test_state_runs_before_apply() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ModuleRegistry::new();
        registry.register(Environment).unwrap();
        registry.set("environment", "gravity_x", 3.0).unwrap();
        registry
            .register(Recorder::new("recorder", &[Phase::State, Phase::Apply], log.clone()))
            .unwrap();

        let mut store = ParticleStore::new();
        store.spawn(particle(0.0, 0.0));
        store.spawn(particle(100.0, 0.0));
        let mut pipeline = pipeline();
        pipeline.step(&mut store, &registry, 0.1);
        pipeline.step(&mut store, &registry, 0.1);

        let slot = registry.state_layout().slot("recorder", "seen_accel").unwrap();
        for row in 0..store.len() {
            assert_eq!(pipeline.state_table().get(row, slot), Some(0.0));
        }
    }

    #[test]
    fn test_modules_run_in_registration_order_per_phase() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let phases = [Phase::State, Phase::Apply, Phase::Constrain, Phase::Correct];
        let mut registry = ModuleRegistry::new();
        registry.register(Recorder::new("first", &phases, log.clone())).unwrap();
        registry.register(Recorder::new("second", &phases, log.clone())).unwrap();

        let mut store = ParticleStore::new();
        store.spawn(particle(0.0, 0.0));
        pipeline().step(&mut store, &registry, 0.1);

        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "first:state:0",
                "second:state:0",
                "first:apply:0",
                "second:apply:0",
                "first:constrain:0",
                "second:constrain:0",
                "first:correct:0",
                "second:correct:0",
            ]
        );
    }

    #[test]
    fn test_failures_are_isolated_per_particle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = Recorder::new("flaky", &[Phase::Apply], log.clone());
        recorder.fail_index = Some(0);
        recorder.panic_index = Some(1);

        let mut registry = ModuleRegistry::new();
        registry.register(recorder).unwrap();
        registry.register(Environment).unwrap();
        registry.set("environment", "gravity_y", -10.0).unwrap();

        let mut store = ParticleStore::new();
        for i in 0..3 {
            store.spawn(particle(i as f32 * 100.0, 0.0));
        }
        let report = pipeline().step(&mut store, &registry, 0.1);

        assert_eq!(report.faults, 2);
        assert_eq!(log.lock().unwrap().len(), 3);
        for p in store.particles() {
            assert!((p.velocity.y + 1.0).abs() < 1e-6);
        }
        // Only the healthy particle got the recorder's push
        assert!(store.particles()[2].velocity.x > 0.0);
        assert_eq!(store.particles()[0].velocity.x, 0.0);
    }

    #[test]
    fn test_killed_particle_is_compacted_and_id_not_reused() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = Recorder::new("reaper", &[Phase::Constrain], log);
        recorder.kill_index = Some(1);
        let mut registry = ModuleRegistry::new();
        registry.register(recorder).unwrap();

        let mut store = ParticleStore::new();
        let ids: Vec<_> = (0..3).map(|i| store.spawn(particle(i as f32, 0.0))).collect();
        let mut pipeline = pipeline();
        let report = pipeline.step(&mut store, &registry, 0.1);

        assert_eq!(report.removed, 1);
        assert!(store.get(ids[1]).is_none());
        assert!(store.particles().iter().all(|p| p.id != ids[1]));

        let fresh = store.spawn(particle(1.0, 0.0));
        assert!(!ids.contains(&fresh));

        // The next step's index never returns the removed particle
        registry.set_enabled("reaper", false).unwrap();
        pipeline.step(&mut store, &registry, 0.1);
        let found = pipeline.grid().query(Vec2::new(1.0, 0.0), 5.0, None);
        let found_ids: Vec<_> = found
            .iter()
            .map(|&i| store.particles()[i as usize].id)
            .collect();
        assert!(!found_ids.contains(&ids[1]));
    }

    #[test]
    fn test_disabled_module_is_skipped() {
        let mut registry = ModuleRegistry::new();
        registry.register(Environment).unwrap();
        registry.set("environment", "gravity_y", -10.0).unwrap();
        registry.set_enabled("environment", false).unwrap();

        let mut store = ParticleStore::new();
        store.spawn(particle(0.0, 0.0));
        pipeline().step(&mut store, &registry, 0.1);
        assert_eq!(store.particles()[0].velocity, Vec2::ZERO);
    }

    #[test]
    fn test_fluid_density_counts_neighbours() {
        let mut registry = ModuleRegistry::new();
        registry.register(Fluid).unwrap();
        registry.set("fluid", "pressure_multiplier", 0.0).unwrap();

        let mut store = ParticleStore::new();
        store.spawn(particle(0.0, 0.0));
        store.spawn(particle(10.0, 0.0));
        store.spawn(particle(500.0, 0.0));
        let mut pipeline = pipeline();
        pipeline.step(&mut store, &registry, 0.1);

        let slot = registry.state_layout().slot("fluid", "density").unwrap();
        let table = pipeline.state_table();
        // h = 20: self weight 1, neighbour at half radius 0.25
        assert!((table.get(0, slot).unwrap() - 1.25).abs() < 1e-5);
        assert!((table.get(2, slot).unwrap() - 1.0).abs() < 1e-5);
    }

    fn joint_pair(stiffness: f32) -> (ModuleRegistry, ParticleStore) {
        let mut registry = ModuleRegistry::new();
        registry.register(Joints).unwrap();
        registry.set("joints", "stiffness", stiffness).unwrap();
        registry.set_array("joints", "a_indexes", vec![0.0]).unwrap();
        registry.set_array("joints", "b_indexes", vec![1.0]).unwrap();
        registry.set_array("joints", "rest_lengths", vec![10.0]).unwrap();

        let mut store = ParticleStore::new();
        store.spawn(particle(0.0, 0.0));
        store.spawn(particle(20.0, 0.0));
        (registry, store)
    }

    fn pair_distance(store: &ParticleStore) -> f32 {
        let ps = store.particles();
        ps[0].position.distance(ps[1].position)
    }

    #[test]
    fn test_wall_stops_particle_and_reflects_velocity() {
        let mut registry = ModuleRegistry::new();
        registry.register(Boundary).unwrap();
        registry.set("boundary", "restitution", 0.5).unwrap();

        let mut store = ParticleStore::new();
        let id = store.spawn(ParticleInit {
            size: 1.0,
            velocity: Vec2::new(0.0, -100.0),
            ..particle(0.0, -495.0)
        });
        let report = pipeline().step(&mut store, &registry, 0.1);

        let p = store.get(id).unwrap();
        // Integration carried it to -505, the wall holds it at min_y + size
        assert!((p.position.y + 499.0).abs() < 1e-4);
        assert!((p.velocity - Vec2::new(0.0, 50.0)).length() < 1e-4);
        assert_eq!(report.faults, 0);
    }

    #[test]
    fn test_joint_pair_reaches_rest_length() {
        let (registry, mut store) = joint_pair(1.0);
        pipeline().step(&mut store, &registry, 0.1);

        assert!((pair_distance(&store) - 10.0).abs() < 1e-4);
        // Correct folds the constraint displacement back into velocity
        let ps = store.particles();
        assert!((ps[0].velocity - Vec2::new(50.0, 0.0)).length() < 1e-3);
        assert!((ps[1].velocity - Vec2::new(-50.0, 0.0)).length() < 1e-3);
    }

    #[test]
    fn test_more_constrain_iterations_converge_further() {
        let (registry, mut once) = joint_pair(0.5);
        pipeline().step(&mut once, &registry, 0.0);

        let (_, mut twice) = joint_pair(0.5);
        let mut two_pass = pipeline();
        two_pass.set_constrain_iterations(2);
        two_pass.step(&mut twice, &registry, 0.0);

        // Each pass halves the stretch past the rest length
        assert!((pair_distance(&once) - 15.0).abs() < 1e-4);
        assert!((pair_distance(&twice) - 12.5).abs() < 1e-4);
    }
}
