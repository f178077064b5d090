//! WGSL program builder
//!
//! Turns the registered module list into one compute program: the particle
//! record, builder-internal bindings, one packed uniform block per module,
//! one storage buffer per array parameter, the spatial index routines, one
//! function per `(module, phase)` and one entry point per phase that calls
//! those functions in registration order behind the module's enabled flag.

use std::fmt::Write as _;

use bytemuck::{Pod, Zeroable};

use super::grid::grid_wgsl;
use super::layout::{BindingTable, ModuleLayout, array_var, bindings, uniform_var};
use crate::consts::{COINCIDENT_EPSILON, SLOT_POST_X, SLOT_POST_Y, SLOT_PRE_X, SLOT_PRE_Y};
use crate::module::{FragmentAccessors, Module, ModuleRegistry, Phase};
use crate::modules::boundary::wgsl_float;
use crate::sim::particle::Particle;
use crate::sim::state::StateLayout;
use crate::{KernelError, KernelSettings, Result};

/// Integer hash, identical to [`crate::hash_u32`]
pub const HASH_WGSL: &str = r#"fn hash_u32(value: u32) -> u32 {
    let state = value * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn jitter_direction(a: u32, b: u32) -> vec2<f32> {
    let h = hash_u32((a * 73856093u) ^ (b * 19349663u));
    let angle = f32(h) / 4294967295.0 * 6.2831855;
    return vec2<f32>(cos(angle), sin(angle));
}
"#;

pub const INTEGRATE_ENTRY: &str = "integrate";
pub const CLEAR_GRID_ENTRY: &str = "clear_grid";
pub const BUILD_GRID_ENTRY: &str = "build_grid";

/// Entry point name of a module phase
pub fn phase_entry(phase: Phase) -> String {
    format!("phase_{}", phase.as_str())
}

/// GPU particle record (must match WGSL `Particle`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GpuParticle {
    pub position: [f32; 2],     // offset 0
    pub velocity: [f32; 2],     // offset 8
    pub acceleration: [f32; 2], // offset 16
    pub size: f32,              // offset 24
    pub mass: f32,              // offset 28
    pub color: [f32; 4],        // offset 32, total 48
}

impl From<&Particle> for GpuParticle {
    fn from(p: &Particle) -> Self {
        Self {
            position: p.position.to_array(),
            velocity: p.velocity.to_array(),
            acceleration: p.acceleration.to_array(),
            size: p.size,
            mass: p.mass,
            color: p.color.to_array(),
        }
    }
}

impl GpuParticle {
    /// Write simulated fields back into a host particle (identity is kept)
    pub fn apply_to(&self, p: &mut Particle) {
        p.position = self.position.into();
        p.velocity = self.velocity.into();
        p.acceleration = self.acceleration.into();
        p.size = self.size;
        p.mass = self.mass;
        p.color = self.color.into();
    }
}

/// Simulation-wide uniform (must match WGSL `SimUniforms`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SimUniforms {
    pub dt: f32,
    pub particle_count: u32,
    pub _pad: [u32; 2],
}

/// Generated program plus the layout the host needs to feed it
#[derive(Debug, Clone)]
pub struct ShaderProgram {
    pub source: String,
    pub bindings: BindingTable,
    pub state: StateLayout,
    pub workgroup_size: u32,
    /// Module phase entry points in dispatch order
    pub phase_entries: Vec<(Phase, String)>,
}

impl ShaderProgram {
    pub fn entry(&self, phase: Phase) -> Option<&str> {
        self.phase_entries
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, name)| name.as_str())
    }
}

pub struct ProgramBuilder {
    workgroup_size: u32,
}

impl ProgramBuilder {
    pub fn new(settings: &KernelSettings) -> Self {
        Self {
            workgroup_size: settings.workgroup_size.max(1),
        }
    }

    /// Generate the program for the registry's current module list
    pub fn build(&self, registry: &ModuleRegistry) -> Result<ShaderProgram> {
        let table = registry.binding_table();
        let state = registry.state_layout();
        let modules: Vec<(&dyn Module, &ModuleLayout)> = registry
            .modules()
            .map(|(m, _)| m)
            .zip(&table.modules)
            .collect();

        for (module, _) in &modules {
            validate_identifier(module.name())?;
        }

        let mut src = String::new();
        self.write_header(&mut src, state);
        write_bindings(&mut src, table);
        src.push_str(HASH_WGSL);
        src.push('\n');
        write_common_helpers(&mut src);
        src.push_str(&grid_wgsl(self.workgroup_size));
        src.push('\n');

        let mut errors = Vec::new();
        for (module, layout) in &modules {
            let acc = FragmentAccessors::new(layout, state);
            if let Some(helpers) = module.helpers(&acc) {
                let _ = writeln!(src, "{helpers}\n");
            }
            for phase in module.role().phases().iter() {
                let Some(body) = module.fragment(phase, &acc) else {
                    errors.push(format!("`{}` declares {phase} but emits no fragment", module.name()));
                    continue;
                };
                let _ = writeln!(
                    src,
                    "fn {name}_{phase}(index: u32) {{\n\
                     var particle = particles[index];\n\
                     {body}\n\
                     particles[index] = particle;\n\
                     }}\n",
                    name = module.name(),
                );
            }
            errors.extend(
                acc.take_errors()
                    .into_iter()
                    .map(|e| format!("{}: {e}", module.name())),
            );
        }
        if !errors.is_empty() {
            return Err(KernelError::Shader(errors.join("; ")));
        }

        let mut phase_entries = Vec::new();
        for phase in Phase::ALL {
            let entry = phase_entry(phase);
            self.write_phase_entry(&mut src, &entry, phase, &modules);
            phase_entries.push((phase, entry));
        }
        self.write_integrate(&mut src);

        log::info!(
            "Built compute program: {} modules, {} bindings, state stride {}, {} bytes of WGSL",
            modules.len(),
            table.binding_count(),
            state.stride(),
            src.len()
        );

        Ok(ShaderProgram {
            source: src,
            bindings: table.clone(),
            state: state.clone(),
            workgroup_size: self.workgroup_size,
            phase_entries,
        })
    }

    fn write_header(&self, src: &mut String, state: &StateLayout) {
        let _ = writeln!(
            src,
            "// Generated particle program\n\
             const NEIGHBOR_END: u32 = 0xffffffffu;\n\
             const STATE_STRIDE: u32 = {stride}u;\n\
             \n\
             struct Particle {{\n    \
                 position: vec2<f32>,\n    \
                 velocity: vec2<f32>,\n    \
                 acceleration: vec2<f32>,\n    \
                 size: f32,\n    \
                 mass: f32,\n    \
                 color: vec4<f32>,\n\
             }}\n\
             \n\
             struct SimUniforms {{\n    \
                 dt: f32,\n    \
                 particle_count: u32,\n    \
                 _pad0: u32,\n    \
                 _pad1: u32,\n\
             }}\n",
            stride = state.stride(),
        );
    }

    fn write_phase_entry(
        &self,
        src: &mut String,
        entry: &str,
        phase: Phase,
        modules: &[(&dyn Module, &ModuleLayout)],
    ) {
        let _ = writeln!(
            src,
            "@compute @workgroup_size({wg})\n\
             fn {entry}(@builtin(global_invocation_id) gid: vec3<u32>) {{\n    \
                 let index = gid.x;\n    \
                 if (index >= sim.particle_count) {{ return; }}",
            wg = self.workgroup_size,
        );
        for (module, layout) in modules {
            if !module.role().implements(phase) {
                continue;
            }
            let _ = writeln!(
                src,
                "    if ({enabled} != 0.0 && particles[index].mass != 0.0) {{ {name}_{phase}(index); }}",
                enabled = layout.wgsl_slot(ModuleLayout::ENABLED_SLOT),
                name = module.name(),
            );
        }
        src.push_str("}\n\n");
    }

    fn write_integrate(&self, src: &mut String) {
        let _ = writeln!(
            src,
            "@compute @workgroup_size({wg})\n\
             fn {INTEGRATE_ENTRY}(@builtin(global_invocation_id) gid: vec3<u32>) {{\n    \
                 let index = gid.x;\n    \
                 if (index >= sim.particle_count) {{ return; }}\n    \
                 var p = particles[index];\n    \
                 if (p.mass == 0.0) {{ return; }}\n    \
                 let base = index * STATE_STRIDE;\n    \
                 sim_state[base + {SLOT_PRE_X}u] = p.position.x;\n    \
                 sim_state[base + {SLOT_PRE_Y}u] = p.position.y;\n    \
                 if (p.mass < 0.0) {{\n        \
                     p.velocity = vec2<f32>(0.0, 0.0);\n    \
                 }} else {{\n        \
                     p.velocity += p.acceleration * sim.dt;\n        \
                     p.position += p.velocity * sim.dt;\n    \
                 }}\n    \
                 p.acceleration = vec2<f32>(0.0, 0.0);\n    \
                 sim_state[base + {SLOT_POST_X}u] = p.position.x;\n    \
                 sim_state[base + {SLOT_POST_Y}u] = p.position.y;\n    \
                 particles[index] = p;\n\
             }}",
            wg = self.workgroup_size,
        );
    }
}

fn write_bindings(src: &mut String, table: &BindingTable) {
    let _ = writeln!(
        src,
        "@group(0) @binding({}) var<storage, read_write> particles: array<Particle>;\n\
         @group(0) @binding({}) var<storage, read> particles_prev: array<Particle>;\n\
         @group(0) @binding({}) var<storage, read_write> sim_state: array<f32>;\n\
         @group(0) @binding({}) var<uniform> sim: SimUniforms;\n\
         @group(0) @binding({}) var<uniform> grid: GridConfig;\n\
         @group(0) @binding({}) var<storage, read_write> grid_counts: array<atomic<u32>>;\n\
         @group(0) @binding({}) var<storage, read_write> grid_cells: array<u32>;",
        bindings::PARTICLES,
        bindings::PARTICLES_PREV,
        bindings::SIM_STATE,
        bindings::SIM_UNIFORMS,
        bindings::GRID_CONFIG,
        bindings::GRID_COUNTS,
        bindings::GRID_CELLS,
    );
    for layout in &table.modules {
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<uniform> {}: array<vec4<f32>, {}>;",
            layout.binding,
            uniform_var(&layout.module),
            layout.registers
        );
        for array in &layout.arrays {
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read> {}: array<f32>;",
                array.binding,
                array_var(&layout.module, array.name)
            );
        }
    }
    src.push('\n');
}

fn write_common_helpers(src: &mut String) {
    let eps = wgsl_float(COINCIDENT_EPSILON);
    let _ = writeln!(
        src,
        "fn inverse_mass(p: Particle) -> f32 {{\n    \
             if (p.mass > 0.0) {{ return 1.0 / p.mass; }}\n    \
             return 0.0;\n\
         }}\n\
         \n\
         fn normalize_or(v: vec2<f32>, fallback: vec2<f32>) -> vec2<f32> {{\n    \
             let len = length(v);\n    \
             if (len > {eps}) {{ return v / len; }}\n    \
             return fallback;\n\
         }}\n\
         \n\
         fn bounce(v: vec2<f32>, n: vec2<f32>, restitution: f32, friction: f32) -> vec2<f32> {{\n    \
             let vn = dot(v, n);\n    \
             if (vn <= 0.0) {{ return v; }}\n    \
             let normal = n * vn;\n    \
             let tangent = v - normal;\n    \
             return tangent * (1.0 - friction) - normal * restitution;\n\
         }}\n"
    );
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KernelError::Shader(format!(
            "module name `{name}` is not a valid WGSL identifier"
        )))
    }
}
