//! Density-based pressure
//!
//! `state` stores a kernel-weighted neighbour count per particle; `apply`
//! reads the densities of both particles of a pair (one of them through
//! another particle's scratch slot) and pushes them apart or together.

use glam::Vec2;

use super::boundary::wgsl_float;
use super::collisions::contact_normal;
use crate::consts::COINCIDENT_EPSILON;
use crate::module::{
    FragmentAccessors, Module, ModuleRole, ParamDecl, ParamKey, ParticleContext, Phase,
    PhaseFault, PhaseSet,
};

pub const DENSITY: &str = "density";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluidParam {
    InfluenceRadius,
    TargetDensity,
    PressureMultiplier,
}

impl ParamKey for FluidParam {
    const DECLS: &'static [ParamDecl] = &[
        ParamDecl::scalar("influence_radius", 20.0),
        ParamDecl::scalar("target_density", 1.0),
        ParamDecl::scalar("pressure_multiplier", 50.0),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Smoothing kernel, 1 at the centre falling to 0 at `h`
#[inline]
pub fn kernel(dist: f32, h: f32) -> f32 {
    if h <= 0.0 || dist >= h {
        return 0.0;
    }
    let q = 1.0 - dist / h;
    q * q
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Fluid;

impl Fluid {
    fn density(&self, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        let h = ctx.param(FluidParam::InfluenceRadius);
        let position = ctx.particle.position;
        let mut density = kernel(0.0, h);
        for j in ctx.neighbors(h) {
            if let Some(other) = ctx.other(j) {
                density += kernel(position.distance(other.position), h);
            }
        }
        ctx.set_state(DENSITY, density)
    }

    fn pressure(&self, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        let inv_mass = ctx.particle.inverse_mass();
        if inv_mass == 0.0 {
            return Ok(());
        }
        let h = ctx.param(FluidParam::InfluenceRadius);
        let target = ctx.param(FluidParam::TargetDensity);
        let multiplier = ctx.param(FluidParam::PressureMultiplier);
        let pressure_me = (ctx.state(DENSITY)? - target) * multiplier;
        let position = ctx.particle.position;

        let mut accel = Vec2::ZERO;
        for j in ctx.neighbors(h) {
            let Some(other) = ctx.other(j) else { continue };
            let delta = position - other.position;
            let dist = delta.length();
            let weight = 1.0 - dist / h;
            if weight <= 0.0 {
                continue;
            }
            let pressure_other = (ctx.state_of(DENSITY, j)? - target) * multiplier;
            let n = contact_normal(delta, dist, ctx.index, j);
            accel += n * (pressure_me + pressure_other) * 0.5 * weight;
        }
        ctx.particle.acceleration += accel * inv_mass;
        Ok(())
    }
}

impl Module for Fluid {
    fn name(&self) -> &'static str {
        "fluid"
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Force(PhaseSet::of(&[Phase::State, Phase::Apply]))
    }

    fn params(&self) -> &'static [ParamDecl] {
        FluidParam::DECLS
    }

    fn state_fields(&self) -> &'static [&'static str] {
        &[DENSITY]
    }

    fn run(&self, phase: Phase, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        match phase {
            Phase::State => self.density(ctx),
            Phase::Apply => self.pressure(ctx),
            _ => Ok(()),
        }
    }

    fn helpers(&self, _acc: &FragmentAccessors<'_>) -> Option<String> {
        Some(
            "fn fluid_kernel(dist: f32, h: f32) -> f32 {\n\
             if (h <= 0.0 || dist >= h) { return 0.0; }\n\
             let q = 1.0 - dist / h;\n\
             return q * q;\n\
             }"
            .to_string(),
        )
    }

    fn fragment(&self, phase: Phase, acc: &FragmentAccessors<'_>) -> Option<String> {
        let h = acc.uniform(FluidParam::InfluenceRadius);
        match phase {
            Phase::State => {
                let body = "density += fluid_kernel(distance(particle.position, other.position), h);";
                Some(format!(
                    "let h = {h};\n\
                     var density = fluid_kernel(0.0, h);\n\
                     {each}\n\
                     {slot} = density;",
                    each = acc.for_each_neighbor("particle.position", "h", body),
                    slot = acc.state(DENSITY),
                ))
            }
            Phase::Apply => {
                let eps = wgsl_float(COINCIDENT_EPSILON);
                let body = format!(
                    "let delta = particle.position - other.position;\n\
                     let dist = length(delta);\n\
                     let weight = 1.0 - dist / h;\n\
                     if (weight > 0.0) {{\n\
                     let pressure_other = ({other_density} - target_density) * multiplier;\n\
                     var n = delta / max(dist, {eps});\n\
                     if (dist <= {eps}) {{\n\
                     if (index < other_index) {{\n\
                     n = jitter_direction(index, other_index);\n\
                     }} else {{\n\
                     n = -jitter_direction(other_index, index);\n\
                     }}\n\
                     }}\n\
                     accel += n * (pressure_me + pressure_other) * 0.5 * weight;\n\
                     }}",
                    other_density = acc.state_of(DENSITY, "other_index"),
                );
                Some(format!(
                    "let inv_mass = inverse_mass(particle);\n\
                     if (inv_mass == 0.0) {{ return; }}\n\
                     let h = {h};\n\
                     let target_density = {target};\n\
                     let multiplier = {multiplier};\n\
                     let pressure_me = ({own_density} - target_density) * multiplier;\n\
                     var accel = vec2<f32>(0.0, 0.0);\n\
                     {each}\n\
                     particle.acceleration += accel * inv_mass;",
                    target = acc.uniform(FluidParam::TargetDensity),
                    multiplier = acc.uniform(FluidParam::PressureMultiplier),
                    own_density = acc.state(DENSITY),
                    each = acc.for_each_neighbor("particle.position", "h", &body),
                ))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_shape() {
        assert_eq!(kernel(0.0, 10.0), 1.0);
        assert!((kernel(5.0, 10.0) - 0.25).abs() < 1e-6);
        assert_eq!(kernel(10.0, 10.0), 0.0);
        assert_eq!(kernel(1.0, 0.0), 0.0);
    }
}
