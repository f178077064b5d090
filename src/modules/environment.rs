//! Global acceleration and velocity damping

use glam::Vec2;

use crate::module::{
    FragmentAccessors, Module, ModuleRole, ParamDecl, ParamKey, ParticleContext, Phase,
    PhaseFault, PhaseSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentParam {
    GravityX,
    GravityY,
    /// Fraction of velocity kept per step (1 = no damping)
    Momentum,
}

impl ParamKey for EnvironmentParam {
    const DECLS: &'static [ParamDecl] = &[
        ParamDecl::scalar("gravity_x", 0.0),
        ParamDecl::scalar("gravity_y", 0.0),
        ParamDecl::clamped("momentum", 1.0, 0.0, 1.0),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Environment;

impl Module for Environment {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Force(PhaseSet::of(&[Phase::Apply]))
    }

    fn params(&self) -> &'static [ParamDecl] {
        EnvironmentParam::DECLS
    }

    fn run(&self, phase: Phase, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        if phase != Phase::Apply {
            return Ok(());
        }
        let gravity = Vec2::new(
            ctx.param(EnvironmentParam::GravityX),
            ctx.param(EnvironmentParam::GravityY),
        );
        let momentum = ctx.param(EnvironmentParam::Momentum);
        // Damping as an acceleration that removes (1 - momentum) of v over one step
        let drag = if ctx.dt > 0.0 {
            -(1.0 - momentum) * ctx.particle.velocity / ctx.dt
        } else {
            Vec2::ZERO
        };
        ctx.particle.acceleration += gravity + drag;
        Ok(())
    }

    fn fragment(&self, phase: Phase, acc: &FragmentAccessors<'_>) -> Option<String> {
        if phase != Phase::Apply {
            return None;
        }
        Some(format!(
            "let gravity = vec2<f32>({gx}, {gy});\n\
             let momentum = {momentum};\n\
             var drag = vec2<f32>(0.0, 0.0);\n\
             if ({dt} > 0.0) {{\n\
             drag = -(1.0 - momentum) * particle.velocity / {dt};\n\
             }}\n\
             particle.acceleration += gravity + drag;",
            gx = acc.uniform(EnvironmentParam::GravityX),
            gy = acc.uniform(EnvironmentParam::GravityY),
            momentum = acc.uniform(EnvironmentParam::Momentum),
            dt = acc.dt(),
        ))
    }
}
