//! Particle-particle contact
//!
//! Position projection with restitution impulses on approaching pairs. Each
//! particle moves by its inverse-mass share of the overlap, so pair momentum
//! along the normal is conserved. Exactly coincident pairs separate along a
//! hashed direction both members agree on.

use glam::Vec2;

use super::boundary::wgsl_float;
use crate::consts::COINCIDENT_EPSILON;
use crate::module::{
    FragmentAccessors, Module, ModuleRole, ParamDecl, ParamKey, ParticleContext, Phase,
    PhaseFault, PhaseSet,
};
use crate::jitter_direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionsParam {
    Restitution,
    /// Largest particle size expected; widens the neighbour search
    MaxRadius,
}

impl ParamKey for CollisionsParam {
    const DECLS: &'static [ParamDecl] = &[
        ParamDecl::clamped("restitution", 0.5, 0.0, 1.0),
        ParamDecl::scalar("max_radius", 10.0),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Contact normal pointing from `j` towards `i`
pub fn contact_normal(delta: Vec2, dist: f32, i: u32, j: u32) -> Vec2 {
    if dist > COINCIDENT_EPSILON {
        delta / dist
    } else if i < j {
        jitter_direction(i, j)
    } else {
        -jitter_direction(j, i)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Collisions;

impl Collisions {
    fn constrain(&self, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        let me = *ctx
            .other(ctx.index)
            .ok_or_else(|| PhaseFault::new("particle missing from snapshot"))?;
        let inv_me = me.inverse_mass();
        if inv_me == 0.0 {
            return Ok(());
        }
        let restitution = ctx.param(CollisionsParam::Restitution);
        let radius = me.size + ctx.param(CollisionsParam::MaxRadius);

        let mut shift = Vec2::ZERO;
        let mut impulse = Vec2::ZERO;
        for j in ctx.neighbors_of(me.position, radius) {
            let Some(other) = ctx.other(j) else { continue };
            let target = me.size + other.size;
            let delta = me.position - other.position;
            let dist = delta.length();
            if dist >= target {
                continue;
            }
            let share = inv_me / (inv_me + other.inverse_mass());
            let n = contact_normal(delta, dist, ctx.index, j);
            shift += n * (target - dist) * share;

            let approach = (me.velocity - other.velocity).dot(n);
            if approach < 0.0 {
                impulse -= n * (1.0 + restitution) * approach * share;
            }
        }
        ctx.particle.position += shift;
        ctx.particle.velocity += impulse;
        Ok(())
    }

    fn correct(&self, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        if ctx.particle.is_pinned() {
            return Ok(());
        }
        let moved = ctx.particle.position - ctx.post_position()?;
        let len = moved.length();
        if len <= COINCIDENT_EPSILON {
            return Ok(());
        }
        let n = moved / len;
        let vn = ctx.particle.velocity.dot(n);
        if vn < 0.0 {
            ctx.particle.velocity -= n * vn;
        }
        Ok(())
    }
}

impl Module for Collisions {
    fn name(&self) -> &'static str {
        "collisions"
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Force(PhaseSet::of(&[Phase::Constrain, Phase::Correct]))
    }

    fn params(&self) -> &'static [ParamDecl] {
        CollisionsParam::DECLS
    }

    fn run(&self, phase: Phase, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        match phase {
            Phase::Constrain => self.constrain(ctx),
            Phase::Correct => self.correct(ctx),
            _ => Ok(()),
        }
    }

    fn fragment(&self, phase: Phase, acc: &FragmentAccessors<'_>) -> Option<String> {
        let eps = wgsl_float(COINCIDENT_EPSILON);
        match phase {
            Phase::Constrain => {
                let body = format!(
                    "let target_dist = me.size + other.size;\n\
                     let delta = me.position - other.position;\n\
                     let dist = length(delta);\n\
                     if (dist < target_dist) {{\n\
                     let share = inv_me / (inv_me + inverse_mass(other));\n\
                     var n = delta / max(dist, {eps});\n\
                     if (dist <= {eps}) {{\n\
                     if (index < other_index) {{\n\
                     n = jitter_direction(index, other_index);\n\
                     }} else {{\n\
                     n = -jitter_direction(other_index, index);\n\
                     }}\n\
                     }}\n\
                     shift += n * (target_dist - dist) * share;\n\
                     let approach = dot(me.velocity - other.velocity, n);\n\
                     if (approach < 0.0) {{\n\
                     impulse -= n * (1.0 + restitution) * approach * share;\n\
                     }}\n\
                     }}"
                );
                Some(format!(
                    "let me = {me};\n\
                     let inv_me = inverse_mass(me);\n\
                     if (inv_me == 0.0) {{ return; }}\n\
                     let restitution = {restitution};\n\
                     var shift = vec2<f32>(0.0, 0.0);\n\
                     var impulse = vec2<f32>(0.0, 0.0);\n\
                     {each}\n\
                     particle.position += shift;\n\
                     particle.velocity += impulse;",
                    me = acc.other("index"),
                    restitution = acc.uniform(CollisionsParam::Restitution),
                    each = acc.for_each_neighbor(
                        "me.position",
                        &format!("me.size + {}", acc.uniform(CollisionsParam::MaxRadius)),
                        &body,
                    ),
                ))
            }
            Phase::Correct => Some(format!(
                "if (particle.mass < 0.0) {{ return; }}\n\
                 let moved = particle.position - {post};\n\
                 let len = length(moved);\n\
                 if (len > {eps}) {{\n\
                 let n = moved / len;\n\
                 let vn = dot(particle.velocity, n);\n\
                 if (vn < 0.0) {{\n\
                 particle.velocity -= n * vn;\n\
                 }}\n\
                 }}",
                post = acc.post_position(),
            )),
            _ => None,
        }
    }
}
