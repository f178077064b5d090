//! Distance joints between particle pairs
//!
//! Joint `k` links live-array indices `a_indexes[k]` and `b_indexes[k]` at
//! `rest_lengths[k]`. Indices address the live array of the current step, so
//! callers rewrite them after particles are removed.

use glam::Vec2;

use super::boundary::wgsl_float;
use super::collisions::contact_normal;
use crate::consts::COINCIDENT_EPSILON;
use crate::module::{
    FragmentAccessors, Module, ModuleRole, ParamDecl, ParamKey, ParticleContext, Phase,
    PhaseFault, PhaseSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointsParam {
    Stiffness,
    /// Share of the constraint displacement folded back into velocity
    Momentum,
    AIndexes,
    BIndexes,
    RestLengths,
}

impl ParamKey for JointsParam {
    const DECLS: &'static [ParamDecl] = &[
        ParamDecl::clamped("stiffness", 1.0, 0.0, 1.0),
        ParamDecl::clamped("momentum", 1.0, 0.0, 1.0),
        ParamDecl::array("a_indexes"),
        ParamDecl::array("b_indexes"),
        ParamDecl::array("rest_lengths"),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// The other end of joint `k` if `index` is one of its ends
fn partner(a: &[f32], b: &[f32], k: usize, index: u32) -> Option<u32> {
    let (ja, jb) = (a[k], b[k]);
    if ja < 0.0 || jb < 0.0 {
        return None;
    }
    let (ja, jb) = (ja as u32, jb as u32);
    if ja == index && jb != index {
        Some(jb)
    } else if jb == index && ja != index {
        Some(ja)
    } else {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Joints;

impl Joints {
    fn constrain(&self, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        let me = *ctx
            .other(ctx.index)
            .ok_or_else(|| PhaseFault::new("particle missing from snapshot"))?;
        let inv_me = me.inverse_mass();
        if inv_me == 0.0 {
            return Ok(());
        }
        let stiffness = ctx.param(JointsParam::Stiffness);
        let a = ctx.array(JointsParam::AIndexes);
        let b = ctx.array(JointsParam::BIndexes);
        let rest = ctx.array(JointsParam::RestLengths);
        let count = a.len().min(b.len()).min(rest.len());

        let mut shift = Vec2::ZERO;
        for k in 0..count {
            let Some(j) = partner(a, b, k, ctx.index) else { continue };
            let Some(other) = ctx.other(j) else { continue };
            if !other.is_alive() {
                continue;
            }
            let share = inv_me / (inv_me + other.inverse_mass());
            let delta = me.position - other.position;
            let dist = delta.length();
            let n = contact_normal(delta, dist, ctx.index, j);
            shift -= n * (dist - rest[k]) * share * stiffness;
        }
        ctx.particle.position += shift;
        Ok(())
    }

    fn correct(&self, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        if ctx.particle.is_pinned() || ctx.dt <= 0.0 {
            return Ok(());
        }
        let a = ctx.array(JointsParam::AIndexes);
        let b = ctx.array(JointsParam::BIndexes);
        let count = a.len().min(b.len());
        let jointed = (0..count).any(|k| partner(a, b, k, ctx.index).is_some());
        if !jointed {
            return Ok(());
        }
        let moved = ctx.particle.position - ctx.post_position()?;
        let momentum = ctx.param(JointsParam::Momentum);
        ctx.particle.velocity += moved / ctx.dt * momentum;
        Ok(())
    }
}

impl Module for Joints {
    fn name(&self) -> &'static str {
        "joints"
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Force(PhaseSet::of(&[Phase::Constrain, Phase::Correct]))
    }

    fn params(&self) -> &'static [ParamDecl] {
        JointsParam::DECLS
    }

    fn run(&self, phase: Phase, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        match phase {
            Phase::Constrain => self.constrain(ctx),
            Phase::Correct => self.correct(ctx),
            _ => Ok(()),
        }
    }

    fn helpers(&self, acc: &FragmentAccessors<'_>) -> Option<String> {
        Some(format!(
            "fn joints_partner(k: u32, index: u32) -> u32 {{\n\
             let ja = {a};\n\
             let jb = {b};\n\
             if (ja < 0.0 || jb < 0.0) {{ return NEIGHBOR_END; }}\n\
             let ua = u32(ja);\n\
             let ub = u32(jb);\n\
             if (ua == index && ub != index) {{ return ub; }}\n\
             if (ub == index && ua != index) {{ return ua; }}\n\
             return NEIGHBOR_END;\n\
             }}",
            a = acc.uniform_at(JointsParam::AIndexes, "k"),
            b = acc.uniform_at(JointsParam::BIndexes, "k"),
        ))
    }

    fn fragment(&self, phase: Phase, acc: &FragmentAccessors<'_>) -> Option<String> {
        let count = format!(
            "min({}, {})",
            acc.array_len(JointsParam::AIndexes),
            acc.array_len(JointsParam::BIndexes)
        );
        match phase {
            Phase::Constrain => Some(format!(
                "let me = {me};\n\
                 let inv_me = inverse_mass(me);\n\
                 if (inv_me == 0.0) {{ return; }}\n\
                 let stiffness = {stiffness};\n\
                 let count = min({count}, {rest_len});\n\
                 var shift = vec2<f32>(0.0, 0.0);\n\
                 for (var k = 0u; k < count; k++) {{\n\
                 let j = joints_partner(k, index);\n\
                 if (j == NEIGHBOR_END || j >= sim.particle_count) {{ continue; }}\n\
                 let other = {other};\n\
                 if (other.mass == 0.0) {{ continue; }}\n\
                 let share = inv_me / (inv_me + inverse_mass(other));\n\
                 let delta = me.position - other.position;\n\
                 let dist = length(delta);\n\
                 var n = delta / max(dist, {eps});\n\
                 if (dist <= {eps}) {{\n\
                 if (index < j) {{\n\
                 n = jitter_direction(index, j);\n\
                 }} else {{\n\
                 n = -jitter_direction(j, index);\n\
                 }}\n\
                 }}\n\
                 shift -= n * (dist - {rest}) * share * stiffness;\n\
                 }}\n\
                 particle.position += shift;",
                me = acc.other("index"),
                stiffness = acc.uniform(JointsParam::Stiffness),
                rest_len = acc.array_len(JointsParam::RestLengths),
                other = acc.other("j"),
                rest = acc.uniform_at(JointsParam::RestLengths, "k"),
                eps = wgsl_float(COINCIDENT_EPSILON),
            )),
            Phase::Correct => Some(format!(
                "if (particle.mass < 0.0 || {dt} <= 0.0) {{ return; }}\n\
                 let count = {count};\n\
                 var jointed = false;\n\
                 for (var k = 0u; k < count; k++) {{\n\
                 if (joints_partner(k, index) != NEIGHBOR_END) {{\n\
                 jointed = true;\n\
                 break;\n\
                 }}\n\
                 }}\n\
                 if (!jointed) {{ return; }}\n\
                 let moved = particle.position - {post};\n\
                 particle.velocity += moved / {dt} * {momentum};",
                dt = acc.dt(),
                post = acc.post_position(),
                momentum = acc.uniform(JointsParam::Momentum),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partner_lookup() {
        let a = [0.0, 2.0, -1.0];
        let b = [1.0, 0.0, 0.0];
        assert_eq!(partner(&a, &b, 0, 0), Some(1));
        assert_eq!(partner(&a, &b, 1, 0), Some(2));
        assert_eq!(partner(&a, &b, 0, 2), None);
        // Negative index disables the joint
        assert_eq!(partner(&a, &b, 2, 0), None);
    }

    #[test]
    fn test_self_joint_ignored() {
        assert_eq!(partner(&[3.0], &[3.0], 0, 3), None);
    }
}
