//! Container walls (axis-aligned box or circle)
//!
//! `constrain` projects particles back inside the container, `correct`
//! reflects whatever velocity still points into a wall the particle touches.

use glam::Vec2;

use crate::module::{
    FragmentAccessors, Module, ModuleRole, ParamDecl, ParamKey, ParticleContext, Phase,
    PhaseFault, PhaseSet,
};
use crate::normalize_or;

/// Distance within which a particle counts as touching a wall
const CONTACT_SLOP: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryParam {
    /// 0 = box, 1 = circle
    Mode,
    MinX,
    MinY,
    MaxX,
    MaxY,
    /// Circle radius; the circle is centred in the box
    Radius,
    Restitution,
    Friction,
}

impl ParamKey for BoundaryParam {
    const DECLS: &'static [ParamDecl] = &[
        ParamDecl::clamped("mode", 0.0, 0.0, 1.0),
        ParamDecl::scalar("min_x", -500.0),
        ParamDecl::scalar("min_y", -500.0),
        ParamDecl::scalar("max_x", 500.0),
        ParamDecl::scalar("max_y", 500.0),
        ParamDecl::scalar("radius", 500.0),
        ParamDecl::clamped("restitution", 0.5, 0.0, 1.0),
        ParamDecl::clamped("friction", 0.0, 0.0, 1.0),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Signed distance to a circle (negative inside)
#[inline]
pub fn sd_circle(p: Vec2, center: Vec2, radius: f32) -> f32 {
    (p - center).length() - radius
}

/// Reflect the part of `v` moving along the outward normal `n`
pub fn bounce(v: Vec2, n: Vec2, restitution: f32, friction: f32) -> Vec2 {
    let vn = v.dot(n);
    if vn <= 0.0 {
        return v;
    }
    let normal = n * vn;
    let tangent = v - normal;
    tangent * (1.0 - friction) - normal * restitution
}

struct Walls {
    circle: bool,
    min: Vec2,
    max: Vec2,
    radius: f32,
}

impl Walls {
    fn read(ctx: &ParticleContext<'_>) -> Self {
        Self {
            circle: ctx.param(BoundaryParam::Mode) >= 0.5,
            min: Vec2::new(ctx.param(BoundaryParam::MinX), ctx.param(BoundaryParam::MinY)),
            max: Vec2::new(ctx.param(BoundaryParam::MaxX), ctx.param(BoundaryParam::MaxY)),
            radius: ctx.param(BoundaryParam::Radius),
        }
    }

    fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    /// Allowed box for a particle centre
    fn inner_box(&self, size: f32) -> (Vec2, Vec2) {
        let lo = self.min + Vec2::splat(size);
        let hi = (self.max - Vec2::splat(size)).max(lo);
        (lo, hi)
    }

    fn inner_radius(&self, size: f32) -> f32 {
        (self.radius - size).max(0.0)
    }

    fn project(&self, p: Vec2, size: f32) -> Vec2 {
        if self.circle {
            let center = self.center();
            let limit = self.inner_radius(size);
            if sd_circle(p, center, limit) > 0.0 {
                center + normalize_or(p - center, Vec2::X) * limit
            } else {
                p
            }
        } else {
            let (lo, hi) = self.inner_box(size);
            p.clamp(lo, hi)
        }
    }

    fn reflect(&self, p: Vec2, v: Vec2, size: f32, restitution: f32, friction: f32) -> Vec2 {
        if self.circle {
            let center = self.center();
            let limit = self.inner_radius(size);
            if sd_circle(p, center, limit) < -CONTACT_SLOP {
                return v;
            }
            bounce(v, normalize_or(p - center, Vec2::X), restitution, friction)
        } else {
            let (lo, hi) = self.inner_box(size);
            let mut v = v;
            if p.x <= lo.x + CONTACT_SLOP {
                v = bounce(v, Vec2::NEG_X, restitution, friction);
            } else if p.x >= hi.x - CONTACT_SLOP {
                v = bounce(v, Vec2::X, restitution, friction);
            }
            if p.y <= lo.y + CONTACT_SLOP {
                v = bounce(v, Vec2::NEG_Y, restitution, friction);
            } else if p.y >= hi.y - CONTACT_SLOP {
                v = bounce(v, Vec2::Y, restitution, friction);
            }
            v
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Boundary;

impl Module for Boundary {
    fn name(&self) -> &'static str {
        "boundary"
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Force(PhaseSet::of(&[Phase::Constrain, Phase::Correct]))
    }

    fn params(&self) -> &'static [ParamDecl] {
        BoundaryParam::DECLS
    }

    fn run(&self, phase: Phase, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        if ctx.particle.is_pinned() {
            return Ok(());
        }
        let walls = Walls::read(ctx);
        let size = ctx.particle.size;
        match phase {
            Phase::Constrain => {
                ctx.particle.position = walls.project(ctx.particle.position, size);
            }
            Phase::Correct => {
                ctx.particle.velocity = walls.reflect(
                    ctx.particle.position,
                    ctx.particle.velocity,
                    size,
                    ctx.param(BoundaryParam::Restitution),
                    ctx.param(BoundaryParam::Friction),
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn fragment(&self, phase: Phase, acc: &FragmentAccessors<'_>) -> Option<String> {
        let setup = format!(
            "if (particle.mass < 0.0) {{ return; }}\n\
             let circle = {mode} >= 0.5;\n\
             let wall_min = vec2<f32>({min_x}, {min_y});\n\
             let wall_max = vec2<f32>({max_x}, {max_y});\n\
             let center = (wall_min + wall_max) * 0.5;\n\
             let limit = max({radius} - particle.size, 0.0);\n\
             let lo = wall_min + vec2<f32>(particle.size);\n\
             let hi = max(wall_max - vec2<f32>(particle.size), lo);",
            mode = acc.uniform(BoundaryParam::Mode),
            min_x = acc.uniform(BoundaryParam::MinX),
            min_y = acc.uniform(BoundaryParam::MinY),
            max_x = acc.uniform(BoundaryParam::MaxX),
            max_y = acc.uniform(BoundaryParam::MaxY),
            radius = acc.uniform(BoundaryParam::Radius),
        );
        match phase {
            Phase::Constrain => Some(format!(
                "{setup}\n\
                 if (circle) {{\n\
                 let offset = particle.position - center;\n\
                 if (length(offset) > limit) {{\n\
                 particle.position = center + normalize_or(offset, vec2<f32>(1.0, 0.0)) * limit;\n\
                 }}\n\
                 }} else {{\n\
                 particle.position = clamp(particle.position, lo, hi);\n\
                 }}"
            )),
            Phase::Correct => Some(format!(
                "{setup}\n\
                 let restitution = {restitution};\n\
                 let friction = {friction};\n\
                 var v = particle.velocity;\n\
                 let p = particle.position;\n\
                 if (circle) {{\n\
                 if (length(p - center) - limit >= -{slop}) {{\n\
                 v = bounce(v, normalize_or(p - center, vec2<f32>(1.0, 0.0)), restitution, friction);\n\
                 }}\n\
                 }} else {{\n\
                 if (p.x <= lo.x + {slop}) {{\n\
                 v = bounce(v, vec2<f32>(-1.0, 0.0), restitution, friction);\n\
                 }} else if (p.x >= hi.x - {slop}) {{\n\
                 v = bounce(v, vec2<f32>(1.0, 0.0), restitution, friction);\n\
                 }}\n\
                 if (p.y <= lo.y + {slop}) {{\n\
                 v = bounce(v, vec2<f32>(0.0, -1.0), restitution, friction);\n\
                 }} else if (p.y >= hi.y - {slop}) {{\n\
                 v = bounce(v, vec2<f32>(0.0, 1.0), restitution, friction);\n\
                 }}\n\
                 }}\n\
                 particle.velocity = v;",
                restitution = acc.uniform(BoundaryParam::Restitution),
                friction = acc.uniform(BoundaryParam::Friction),
                slop = wgsl_float(CONTACT_SLOP),
            )),
            _ => None,
        }
    }
}

/// Float literal that WGSL accepts (always has a decimal point)
pub(crate) fn wgsl_float(value: f32) -> String {
    let text = format!("{value:?}");
    if text.contains('.') || text.contains('e') { text } else { format!("{text}.0") }
}
