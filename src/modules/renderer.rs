//! Point sprite renderer
//!
//! Render modules carry parameters only. The presentation pass that reads
//! them lives outside the kernel; the block is still packed and bound so the
//! same uniform layout serves both.

use crate::module::{
    FragmentAccessors, Module, ModuleRole, ParamDecl, ParamKey, ParticleContext, Phase,
    PhaseFault,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsParam {
    SizeScale,
    Glow,
}

impl ParamKey for PointsParam {
    const DECLS: &'static [ParamDecl] = &[
        ParamDecl::scalar("size_scale", 1.0),
        ParamDecl::clamped("glow", 0.0, 0.0, 1.0),
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PointRenderer;

impl Module for PointRenderer {
    fn name(&self) -> &'static str {
        "points"
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Render
    }

    fn params(&self) -> &'static [ParamDecl] {
        PointsParam::DECLS
    }

    fn run(&self, _phase: Phase, _ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault> {
        Ok(())
    }

    fn fragment(&self, _phase: Phase, _acc: &FragmentAccessors<'_>) -> Option<String> {
        None
    }
}
