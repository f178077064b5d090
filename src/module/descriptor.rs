//! Module descriptor contract
//!
//! A module is written once and interpreted twice: the CPU dispatcher calls
//! [`Module::run`] per particle, the GPU program builder calls
//! [`Module::fragment`] once per phase to get WGSL source.

use std::fmt;

use super::context::{ParticleContext, PhaseFault};
use super::fragment::FragmentAccessors;

/// Module-facing pipeline phases. Integration is pipeline-internal and runs
/// between `Apply` and `Constrain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    State,
    Apply,
    Constrain,
    Correct,
}

impl Phase {
    /// Execution order within a step
    pub const ALL: [Phase; 4] = [Phase::State, Phase::Apply, Phase::Constrain, Phase::Correct];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::State => "state",
            Phase::Apply => "apply",
            Phase::Constrain => "constrain",
            Phase::Correct => "correct",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The phases a force module implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseSet(u8);

impl PhaseSet {
    pub const EMPTY: PhaseSet = PhaseSet(0);

    pub fn of(phases: &[Phase]) -> Self {
        phases.iter().fold(Self::EMPTY, |set, &p| set.with(p))
    }

    pub fn with(self, phase: Phase) -> Self {
        PhaseSet(self.0 | phase.bit())
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Phase> {
        Phase::ALL.into_iter().filter(move |p| self.contains(*p))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Force modules take part in the pipeline, render modules only carry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRole {
    Force(PhaseSet),
    Render,
}

impl ModuleRole {
    pub fn implements(&self, phase: Phase) -> bool {
        match self {
            ModuleRole::Force(phases) => phases.contains(phase),
            ModuleRole::Render => false,
        }
    }

    pub fn phases(&self) -> PhaseSet {
        match self {
            ModuleRole::Force(phases) => *phases,
            ModuleRole::Render => PhaseSet::EMPTY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Scalar,
    /// Variable-length `f32` array, bound as its own storage buffer on the GPU
    Array,
}

/// Declared parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamDecl {
    pub name: &'static str,
    pub kind: ParamKind,
    /// Initial value for scalars (ignored for arrays, which start empty)
    pub default: f32,
    /// Inclusive clamp range applied on write
    pub range: Option<(f32, f32)>,
}

impl ParamDecl {
    pub const fn scalar(name: &'static str, default: f32) -> Self {
        Self {
            name,
            kind: ParamKind::Scalar,
            default,
            range: None,
        }
    }

    pub const fn clamped(name: &'static str, default: f32, min: f32, max: f32) -> Self {
        Self {
            name,
            kind: ParamKind::Scalar,
            default,
            range: Some((min, max)),
        }
    }

    pub const fn array(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Array,
            default: 0.0,
            range: None,
        }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        match self.range {
            Some((min, max)) => value.clamp(min, max),
            None => value,
        }
    }
}

/// Compile-time parameter key of one module.
///
/// Implemented by a fieldless enum per module; `index()` is the position of
/// the key's declaration in `DECLS`.
pub trait ParamKey: Copy {
    const DECLS: &'static [ParamDecl];

    fn index(self) -> usize;

    fn decl(self) -> &'static ParamDecl {
        &Self::DECLS[self.index()]
    }

    fn name(self) -> &'static str {
        self.decl().name
    }
}

/// A force or render unit
pub trait Module: Send + Sync {
    /// Unique name, also used as the WGSL identifier prefix
    fn name(&self) -> &'static str;

    fn role(&self) -> ModuleRole;

    /// Parameters in declaration order (this order drives uniform packing)
    fn params(&self) -> &'static [ParamDecl];

    /// Per-particle scratch fields owned by this module
    fn state_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// CPU rendering of `phase` for one particle
    fn run(&self, phase: Phase, ctx: &mut ParticleContext<'_>) -> Result<(), PhaseFault>;

    /// Module-scope WGSL functions shared by this module's fragments
    fn helpers(&self, _acc: &FragmentAccessors<'_>) -> Option<String> {
        None
    }

    /// GPU rendering of `phase`: WGSL statements operating on `particle`
    /// (a local copy of the current record, written back afterwards).
    /// `None` for phases the module does not implement.
    fn fragment(&self, phase: Phase, acc: &FragmentAccessors<'_>) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_set_iterates_in_pipeline_order() {
        let set = PhaseSet::of(&[Phase::Correct, Phase::State, Phase::Constrain]);
        let phases: Vec<_> = set.iter().collect();
        assert_eq!(phases, vec![Phase::State, Phase::Constrain, Phase::Correct]);
        assert!(!set.contains(Phase::Apply));
    }

    #[test]
    fn test_render_role_implements_nothing() {
        for phase in Phase::ALL {
            assert!(!ModuleRole::Render.implements(phase));
        }
        assert!(ModuleRole::Render.phases().is_empty());
    }

    #[test]
    fn test_param_clamp() {
        let decl = ParamDecl::clamped("momentum", 1.0, 0.0, 1.0);
        assert_eq!(decl.clamp(1.5), 1.0);
        assert_eq!(decl.clamp(-0.5), 0.0);
        assert_eq!(ParamDecl::scalar("g", 0.0).clamp(99.0), 99.0);
    }
}
