//! Module descriptors and their parameter plumbing
//!
//! A module declares its parameters and scratch fields once and renders each
//! phase twice: as a CPU function and as a WGSL fragment.

pub mod context;
pub mod descriptor;
pub mod fragment;
pub mod params;
pub mod registry;

pub use context::{NeighborQuery, ParticleContext, PhaseFault};
pub use descriptor::{Module, ModuleRole, ParamDecl, ParamKey, ParamKind, Phase, PhaseSet};
pub use fragment::FragmentAccessors;
pub use params::{ParamBag, ParamValue};
pub use registry::{ModuleParams, ModuleRegistry, UniformSink};
