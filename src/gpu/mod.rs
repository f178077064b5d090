//! GPU backend: uniform layout, atomic spatial grid, WGSL generation and the
//! wgpu runtime that dispatches the generated program.

pub mod grid;
pub mod layout;
pub mod program;
pub mod runtime;

pub use grid::{AtomicGrid, GridConfig, RingCursor};
pub use layout::{BindingTable, ModuleLayout, PackedSlot};
pub use program::{GpuParticle, ProgramBuilder, ShaderProgram, SimUniforms};
pub use runtime::{GpuReadback, GpuSimulation, GpuUniformSink};
