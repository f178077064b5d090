//! CPU simulation path
//!
//! Particle storage, the bucket-grid spatial index, the scratch state table
//! and the phase dispatcher that drives modules over them. Everything here is
//! single-threaded and deterministic for a given module set and input.

pub mod particle;
pub mod spatial;
pub mod state;
pub mod tick;

pub use particle::{Particle, ParticleId, ParticleInit, ParticleStore};
pub use spatial::{BoundsTracker, Camera, GridBounds, SpatialGrid};
pub use state::{StateLayout, StateSlot, StateTable};
pub use tick::{CpuPipeline, StepReport};
