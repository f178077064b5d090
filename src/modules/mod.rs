//! Built-in modules
//!
//! Each module renders its physics twice (CPU function, WGSL fragment) with
//! the same arithmetic in the same order.

pub mod boundary;
pub mod collisions;
pub mod environment;
pub mod fluid;
pub mod joints;
pub mod renderer;

pub use boundary::{Boundary, BoundaryParam};
pub use collisions::{Collisions, CollisionsParam};
pub use environment::{Environment, EnvironmentParam};
pub use fluid::{Fluid, FluidParam};
pub use joints::{Joints, JointsParam};
pub use renderer::{PointRenderer, PointsParam};

use crate::module::Module;

/// The standard module set in execution order
pub fn default_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(Environment),
        Box::new(Fluid),
        Box::new(Boundary),
        Box::new(Collisions),
        Box::new(Joints),
        Box::new(PointRenderer),
    ]
}
