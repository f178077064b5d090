//! CPU capability object handed to a module for one particle

use glam::Vec2;
use thiserror::Error;

use super::descriptor::ParamKey;
use super::params::ParamBag;
use crate::consts::{SLOT_POST_X, SLOT_POST_Y, SLOT_PRE_X, SLOT_PRE_Y};
use crate::sim::particle::Particle;
use crate::sim::spatial::SpatialGrid;
use crate::sim::state::{StateLayout, StateTable};

/// Failure of one module invocation on one particle. Logged and counted by
/// the dispatcher, never propagated.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct PhaseFault(pub String);

impl PhaseFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Radius query over the particles of the current step
pub trait NeighborQuery {
    /// Append indices within `radius` of `point` to `out`, skipping `exclude`
    fn query_into(&self, point: Vec2, radius: f32, exclude: Option<u32>, out: &mut Vec<u32>);
}

impl NeighborQuery for SpatialGrid {
    fn query_into(&self, point: Vec2, radius: f32, exclude: Option<u32>, out: &mut Vec<u32>) {
        SpatialGrid::query_into(self, point, radius, exclude, out);
    }
}

/// Everything a module sees while processing one particle.
///
/// Other particles are read from a snapshot taken at the start of the phase
/// pass, so the result does not depend on iteration order.
pub struct ParticleContext<'a> {
    /// Index of this particle in the live array
    pub index: u32,
    pub particle: &'a mut Particle,
    pub dt: f32,
    pub params: &'a ParamBag,
    module: &'a str,
    snapshot: &'a [Particle],
    neighbors: &'a dyn NeighborQuery,
    layout: &'a StateLayout,
    state: &'a mut StateTable,
}

impl<'a> ParticleContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        module: &'a str,
        index: u32,
        particle: &'a mut Particle,
        dt: f32,
        params: &'a ParamBag,
        snapshot: &'a [Particle],
        neighbors: &'a dyn NeighborQuery,
        layout: &'a StateLayout,
        state: &'a mut StateTable,
    ) -> Self {
        Self {
            index,
            particle,
            dt,
            params,
            module,
            snapshot,
            neighbors,
            layout,
            state,
        }
    }

    #[inline]
    pub fn param<K: ParamKey>(&self, key: K) -> f32 {
        self.params.get(key)
    }

    #[inline]
    pub fn array<K: ParamKey>(&self, key: K) -> &[f32] {
        self.params.array(key)
    }

    pub fn particle_count(&self) -> usize {
        self.snapshot.len()
    }

    /// Live particles within `radius` of `point`, excluding this particle
    pub fn neighbors_of(&self, point: Vec2, radius: f32) -> Vec<u32> {
        let mut out = Vec::new();
        self.neighbors
            .query_into(point, radius, Some(self.index), &mut out);
        out.retain(|&i| self.snapshot.get(i as usize).is_some_and(Particle::is_alive));
        out
    }

    /// Live particles within `radius` of this particle
    pub fn neighbors(&self, radius: f32) -> Vec<u32> {
        self.neighbors_of(self.particle.position, radius)
    }

    /// Another particle as it was at the start of this phase pass
    pub fn other(&self, index: u32) -> Option<&Particle> {
        self.snapshot.get(index as usize)
    }

    fn own_slot(&self, field: &str) -> Result<u32, PhaseFault> {
        self.layout.slot(self.module, field).ok_or_else(|| {
            PhaseFault::new(format!("no state field `{field}` on `{}`", self.module))
        })
    }

    fn read(&self, index: u32, slot: u32) -> Result<f32, PhaseFault> {
        self.state
            .get(index as usize, slot)
            .ok_or_else(|| PhaseFault::new(format!("state index {index} out of range")))
    }

    fn write(&mut self, index: u32, slot: u32, value: f32) -> Result<(), PhaseFault> {
        if self.state.set(index as usize, slot, value) {
            Ok(())
        } else {
            Err(PhaseFault::new(format!("state index {index} out of range")))
        }
    }

    /// Read one of this module's fields for this particle
    pub fn state(&self, field: &str) -> Result<f32, PhaseFault> {
        self.state_of(field, self.index)
    }

    /// Read one of this module's fields for another particle
    pub fn state_of(&self, field: &str, index: u32) -> Result<f32, PhaseFault> {
        let slot = self.own_slot(field)?;
        self.read(index, slot)
    }

    /// Read a field declared by another module
    pub fn foreign_state(&self, module: &str, field: &str, index: u32) -> Result<f32, PhaseFault> {
        let slot = self
            .layout
            .slot(module, field)
            .ok_or_else(|| PhaseFault::new(format!("no state field `{field}` on `{module}`")))?;
        self.read(index, slot)
    }

    pub fn set_state(&mut self, field: &str, value: f32) -> Result<(), PhaseFault> {
        self.set_state_of(field, self.index, value)
    }

    pub fn set_state_of(&mut self, field: &str, index: u32, value: f32) -> Result<(), PhaseFault> {
        let slot = self.own_slot(field)?;
        self.write(index, slot, value)
    }

    /// Position before the last integration
    pub fn pre_position(&self) -> Result<Vec2, PhaseFault> {
        Ok(Vec2::new(
            self.read(self.index, SLOT_PRE_X)?,
            self.read(self.index, SLOT_PRE_Y)?,
        ))
    }

    /// Position right after the last integration, before any constraint
    pub fn post_position(&self) -> Result<Vec2, PhaseFault> {
        Ok(Vec2::new(
            self.read(self.index, SLOT_POST_X)?,
            self.read(self.index, SLOT_POST_Y)?,
        ))
    }

    pub fn set_pre_position(&mut self, position: Vec2) -> Result<(), PhaseFault> {
        self.write(self.index, SLOT_PRE_X, position.x)?;
        self.write(self.index, SLOT_PRE_Y, position.y)
    }

    pub fn set_post_position(&mut self, position: Vec2) -> Result<(), PhaseFault> {
        self.write(self.index, SLOT_POST_X, position.x)?;
        self.write(self.index, SLOT_POST_Y, position.y)
    }
}
