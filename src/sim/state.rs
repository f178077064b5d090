//! Per-particle scratch state
//!
//! One flat table of `particle_count × stride` scalars shared by every module.
//! The first four slots hold integration bookkeeping; declared module fields
//! follow in registration order, then field declaration order. The same
//! layout is emitted into the WGSL program, so a slot number means the same
//! thing on both backends.

use crate::consts::RESERVED_STATE_SLOTS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSlot {
    pub module: String,
    pub field: &'static str,
    pub slot: u32,
}

/// Assignment of `(module, field)` pairs to slots
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateLayout {
    slots: Vec<StateSlot>,
}

impl StateLayout {
    /// Assign slots for `(module, fields)` groups in the order given.
    /// Repeated pairs keep their first slot.
    pub fn build<'a, I>(groups: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [&'static str])>,
    {
        let mut layout = Self::default();
        for (module, fields) in groups {
            for &field in fields {
                if layout.slot(module, field).is_some() {
                    continue;
                }
                let slot = RESERVED_STATE_SLOTS + layout.slots.len() as u32;
                layout.slots.push(StateSlot {
                    module: module.to_string(),
                    field,
                    slot,
                });
            }
        }
        layout
    }

    pub fn slot(&self, module: &str, field: &str) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.module == module && s.field == field)
            .map(|s| s.slot)
    }

    /// Scalars per particle, including the reserved slots
    pub fn stride(&self) -> u32 {
        RESERVED_STATE_SLOTS + self.slots.len() as u32
    }

    pub fn slots(&self) -> &[StateSlot] {
        &self.slots
    }
}

/// Flat scratch storage indexed by `(particle index, slot)`
#[derive(Debug, Clone, Default)]
pub struct StateTable {
    stride: usize,
    data: Vec<f32>,
}

impl StateTable {
    pub fn new(stride: u32) -> Self {
        Self {
            stride: stride as usize,
            data: Vec::new(),
        }
    }

    /// Size the table for `count` particles. New rows are zeroed.
    pub fn resize(&mut self, count: usize) {
        self.data.resize(count * self.stride, 0.0);
    }

    pub fn rows(&self) -> usize {
        if self.stride == 0 { 0 } else { self.data.len() / self.stride }
    }

    pub fn stride(&self) -> u32 {
        self.stride as u32
    }

    #[inline]
    pub fn get(&self, index: usize, slot: u32) -> Option<f32> {
        if slot as usize >= self.stride {
            return None;
        }
        self.data.get(index * self.stride + slot as usize).copied()
    }

    #[inline]
    pub fn set(&mut self, index: usize, slot: u32, value: f32) -> bool {
        if slot as usize >= self.stride {
            return false;
        }
        match self.data.get_mut(index * self.stride + slot as usize) {
            Some(v) => {
                *v = value;
                true
            }
            None => false,
        }
    }

    /// Drop rows whose `keep` flag is false, preserving the order of the rest
    pub fn retain_rows(&mut self, keep: &[bool]) {
        let stride = self.stride;
        let mut write = 0;
        for (row, &kept) in keep.iter().enumerate().take(self.rows()) {
            if !kept {
                continue;
            }
            if write != row {
                self.data.copy_within(row * stride..(row + 1) * stride, write * stride);
            }
            write += 1;
        }
        self.data.truncate(write * stride);
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
