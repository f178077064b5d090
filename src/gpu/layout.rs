//! Uniform packing and binding allocation
//!
//! Every module gets one uniform block of `vec4<f32>` registers. Component
//! slot 0 holds the enabled flag, scalar parameters follow in declaration
//! order, then one length slot per array parameter. Array contents live in
//! their own read-only storage buffers.
//!
//! Bindings 0..=6 are builder-internal; module bindings are handed out
//! sequentially after them in registration order (uniform block first, then
//! the module's arrays). The table only changes when the module list does.

use crate::consts::REGISTER_WIDTH;
use crate::module::{Module, ParamBag, ParamKind, ParamValue};

/// Fixed builder-internal bindings (group 0)
pub mod bindings {
    pub const PARTICLES: u32 = 0;
    pub const PARTICLES_PREV: u32 = 1;
    pub const SIM_STATE: u32 = 2;
    pub const SIM_UNIFORMS: u32 = 3;
    pub const GRID_CONFIG: u32 = 4;
    pub const GRID_COUNTS: u32 = 5;
    pub const GRID_CELLS: u32 = 6;
    /// First binding available to modules
    pub const FIRST_MODULE: u32 = 7;
}

/// Position of one scalar inside a module's uniform block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedSlot {
    pub register: u32,
    pub component: u32,
}

impl PackedSlot {
    fn from_linear(slot: u32) -> Self {
        Self {
            register: slot / REGISTER_WIDTH,
            component: slot % REGISTER_WIDTH,
        }
    }

    pub fn linear(&self) -> u32 {
        self.register * REGISTER_WIDTH + self.component
    }

    /// Byte offset inside the uniform buffer
    pub fn byte_offset(&self) -> u64 {
        self.linear() as u64 * std::mem::size_of::<f32>() as u64
    }

    /// WGSL swizzle letter of the component
    pub fn swizzle(&self) -> char {
        ['x', 'y', 'z', 'w'][self.component as usize]
    }
}

/// A scalar parameter mapped into the block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformEntry {
    pub name: &'static str,
    /// Declaration index in the module's parameter list
    pub param: usize,
    pub slot: PackedSlot,
}

/// An array parameter: its storage binding and the block slot holding its length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayEntry {
    pub name: &'static str,
    pub param: usize,
    pub binding: u32,
    pub length_slot: PackedSlot,
}

/// Packed layout of one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout {
    pub module: String,
    pub binding: u32,
    pub registers: u32,
    pub scalars: Vec<UniformEntry>,
    pub arrays: Vec<ArrayEntry>,
}

impl ModuleLayout {
    pub const ENABLED_SLOT: PackedSlot = PackedSlot {
        register: 0,
        component: 0,
    };

    /// Pack a module's declarations, allocating bindings from `next_binding`
    pub fn pack(module: &dyn Module, next_binding: &mut u32) -> Self {
        let binding = *next_binding;
        *next_binding += 1;

        let decls = module.params();
        let mut linear = 1; // slot 0 is the enabled flag
        let mut scalars = Vec::new();
        for (param, decl) in decls.iter().enumerate() {
            if decl.kind == ParamKind::Scalar {
                scalars.push(UniformEntry {
                    name: decl.name,
                    param,
                    slot: PackedSlot::from_linear(linear),
                });
                linear += 1;
            }
        }

        let mut arrays = Vec::new();
        for (param, decl) in decls.iter().enumerate() {
            if decl.kind == ParamKind::Array {
                arrays.push(ArrayEntry {
                    name: decl.name,
                    param,
                    binding: *next_binding,
                    length_slot: PackedSlot::from_linear(linear),
                });
                *next_binding += 1;
                linear += 1;
            }
        }

        Self {
            module: module.name().to_string(),
            binding,
            registers: linear.div_ceil(REGISTER_WIDTH).max(1),
            scalars,
            arrays,
        }
    }

    pub fn scalar(&self, param: usize) -> Option<&UniformEntry> {
        self.scalars.iter().find(|e| e.param == param)
    }

    pub fn array(&self, param: usize) -> Option<&ArrayEntry> {
        self.arrays.iter().find(|e| e.param == param)
    }

    /// Slot of a scalar or array-length by parameter name
    pub fn offset_of(&self, name: &str) -> Option<PackedSlot> {
        self.scalars
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.slot)
            .or_else(|| self.arrays.iter().find(|e| e.name == name).map(|e| e.length_slot))
    }

    /// Size of the uniform block in bytes
    pub fn block_size(&self) -> u64 {
        self.registers as u64 * REGISTER_WIDTH as u64 * std::mem::size_of::<f32>() as u64
    }

    /// Serialize the current values into the block's `f32` words
    pub fn serialize(&self, bag: &ParamBag) -> Vec<f32> {
        let mut words = vec![0.0; (self.registers * REGISTER_WIDTH) as usize];
        words[Self::ENABLED_SLOT.linear() as usize] = if bag.enabled() { 1.0 } else { 0.0 };
        for entry in &self.scalars {
            words[entry.slot.linear() as usize] = bag.scalar_at(entry.param);
        }
        for entry in &self.arrays {
            let len = match bag.values().get(entry.param) {
                Some(ParamValue::Array(values)) => values.len(),
                _ => 0,
            };
            words[entry.length_slot.linear() as usize] = len as f32;
        }
        words
    }

    /// Cap each serialized array length at what its binding can hold
    pub fn clamp_lengths(&self, words: &mut [f32], capacity: impl Fn(u32) -> Option<usize>) {
        for entry in &self.arrays {
            let Some(limit) = capacity(entry.binding) else {
                continue;
            };
            if let Some(len) = words.get_mut(entry.length_slot.linear() as usize) {
                *len = len.min(limit as f32);
            }
        }
    }

    /// WGSL expression reading a packed slot of this module's block
    pub fn wgsl_slot(&self, slot: PackedSlot) -> String {
        format!("{}[{}].{}", uniform_var(&self.module), slot.register, slot.swizzle())
    }
}

/// WGSL variable name of a module's uniform block
pub fn uniform_var(module: &str) -> String {
    format!("u_{module}")
}

/// WGSL variable name of a module's array buffer
pub fn array_var(module: &str, param: &str) -> String {
    format!("a_{module}_{param}")
}

/// Layout of every module in registration order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingTable {
    pub modules: Vec<ModuleLayout>,
}

impl BindingTable {
    pub fn build<'a, I>(modules: I) -> Self
    where
        I: IntoIterator<Item = &'a dyn Module>,
    {
        let mut next = bindings::FIRST_MODULE;
        let modules = modules
            .into_iter()
            .map(|m| ModuleLayout::pack(m, &mut next))
            .collect();
        Self { modules }
    }

    pub fn module(&self, name: &str) -> Option<&ModuleLayout> {
        self.modules.iter().find(|m| m.module == name)
    }

    /// One past the highest binding in use
    pub fn binding_count(&self) -> u32 {
        self.modules
            .iter()
            .flat_map(|m| std::iter::once(m.binding).chain(m.arrays.iter().map(|a| a.binding)))
            .max()
            .map_or(bindings::FIRST_MODULE, |b| b + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{Environment, Joints};

    #[test]
    fn test_scalars_pack_after_enabled_slot() {
        let mut next = bindings::FIRST_MODULE;
        let layout = ModuleLayout::pack(&Environment::default(), &mut next);
        assert_eq!(layout.binding, bindings::FIRST_MODULE);
        // enabled + gravity_x + gravity_y + momentum = 4 slots in one register
        assert_eq!(layout.registers, 1);
        let momentum = layout.offset_of("momentum").unwrap();
        assert_eq!((momentum.register, momentum.component), (0, 3));
        assert_eq!(next, bindings::FIRST_MODULE + 1);
    }

    #[test]
    fn test_arrays_get_length_slot_and_binding() {
        let mut next = 20;
        let layout = ModuleLayout::pack(&Joints::default(), &mut next);
        assert_eq!(layout.binding, 20);
        let bindings: Vec<_> = layout.arrays.iter().map(|a| a.binding).collect();
        assert_eq!(bindings, vec![21, 22, 23]);
        // enabled, stiffness, momentum, then three lengths
        assert_eq!(layout.arrays[0].length_slot.linear(), 3);
        assert_eq!(layout.arrays[2].length_slot.linear(), 5);
        assert_eq!(layout.registers, 2);
        assert_eq!(layout.block_size(), 32);
    }

    #[test]
    fn test_serialize_writes_enabled_and_lengths() {
        let joints = Joints::default();
        let mut next = 0;
        let layout = ModuleLayout::pack(&joints, &mut next);
        let mut bag = ParamBag::from_decls(joints.params());
        bag.set_array_at(layout.arrays[0].param, vec![0.0, 1.0]);
        bag.set_enabled(false);
        let words = layout.serialize(&bag);
        assert_eq!(words.len(), 8);
        assert_eq!(words[0], 0.0);
        assert_eq!(words[layout.arrays[0].length_slot.linear() as usize], 2.0);
    }

    #[test]
    fn test_wgsl_slot_expression() {
        let mut next = 0;
        let layout = ModuleLayout::pack(&Environment::default(), &mut next);
        let slot = layout.offset_of("gravity_y").unwrap();
        assert_eq!(layout.wgsl_slot(slot), "u_environment[0].z");
    }
}
