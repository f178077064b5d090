//! Module registry
//!
//! Host-side mirror of every module's parameter values. The registry owns the
//! module list, derives the uniform layout and scratch slots from it, and on
//! every parameter write re-serializes the affected block and pushes it
//! through the attached [`UniformSink`].

use super::descriptor::{Module, ParamKey, ParamKind};
use super::params::ParamBag;
use crate::gpu::layout::{BindingTable, ModuleLayout};
use crate::sim::state::StateLayout;
use crate::{KernelError, Result};

/// Destination for serialized parameter blocks (the GPU runtime implements this)
pub trait UniformSink {
    /// Replace a module's whole uniform block
    fn write_uniform(&mut self, binding: u32, words: &[f32]);
    /// Replace the contents of an array parameter buffer
    fn write_array(&mut self, binding: u32, values: &[f32]);
    /// Values an array binding can hold, if bounded
    fn array_capacity(&self, _binding: u32) -> Option<usize> {
        None
    }
}

struct Entry {
    module: Box<dyn Module>,
    params: ParamBag,
}

pub struct ModuleRegistry {
    entries: Vec<Entry>,
    bindings: BindingTable,
    state: StateLayout,
    sink: Option<Box<dyn UniformSink>>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            bindings: BindingTable::default(),
            state: StateLayout::default(),
            sink: None,
        }
    }

    /// Build a registry from modules in execution order
    pub fn with_modules(modules: Vec<Box<dyn Module>>) -> Result<Self> {
        let mut registry = Self::new();
        for module in modules {
            registry.register_boxed(module)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, module: impl Module + 'static) -> Result<()> {
        self.register_boxed(Box::new(module))
    }

    /// Append a module. Registration order is execution order within a phase.
    pub fn register_boxed(&mut self, module: Box<dyn Module>) -> Result<()> {
        if self.position(module.name()).is_some() {
            return Err(KernelError::DuplicateModule(module.name().to_string()));
        }
        let params = ParamBag::from_decls(module.params());
        log::info!(
            "Registered module `{}` ({} params, {} state fields)",
            module.name(),
            module.params().len(),
            module.state_fields().len()
        );
        self.entries.push(Entry { module, params });
        self.rebuild_layouts();
        Ok(())
    }

    fn rebuild_layouts(&mut self) {
        self.bindings = BindingTable::build(self.entries.iter().map(|e| e.module.as_ref()));
        self.state = StateLayout::build(
            self.entries
                .iter()
                .map(|e| (e.module.name(), e.module.state_fields())),
        );
        if self.sink.is_some() {
            self.push_all();
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.module.name() == name)
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| KernelError::UnknownModule(name.to_string()))
    }

    fn param_index(&self, module: usize, param: &str, kind: ParamKind) -> Result<usize> {
        let entry = &self.entries[module];
        let decls = entry.module.params();
        let index = decls
            .iter()
            .position(|d| d.name == param)
            .ok_or_else(|| KernelError::UnknownParam {
                module: entry.module.name().to_string(),
                param: param.to_string(),
            })?;
        if decls[index].kind != kind {
            return Err(KernelError::ParamKind {
                module: entry.module.name().to_string(),
                param: param.to_string(),
            });
        }
        Ok(index)
    }

    /// Modules with their current values, in execution order
    pub fn modules(&self) -> impl Iterator<Item = (&dyn Module, &ParamBag)> {
        self.entries.iter().map(|e| (e.module.as_ref(), &e.params))
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.module.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn binding_table(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn state_layout(&self) -> &StateLayout {
        &self.state
    }

    pub fn params(&self, module: &str) -> Result<&ParamBag> {
        Ok(&self.entries[self.index_of(module)?].params)
    }

    pub fn get(&self, module: &str, param: &str) -> Result<f32> {
        let m = self.index_of(module)?;
        let p = self.param_index(m, param, ParamKind::Scalar)?;
        Ok(self.entries[m].params.scalar_at(p))
    }

    /// Write a scalar; returns the stored value after clamping
    pub fn set(&mut self, module: &str, param: &str, value: f32) -> Result<f32> {
        let m = self.index_of(module)?;
        let p = self.param_index(m, param, ParamKind::Scalar)?;
        Ok(self.set_scalar_at(m, p, value))
    }

    pub fn get_array(&self, module: &str, param: &str) -> Result<&[f32]> {
        let m = self.index_of(module)?;
        let p = self.param_index(m, param, ParamKind::Array)?;
        Ok(self.entries[m].params.array_at(p))
    }

    pub fn set_array(&mut self, module: &str, param: &str, values: Vec<f32>) -> Result<()> {
        let m = self.index_of(module)?;
        let p = self.param_index(m, param, ParamKind::Array)?;
        self.set_array_at(m, p, values);
        Ok(())
    }

    pub fn is_enabled(&self, module: &str) -> Result<bool> {
        Ok(self.params(module)?.enabled())
    }

    pub fn set_enabled(&mut self, module: &str, enabled: bool) -> Result<()> {
        let m = self.index_of(module)?;
        self.entries[m].params.set_enabled(enabled);
        self.push_block(m);
        Ok(())
    }

    /// Typed accessor handle for one module
    pub fn handle(&mut self, module: &str) -> Result<ModuleParams<'_>> {
        let index = self.index_of(module)?;
        Ok(ModuleParams {
            registry: self,
            index,
        })
    }

    fn set_scalar_at(&mut self, module: usize, param: usize, value: f32) -> f32 {
        let entry = &mut self.entries[module];
        let stored = entry.module.params()[param].clamp(value);
        entry.params.set_scalar_at(param, stored);
        self.push_block(module);
        stored
    }

    fn set_array_at(&mut self, module: usize, param: usize, values: Vec<f32>) {
        self.entries[module].params.set_array_at(param, values);
        // The length lives in the uniform block
        self.push_block(module);
        self.push_array(module, param);
    }

    fn layout(&self, module: usize) -> Option<&ModuleLayout> {
        self.bindings.modules.get(module)
    }

    fn push_block(&mut self, module: usize) {
        let Some(layout) = self.bindings.modules.get(module) else {
            return;
        };
        if let Some(sink) = self.sink.as_mut() {
            let mut words = layout.serialize(&self.entries[module].params);
            layout.clamp_lengths(&mut words, |binding| sink.array_capacity(binding));
            sink.write_uniform(layout.binding, &words);
        }
    }

    fn push_array(&mut self, module: usize, param: usize) {
        let Some(entry) = self.layout(module).and_then(|l| l.array(param)) else {
            return;
        };
        let binding = entry.binding;
        if let Some(sink) = self.sink.as_mut() {
            sink.write_array(binding, self.entries[module].params.array_at(param));
        }
    }

    fn push_all(&mut self) {
        for module in 0..self.entries.len() {
            self.push_block(module);
            let arrays: Vec<usize> = self
                .layout(module)
                .map(|l| l.arrays.iter().map(|a| a.param).collect())
                .unwrap_or_default();
            for param in arrays {
                self.push_array(module, param);
            }
        }
    }

    /// Route every future write to `sink`; current values are pushed immediately
    pub fn attach_sink(&mut self, sink: Box<dyn UniformSink>) {
        self.sink = Some(sink);
        self.push_all();
    }

    pub fn detach_sink(&mut self) -> Option<Box<dyn UniformSink>> {
        self.sink.take()
    }
}

/// Typed read/write access to one registered module
pub struct ModuleParams<'a> {
    registry: &'a mut ModuleRegistry,
    index: usize,
}

impl ModuleParams<'_> {
    pub fn get<K: ParamKey>(&self, key: K) -> f32 {
        self.registry.entries[self.index].params.get(key)
    }

    /// Clamped write, pushed to the sink; returns the stored value
    pub fn set<K: ParamKey>(&mut self, key: K, value: f32) -> f32 {
        self.registry.set_scalar_at(self.index, key.index(), value)
    }

    pub fn array<K: ParamKey>(&self, key: K) -> &[f32] {
        self.registry.entries[self.index].params.array(key)
    }

    pub fn set_array<K: ParamKey>(&mut self, key: K, values: Vec<f32>) {
        self.registry.set_array_at(self.index, key.index(), values);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.registry.entries[self.index].params.set_enabled(enabled);
        self.registry.push_block(self.index);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::modules::{Collisions, Environment, EnvironmentParam, Fluid, Joints, JointsParam};

    #[derive(Default)]
    struct Recorded {
        uniforms: Vec<(u32, Vec<f32>)>,
        arrays: Vec<(u32, Vec<f32>)>,
    }

    struct RecordingSink(Rc<RefCell<Recorded>>, Option<usize>);

    impl UniformSink for RecordingSink {
        fn write_uniform(&mut self, binding: u32, words: &[f32]) {
            self.0.borrow_mut().uniforms.push((binding, words.to_vec()));
        }

        fn write_array(&mut self, binding: u32, values: &[f32]) {
            self.0.borrow_mut().arrays.push((binding, values.to_vec()));
        }

        fn array_capacity(&self, _binding: u32) -> Option<usize> {
            self.1
        }
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register(Environment::default()).unwrap();
        registry.register(Fluid::default()).unwrap();
        registry.register(Joints::default()).unwrap();
        registry
    }

    #[test]
    fn test_unknown_module_is_error() {
        let mut registry = registry();
        let err = registry.set("gravity", "strength", 1.0).unwrap_err();
        assert!(matches!(err, KernelError::UnknownModule(name) if name == "gravity"));
        assert!(matches!(registry.get("nope", "x"), Err(KernelError::UnknownModule(_))));
    }

    #[test]
    fn test_unknown_param_and_kind_mismatch() {
        let mut registry = registry();
        assert!(matches!(
            registry.set("environment", "wind", 1.0),
            Err(KernelError::UnknownParam { .. })
        ));
        assert!(matches!(
            registry.set("joints", "a_indexes", 1.0),
            Err(KernelError::ParamKind { .. })
        ));
        assert!(matches!(
            registry.get_array("joints", "stiffness"),
            Err(KernelError::ParamKind { .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = registry();
        assert!(registry.register(Collisions::default()).is_ok());
        assert!(matches!(
            registry.register(Collisions::default()),
            Err(KernelError::DuplicateModule(_))
        ));
    }

    #[test]
    fn test_round_trip_with_clamp() {
        let mut registry = registry();
        assert_eq!(registry.set("environment", "gravity_y", -9.5).unwrap(), -9.5);
        assert_eq!(registry.get("environment", "gravity_y").unwrap(), -9.5);

        assert_eq!(registry.set("environment", "momentum", 1.7).unwrap(), 1.0);
        assert_eq!(registry.get("environment", "momentum").unwrap(), 1.0);

        let mut env = registry.handle("environment").unwrap();
        assert_eq!(env.set(EnvironmentParam::Momentum, -2.0), 0.0);
        assert_eq!(env.get(EnvironmentParam::Momentum), 0.0);
    }

    #[test]
    fn test_array_round_trip() {
        let mut registry = registry();
        registry
            .set_array("joints", "rest_lengths", vec![1.0, 2.5])
            .unwrap();
        assert_eq!(registry.get_array("joints", "rest_lengths").unwrap(), &[1.0, 2.5]);
        let handle = registry.handle("joints").unwrap();
        assert_eq!(handle.array(JointsParam::RestLengths), &[1.0, 2.5]);
    }

    #[test]
    fn test_layouts_stable_across_identical_registries() {
        let a = registry();
        let b = registry();
        assert_eq!(a.binding_table(), b.binding_table());
        assert_eq!(a.state_layout(), b.state_layout());
    }

    #[test]
    fn test_writes_reach_sink_at_module_binding() {
        let recorded = Rc::new(RefCell::new(Recorded::default()));
        let mut registry = registry();
        registry.attach_sink(Box::new(RecordingSink(recorded.clone(), None)));
        recorded.borrow_mut().uniforms.clear();
        recorded.borrow_mut().arrays.clear();

        registry.set("environment", "gravity_x", 3.0).unwrap();
        let layout = registry.binding_table().module("environment").unwrap().clone();
        let slot = layout.offset_of("gravity_x").unwrap();
        {
            let rec = recorded.borrow();
            assert_eq!(rec.uniforms.len(), 1);
            assert_eq!(rec.uniforms[0].0, layout.binding);
            assert_eq!(rec.uniforms[0].1[slot.linear() as usize], 3.0);
        }

        registry.set_array("joints", "a_indexes", vec![0.0, 1.0]).unwrap();
        let joints = registry.binding_table().module("joints").unwrap().clone();
        let rec = recorded.borrow();
        assert_eq!(rec.arrays.last().unwrap(), &(joints.arrays[0].binding, vec![0.0, 1.0]));
        // Length slot updated in the block pushed alongside
        let block = &rec.uniforms.last().unwrap().1;
        assert_eq!(block[joints.arrays[0].length_slot.linear() as usize], 2.0);
    }

    #[test]
    fn test_disable_writes_enabled_slot() {
        let recorded = Rc::new(RefCell::new(Recorded::default()));
        let mut registry = registry();
        registry.attach_sink(Box::new(RecordingSink(recorded.clone(), None)));
        registry.set_enabled("fluid", false).unwrap();
        assert!(!registry.is_enabled("fluid").unwrap());
        let rec = recorded.borrow();
        assert_eq!(rec.uniforms.last().unwrap().1[0], 0.0);
    }

    #[test]
    fn test_array_length_clamped_to_sink_capacity() {
        let recorded = Rc::new(RefCell::new(Recorded::default()));
        let mut registry = registry();
        registry.attach_sink(Box::new(RecordingSink(recorded.clone(), Some(2))));

        registry
            .set_array("joints", "rest_lengths", vec![1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let joints = registry.binding_table().module("joints").unwrap().clone();
        let rest = &joints.arrays[2];
        let rec = recorded.borrow();
        let block = &rec.uniforms.last().unwrap().1;
        assert_eq!(block[rest.length_slot.linear() as usize], 2.0);
        // The host keeps the full array
        assert_eq!(registry.get_array("joints", "rest_lengths").unwrap().len(), 4);
    }
}
