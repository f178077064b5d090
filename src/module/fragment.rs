//! GPU capability object handed to a module's fragment generator
//!
//! Every accessor returns a WGSL expression (or statement) as text. Inside a
//! generated phase function the following names are in scope:
//! `index` (u32, this particle), `particle` (mutable local copy of the
//! record), `sim.dt`, `particles_prev` (phase-start snapshot) and
//! `sim_state` (scratch table).

use std::cell::RefCell;

use super::descriptor::ParamKey;
use crate::consts::{SLOT_POST_X, SLOT_POST_Y, SLOT_PRE_X, SLOT_PRE_Y};
use crate::gpu::layout::{ModuleLayout, array_var};
use crate::sim::state::StateLayout;

pub struct FragmentAccessors<'a> {
    layout: &'a ModuleLayout,
    state: &'a StateLayout,
    /// Accessor misuse collected while generating; turned into a build error
    errors: RefCell<Vec<String>>,
}

impl<'a> FragmentAccessors<'a> {
    pub fn new(layout: &'a ModuleLayout, state: &'a StateLayout) -> Self {
        Self {
            layout,
            state,
            errors: RefCell::new(Vec::new()),
        }
    }

    fn fail(&self, message: String) -> String {
        self.errors.borrow_mut().push(message);
        "0.0".to_string()
    }

    /// Messages for every invalid accessor call so far
    pub fn take_errors(&self) -> Vec<String> {
        std::mem::take(&mut *self.errors.borrow_mut())
    }

    pub fn dt(&self) -> &'static str {
        "sim.dt"
    }

    /// Scalar parameter value
    pub fn uniform<K: ParamKey>(&self, key: K) -> String {
        match self.layout.scalar(key.index()) {
            Some(entry) => self.layout.wgsl_slot(entry.slot),
            None => self.fail(format!("`{}` is not a scalar of `{}`", key.name(), self.layout.module)),
        }
    }

    /// Element `index_expr` of an array parameter
    pub fn uniform_at<K: ParamKey>(&self, key: K, index_expr: &str) -> String {
        match self.layout.array(key.index()) {
            Some(entry) => format!("{}[{index_expr}]", array_var(&self.layout.module, entry.name)),
            None => self.fail(format!("`{}` is not an array of `{}`", key.name(), self.layout.module)),
        }
    }

    /// Element count of an array parameter, as u32
    pub fn array_len<K: ParamKey>(&self, key: K) -> String {
        match self.layout.array(key.index()) {
            Some(entry) => format!("u32({})", self.layout.wgsl_slot(entry.length_slot)),
            None => self.fail(format!("`{}` is not an array of `{}`", key.name(), self.layout.module)),
        }
    }

    fn state_index(&self, module: &str, field: &str, index_expr: &str) -> Option<String> {
        self.state
            .slot(module, field)
            .map(|slot| format!("sim_state[({index_expr}) * STATE_STRIDE + {slot}u]"))
    }

    /// This module's scratch field for this particle (readable and assignable)
    pub fn state(&self, field: &str) -> String {
        self.state_of(field, "index")
    }

    /// This module's scratch field for the particle at `index_expr`
    pub fn state_of(&self, field: &str, index_expr: &str) -> String {
        let module = self.layout.module.as_str();
        self.state_index(module, field, index_expr)
            .unwrap_or_else(|| self.fail(format!("no state field `{field}` on `{module}`")))
    }

    /// A scratch field declared by another module
    pub fn foreign_state(&self, module: &str, field: &str, index_expr: &str) -> String {
        self.state_index(module, field, index_expr)
            .unwrap_or_else(|| self.fail(format!("no state field `{field}` on `{module}`")))
    }

    pub fn pre_position(&self) -> String {
        slot_pair(SLOT_PRE_X, SLOT_PRE_Y)
    }

    pub fn post_position(&self) -> String {
        slot_pair(SLOT_POST_X, SLOT_POST_Y)
    }

    /// Statement storing `value_expr` (a vec2) as the post-integration position
    pub fn set_post_position(&self, value_expr: &str) -> String {
        format!(
            "sim_state[index * STATE_STRIDE + {SLOT_POST_X}u] = ({value_expr}).x;\n\
             sim_state[index * STATE_STRIDE + {SLOT_POST_Y}u] = ({value_expr}).y;"
        )
    }

    /// Another particle's record from the phase-start snapshot
    pub fn other(&self, index_expr: &str) -> String {
        format!("particles_prev[{index_expr}]")
    }

    /// Loop over live neighbours within `radius_expr` of `point_expr`.
    /// `body` sees `other_index` (u32) and `other` (particle record).
    pub fn for_each_neighbor(&self, point_expr: &str, radius_expr: &str, body: &str) -> String {
        format!(
            "{{\n\
             var cursor = neighbor_iter_init({point_expr}, {radius_expr});\n\
             loop {{\n\
             let other_index = neighbor_iter_next(&cursor);\n\
             if (other_index == NEIGHBOR_END) {{ break; }}\n\
             if (other_index == index) {{ continue; }}\n\
             let other = particles_prev[other_index];\n\
             if (other.mass == 0.0) {{ continue; }}\n\
             {body}\n\
             }}\n\
             }}"
        )
    }
}

fn slot_pair(x: u32, y: u32) -> String {
    format!(
        "vec2<f32>(sim_state[index * STATE_STRIDE + {x}u], sim_state[index * STATE_STRIDE + {y}u])"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::layout::ModuleLayout;
    use crate::module::Module;
    use crate::modules::{Fluid, FluidParam, Joints, JointsParam};

    #[test]
    fn test_uniform_and_state_expressions() {
        let fluid = Fluid::default();
        let mut next = 7;
        let layout = ModuleLayout::pack(&fluid, &mut next);
        let state = StateLayout::build([(fluid.name(), fluid.state_fields())]);
        let acc = FragmentAccessors::new(&layout, &state);

        assert_eq!(acc.uniform(FluidParam::InfluenceRadius), "u_fluid[0].y");
        assert_eq!(
            acc.state("density"),
            "sim_state[(index) * STATE_STRIDE + 4u]"
        );
        assert!(acc.take_errors().is_empty());
    }

    #[test]
    fn test_misuse_is_collected() {
        let joints = Joints::default();
        let mut next = 7;
        let layout = ModuleLayout::pack(&joints, &mut next);
        let state = StateLayout::default();
        let acc = FragmentAccessors::new(&layout, &state);

        assert_eq!(acc.uniform(JointsParam::AIndexes), "0.0");
        assert_eq!(acc.state("missing"), "0.0");
        assert_eq!(acc.take_errors().len(), 2);
        assert!(acc.take_errors().is_empty());
    }

    #[test]
    fn test_array_accessors() {
        let joints = Joints::default();
        let mut next = 7;
        let layout = ModuleLayout::pack(&joints, &mut next);
        let state = StateLayout::default();
        let acc = FragmentAccessors::new(&layout, &state);

        assert_eq!(acc.uniform_at(JointsParam::RestLengths, "j"), "a_joints_rest_lengths[j]");
        assert_eq!(acc.array_len(JointsParam::AIndexes), "u32(u_joints[0].w)");
    }
}
