//! Resolved parameter values of one module

use super::descriptor::{ParamDecl, ParamKey, ParamKind};

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(f32),
    Array(Vec<f32>),
}

/// Current values of a module's declared parameters, indexed by declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBag {
    enabled: bool,
    values: Vec<ParamValue>,
}

impl ParamBag {
    /// Defaults for every declaration, enabled
    pub fn from_decls(decls: &[ParamDecl]) -> Self {
        let values = decls
            .iter()
            .map(|d| match d.kind {
                ParamKind::Scalar => ParamValue::Scalar(d.clamp(d.default)),
                ParamKind::Array => ParamValue::Array(Vec::new()),
            })
            .collect();
        Self {
            enabled: true,
            values,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    /// Scalar at a declaration index (0 for arrays and out-of-range indices)
    pub fn scalar_at(&self, index: usize) -> f32 {
        match self.values.get(index) {
            Some(ParamValue::Scalar(v)) => *v,
            _ => 0.0,
        }
    }

    /// Array at a declaration index (empty for scalars and out-of-range indices)
    pub fn array_at(&self, index: usize) -> &[f32] {
        match self.values.get(index) {
            Some(ParamValue::Array(v)) => v,
            _ => &[],
        }
    }

    pub fn set_scalar_at(&mut self, index: usize, value: f32) {
        if let Some(slot @ ParamValue::Scalar(_)) = self.values.get_mut(index) {
            *slot = ParamValue::Scalar(value);
        }
    }

    pub fn set_array_at(&mut self, index: usize, values: Vec<f32>) {
        if let Some(slot @ ParamValue::Array(_)) = self.values.get_mut(index) {
            *slot = ParamValue::Array(values);
        }
    }

    #[inline]
    pub fn get<K: ParamKey>(&self, key: K) -> f32 {
        self.scalar_at(key.index())
    }

    #[inline]
    pub fn array<K: ParamKey>(&self, key: K) -> &[f32] {
        self.array_at(key.index())
    }

    /// Typed scalar write, clamped to the declared range
    pub fn set<K: ParamKey>(&mut self, key: K, value: f32) -> &mut Self {
        self.set_scalar_at(key.index(), key.decl().clamp(value));
        self
    }

    pub fn set_array<K: ParamKey>(&mut self, key: K, values: Vec<f32>) -> &mut Self {
        self.set_array_at(key.index(), values);
        self
    }
}
