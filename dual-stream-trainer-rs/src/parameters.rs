//! Ordered parameter storage with optional gradient buffers.
//!
//! A [`ParameterStore`] is the model-owned view the trainer works on: an
//! ordered list of named tensors (flat, row-major `f32` data plus a shape), each
//! with an optional gradient buffer that exists only once a backward pass has
//! touched the parameter.
//!
//! The enumeration order is fixed at insertion time and never changes; it is
//! the canonical order used by [`crate::gradient`] to flatten and restore
//! gradients.
//!
//! Normalization layers keep running statistics (mean, variance, batch
//! counters) next to their weights. Those are stored with
//! [`ParameterRole::NormStatistic`] and never take part in gradient mixing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{DualResult, DualStreamError};

/// Name fragments that identify normalization running statistics.
const STATISTIC_MARKERS: [&str; 3] = ["running_mean", "running_var", "num_batches_tracked"];

/// How a parameter participates in training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterRole {
    /// Receives gradients and optimizer updates.
    Trainable,
    /// Frozen weight; never part of the gradient layout.
    Frozen,
    /// Normalization running statistic (not gradient-bearing).
    NormStatistic,
}

impl ParameterRole {
    /// Infers the role from a parameter name.
    ///
    /// Names containing `running_mean`, `running_var` or
    /// `num_batches_tracked` are statistics; everything else is trainable.
    #[must_use]
    pub fn infer(name: &str) -> Self {
        if STATISTIC_MARKERS.iter().any(|marker| name.contains(marker)) {
            Self::NormStatistic
        } else {
            Self::Trainable
        }
    }

    /// Returns whether parameters with this role can carry a mixed gradient.
    #[must_use]
    pub fn is_gradient_bearing(self) -> bool {
        matches!(self, Self::Trainable)
    }
}

/// A single named parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
    grad: Option<Vec<f32>>,
    role: ParameterRole,
}

impl Parameter {
    /// Returns the parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tensor shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of scalar elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Returns the flat, row-major values.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the values for in-place updates.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Returns the gradient buffer, if a backward pass populated one.
    #[must_use]
    pub fn grad(&self) -> Option<&[f32]> {
        self.grad.as_deref()
    }

    /// Returns the values together with the gradient buffer.
    ///
    /// Lets optimizers read the gradient while writing the values.
    pub fn data_and_grad_mut(&mut self) -> (&mut [f32], Option<&[f32]>) {
        (&mut self.data, self.grad.as_deref())
    }

    /// Returns whether a gradient buffer is present.
    #[must_use]
    pub fn has_grad(&self) -> bool {
        self.grad.is_some()
    }

    /// Returns the parameter role.
    #[must_use]
    pub fn role(&self) -> ParameterRole {
        self.role
    }

    /// Overwrites the gradient buffer.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `grad` does not have `numel()` elements.
    pub fn set_grad(&mut self, grad: Vec<f32>) -> DualResult<()> {
        if grad.len() != self.data.len() {
            return Err((
                DualStreamError::ShapeMismatch {
                    name: self.name.clone(),
                    expected: self.data.len(),
                    found: grad.len(),
                },
                None,
            ));
        }
        self.grad = Some(grad);
        Ok(())
    }

    /// Adds `grad` into the gradient buffer, creating it when absent.
    ///
    /// This is what a backward pass does: gradients accumulate until the
    /// optimizer clears them.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `grad` does not have `numel()` elements.
    pub fn accumulate_grad(&mut self, grad: &[f32]) -> DualResult<()> {
        if grad.len() != self.data.len() {
            return Err((
                DualStreamError::ShapeMismatch {
                    name: self.name.clone(),
                    expected: self.data.len(),
                    found: grad.len(),
                },
                None,
            ));
        }
        match &mut self.grad {
            Some(existing) => existing.iter_mut().zip(grad).for_each(|(g, d)| *g += d),
            None => self.grad = Some(grad.to_vec()),
        }
        Ok(())
    }

    /// Drops the gradient buffer.
    pub fn clear_grad(&mut self) {
        self.grad = None;
    }
}

/// Ordered mapping from parameter name to tensor and optional gradient.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter at the end of the canonical order.
    ///
    /// # Errors
    ///
    /// Returns `ParameterError` for duplicate names and `ShapeMismatch` when
    /// `data.len()` disagrees with the product of `shape`.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<f32>,
        role: ParameterRole,
    ) -> DualResult<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err((
                DualStreamError::ParameterError {
                    detail: format!("duplicate parameter '{name}'"),
                },
                None,
            ));
        }

        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err((
                DualStreamError::ShapeMismatch {
                    name,
                    expected,
                    found: data.len(),
                },
                None,
            ));
        }

        self.index.insert(name.clone(), self.params.len());
        self.params.push(Parameter {
            name,
            shape,
            data,
            grad: None,
            role,
        });
        Ok(())
    }

    /// Appends a parameter whose role is inferred from its name.
    ///
    /// # Errors
    ///
    /// Same as [`ParameterStore::insert`].
    pub fn insert_named(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<f32>,
    ) -> DualResult<()> {
        let name = name.into();
        let role = ParameterRole::infer(&name);
        self.insert(name, shape, data, role)
    }

    /// Number of parameters (not scalars).
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Returns whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterates parameters in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Iterates parameters mutably in canonical order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    /// Returns the parameter at a canonical position.
    #[must_use]
    pub fn get_index(&self, position: usize) -> Option<&Parameter> {
        self.params.get(position)
    }

    /// Returns the parameter at a canonical position, mutably.
    pub fn get_index_mut(&mut self, position: usize) -> Option<&mut Parameter> {
        self.params.get_mut(position)
    }

    /// Looks up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Looks up a parameter by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        match self.index.get(name) {
            Some(&i) => self.params.get_mut(i),
            None => None,
        }
    }

    /// Accumulates a gradient into the named parameter.
    ///
    /// # Errors
    ///
    /// Returns `ParameterError` for unknown names, or `ShapeMismatch`.
    pub fn accumulate_grad(&mut self, name: &str, grad: &[f32]) -> DualResult<()> {
        let param = self.get_mut(name).ok_or_else(|| {
            (
                DualStreamError::ParameterError {
                    detail: format!("unknown parameter '{name}'"),
                },
                None,
            )
        })?;
        param.accumulate_grad(grad)
    }

    /// Total scalar count of gradient-bearing parameters.
    #[must_use]
    pub fn trainable_numel(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.role.is_gradient_bearing())
            .map(Parameter::numel)
            .sum()
    }

    /// Returns whether any normalization statistics are stored.
    #[must_use]
    pub fn has_norm_statistics(&self) -> bool {
        self.params
            .iter()
            .any(|p| p.role == ParameterRole::NormStatistic)
    }

    /// Zero-fills every existing gradient buffer.
    ///
    /// Buffers that exist stay present (with zeros); buffers that never
    /// existed stay absent.
    pub fn zero_grad(&mut self) {
        for param in &mut self.params {
            if let Some(grad) = &mut param.grad {
                grad.fill(0.0);
            }
        }
    }

    /// Drops every gradient buffer.
    pub fn clear_grads(&mut self) {
        self.params.iter_mut().for_each(Parameter::clear_grad);
    }

    /// Snapshot of all parameter values, in canonical order.
    #[must_use]
    pub fn values_snapshot(&self) -> Vec<Vec<f32>> {
        self.params.iter().map(|p| p.data.clone()).collect()
    }

    /// Snapshot of all gradient buffers, in canonical order.
    #[must_use]
    pub fn grads_snapshot(&self) -> Vec<Option<Vec<f32>>> {
        self.params.iter().map(|p| p.grad.clone()).collect()
    }
}
