//! Candle adapter.
//!
//! Bridges a Candle [`VarMap`] and the [`GradStore`] returned by
//! `Tensor::backward` to a [`ParameterStore`], so a Candle model can implement
//! [`Model`](crate::Model):
//!
//! - `backward` calls [`CandleParameters::accumulate_grads`]
//! - after the optimizer step, [`CandleParameters::write_values`] pushes the
//!   updated values back into the variables
//!
//! Variables are ordered by name, which gives a stable canonical order across
//! runs of the same architecture.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{DualResult, DualStreamError};
use crate::parameters::ParameterStore;

fn candle_error(detail: impl std::fmt::Display) -> (DualStreamError, Option<crate::RecoveryAction>) {
    (
        DualStreamError::IntegrationError {
            crate_name: "candle".to_string(),
            detail: detail.to_string(),
        },
        None,
    )
}

fn tensor_values(tensor: &Tensor) -> DualResult<Vec<f32>> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(candle_core::DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(candle_error)
}

/// Named Candle variables in canonical order.
pub struct CandleParameters {
    names: Vec<String>,
    vars: Vec<Var>,
}

impl CandleParameters {
    /// Collects the variables of `varmap`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns a fatal `IntegrationError` if the map's lock is poisoned.
    pub fn from_varmap(varmap: &VarMap) -> DualResult<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| candle_error(format!("VarMap lock poisoned: {e}")))?;
        let mut entries: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let (names, vars) = entries.into_iter().unzip();
        Ok(Self { names, vars })
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether there are no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Builds a parameter store holding the current variable values.
    ///
    /// Roles are inferred from the variable names.
    pub fn to_store(&self) -> DualResult<ParameterStore> {
        let mut store = ParameterStore::new();
        for (name, var) in self.names.iter().zip(&self.vars) {
            let values = tensor_values(var.as_tensor())?;
            store.insert_named(name.clone(), var.dims().to_vec(), values)?;
        }
        Ok(store)
    }

    /// Adds the gradients in `grads` to the store's gradient buffers.
    ///
    /// Variables absent from `grads` keep their buffer untouched, so their
    /// presence flag is preserved.
    pub fn accumulate_grads(&self, grads: &GradStore, store: &mut ParameterStore) -> DualResult<()> {
        for (name, var) in self.names.iter().zip(&self.vars) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                store.accumulate_grad(name, &tensor_values(grad)?)?;
            }
        }
        Ok(())
    }

    /// Writes the store's gradients into `grads`, replacing existing entries.
    pub fn write_grads(&self, store: &ParameterStore, grads: &mut GradStore) -> DualResult<()> {
        for (name, var) in self.names.iter().zip(&self.vars) {
            let Some(grad) = store.get(name).and_then(|p| p.grad()) else {
                continue;
            };
            let tensor = Tensor::from_slice(grad, var.dims(), var.device())
                .and_then(|t| t.to_dtype(var.dtype()))
                .map_err(candle_error)?;
            grads.insert(var.as_tensor(), tensor);
        }
        Ok(())
    }

    /// Copies the store's values into the Candle variables.
    pub fn write_values(&self, store: &ParameterStore) -> DualResult<()> {
        for (name, var) in self.names.iter().zip(&self.vars) {
            let Some(param) = store.get(name) else {
                return Err(candle_error(format!("parameter '{name}' missing from store")));
            };
            let tensor = Tensor::from_slice(param.data(), var.dims(), var.device())
                .and_then(|t| t.to_dtype(var.dtype()))
                .map_err(candle_error)?;
            var.set(&tensor).map_err(candle_error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_roundtrip_through_store() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((2, 2), "head.weight", Init::Const(1.0)).unwrap();
        let _b = vb.get_with_hints(2, "head.bias", Init::Const(0.0)).unwrap();

        let params = CandleParameters::from_varmap(&varmap).unwrap();
        assert_eq!(params.len(), 2);
        let mut store = params.to_store().unwrap();
        assert_eq!(store.iter().next().unwrap().name(), "head.bias");

        let loss = w.sum_all().unwrap();
        let grads = loss.backward().unwrap();
        params.accumulate_grads(&grads, &mut store).unwrap();
        assert_eq!(store.get("head.weight").unwrap().grad(), Some(&[1.0; 4][..]));

        store.get_mut("head.weight").unwrap().data_mut()[0] = 3.0;
        params.write_values(&store).unwrap();
        let updated = tensor_values(&w).unwrap();
        assert!((updated[0] - 3.0).abs() < 1e-6);
    }
}
