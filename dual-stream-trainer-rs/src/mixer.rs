//! Alignment-based gradient mixing.
//!
//! Given the base gradient `b` and the novel gradient `n` of the same
//! iteration, the mixer measures how much of `n` points along `b`:
//!
//! ```text
//! angle_base     = 1 − dot(b, n) / ‖b‖²
//! dynamic_lambda = max(general_converge, angle_base)
//! new_grad       = dynamic_lambda · b + n
//! ```
//!
//! `angle_base` is 0 when the gradients are identical and 1 when they are
//! orthogonal. It exceeds 1 when the novel gradient opposes the base gradient,
//! so conflicting novel updates are counterweighted by a larger base share.
//! The coefficient is deliberately left unclamped.

use serde::{Deserialize, Serialize};

use crate::error::{self, DualResult, DualStreamError};
use crate::gradient::GradientVector;

/// Per-iteration mixing coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixingDecision {
    /// Convergence signal from the base-loss EMA.
    pub general_converge: f32,
    /// Alignment signal between the base and novel gradients.
    pub angle_base: f32,
    /// Coefficient applied to the base gradient.
    pub dynamic_lambda: f32,
}

/// Combines base and novel gradients.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientMixer;

impl GradientMixer {
    /// Creates a mixer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Computes `1 − dot(base, novel) / ‖base‖²`.
    ///
    /// `iteration` is only used to label errors.
    ///
    /// # Errors
    ///
    /// Returns a recoverable `LayoutMismatch` for incompatible vectors and a
    /// recoverable `NumericalInstability` when `‖base‖²` is zero or the result
    /// is not finite.
    pub fn angle_signal(
        &self,
        base: &GradientVector,
        novel: &GradientVector,
        iteration: u64,
    ) -> DualResult<f32> {
        let dot = base.dot(novel)?;
        let norm_sq = base.squared_norm();
        if norm_sq == 0.0 {
            return error::skip(DualStreamError::NumericalInstability {
                detail: "base gradient has zero norm".to_string(),
                iteration,
            });
        }

        let angle = (1.0 - dot / norm_sq) as f32;
        if !angle.is_finite() {
            return error::skip(DualStreamError::NumericalInstability {
                detail: format!("angle signal is not finite (dot {dot}, norm² {norm_sq})"),
                iteration,
            });
        }
        Ok(angle)
    }

    /// Returns `max(general_converge, angle_base)`.
    #[must_use]
    pub fn dynamic_lambda(&self, general_converge: f32, angle_base: f32) -> f32 {
        general_converge.max(angle_base)
    }

    /// Returns `dynamic_lambda · base + novel` together with the coefficients used.
    ///
    /// # Errors
    ///
    /// Returns a recoverable `LayoutMismatch` for incompatible vectors.
    pub fn combine(
        &self,
        base: &GradientVector,
        novel: &GradientVector,
        general_converge: f32,
        angle_base: f32,
    ) -> DualResult<(GradientVector, MixingDecision)> {
        let dynamic_lambda = self.dynamic_lambda(general_converge, angle_base);
        let mixed = base.scaled_add(dynamic_lambda, novel)?;
        Ok((
            mixed,
            MixingDecision {
                general_converge,
                angle_base,
                dynamic_lambda,
            },
        ))
    }

    /// Computes the angle signal and combines in one call.
    ///
    /// # Errors
    ///
    /// Same as [`GradientMixer::angle_signal`] and [`GradientMixer::combine`].
    pub fn mix(
        &self,
        base: &GradientVector,
        novel: &GradientVector,
        general_converge: f32,
        iteration: u64,
    ) -> DualResult<(GradientVector, MixingDecision)> {
        let angle_base = self.angle_signal(base, novel, iteration)?;
        self.combine(base, novel, general_converge, angle_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient::GradientLayout;
    use crate::parameters::ParameterStore;

    fn layout() -> GradientLayout {
        let mut store = ParameterStore::new();
        store.insert_named("w", vec![2], vec![0.0; 2]).unwrap();
        GradientLayout::from_store(&store)
    }

    fn vector(layout: &GradientLayout, values: &[f32]) -> GradientVector {
        GradientVector::from_parts(layout, values.to_vec(), vec![true]).unwrap()
    }

    #[test]
    fn test_orthogonal_mix() {
        let layout = layout();
        let base = vector(&layout, &[1.0, 0.0]);
        let novel = vector(&layout, &[0.0, 1.0]);

        let (mixed, decision) = GradientMixer::new().mix(&base, &novel, 1.75, 0).unwrap();
        assert!((decision.angle_base - 1.0).abs() < 1e-6);
        assert!((decision.dynamic_lambda - 1.75).abs() < 1e-6);
        assert!((mixed.values()[0] - 1.75).abs() < 1e-6);
        assert!((mixed.values()[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_identical_gradients_have_zero_angle() {
        let layout = layout();
        let g = vector(&layout, &[0.3, -2.0]);
        let angle = GradientMixer::new().angle_signal(&g, &g, 0).unwrap();
        assert!(angle.abs() < 1e-6);
    }

    #[test]
    fn test_opposed_gradients_exceed_one() {
        let layout = layout();
        let base = vector(&layout, &[1.0, 1.0]);
        let novel = vector(&layout, &[-1.0, -1.0]);
        let angle = GradientMixer::new().angle_signal(&base, &novel, 0).unwrap();
        assert!((angle - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_lambda_never_below_converge() {
        let mixer = GradientMixer::new();
        for (converge, angle) in [(1.75, 0.2), (-0.5, -3.0), (0.0, 1.0), (2.0, 2.0)] {
            assert!(mixer.dynamic_lambda(converge, angle) >= converge);
            assert!(mixer.dynamic_lambda(converge, angle) >= angle);
        }
    }

    #[test]
    fn test_zero_base_norm_is_skipped() {
        let layout = layout();
        let base = vector(&layout, &[0.0, 0.0]);
        let novel = vector(&layout, &[1.0, 0.0]);
        let (err, action) = GradientMixer::new()
            .angle_signal(&base, &novel, 412)
            .unwrap_err();
        assert!(matches!(
            err,
            DualStreamError::NumericalInstability { iteration: 412, .. }
        ));
        assert!(error::is_recoverable(action.as_ref()));
    }

    #[test]
    fn test_mask_mismatch_is_rejected() {
        let mut store = ParameterStore::new();
        store.insert_named("a", vec![1], vec![0.0]).unwrap();
        store.insert_named("b", vec![1], vec![0.0]).unwrap();
        let layout = GradientLayout::from_store(&store);
        let base = GradientVector::from_parts(&layout, vec![1.0, 2.0], vec![true, true]).unwrap();
        let novel = GradientVector::from_parts(&layout, vec![1.0], vec![true, false]).unwrap();

        let (err, _) = GradientMixer::new().mix(&base, &novel, 1.0, 0).unwrap_err();
        assert!(matches!(err, DualStreamError::LayoutMismatch { .. }));
    }
}
