//! Flattening and restoring model gradients as a single dense vector.
//!
//! Gradient mixing works on one vector per data stream. This module turns the
//! per-parameter gradient buffers of a [`ParameterStore`] into a
//! [`GradientVector`] and writes a (mixed) vector back.
//!
//! # Layout
//!
//! The parameters that can carry a gradient are fixed once, at construction,
//! by a [`GradientLayout`]: every trainable parameter in canonical order,
//! excluding frozen weights and normalization statistics. The layout carries a
//! fingerprint of the store it was built from.
//!
//! # The has-gradient mask
//!
//! A parameter that has no gradient buffer is skipped entirely, not
//! zero-filled, so the meaning of index `i` in a vector depends on which
//! parameters had gradients at capture time. Every [`GradientVector`] records
//! that subset as a mask. Two vectors can only be combined, and a vector can
//! only be assigned back, when the masks agree; otherwise the operation fails
//! with [`DualStreamError::LayoutMismatch`] instead of silently mixing unrelated
//! parameters.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{self, DualResult, DualStreamError};
use crate::parameters::ParameterStore;

/// One gradient-bearing parameter of the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    /// Canonical position in the parameter store.
    pub position: usize,
    /// Parameter name.
    pub name: String,
    /// Scalar count.
    pub numel: usize,
}

/// The fixed set of gradient-bearing parameters of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradientLayout {
    entries: Vec<LayoutEntry>,
    store_len: usize,
    fingerprint: u64,
}

impl GradientLayout {
    /// Builds the layout of a parameter store.
    ///
    /// Only [`crate::parameters::ParameterRole::Trainable`] parameters are
    /// included.
    #[must_use]
    pub fn from_store(store: &ParameterStore) -> Self {
        let entries = store
            .iter()
            .enumerate()
            .filter(|(_, p)| p.role().is_gradient_bearing())
            .map(|(position, p)| LayoutEntry {
                position,
                name: p.name().to_string(),
                numel: p.numel(),
            })
            .collect();

        Self {
            entries,
            store_len: store.len(),
            fingerprint: fingerprint(store),
        }
    }

    /// Returns the layout entries in canonical order.
    #[must_use]
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Total scalar count when every entry has a gradient.
    #[must_use]
    pub fn total_numel(&self) -> usize {
        self.entries.iter().map(|e| e.numel).sum()
    }

    /// Fingerprint of the store structure (names, shapes, roles).
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Returns which layout entries currently have a gradient buffer.
    ///
    /// # Errors
    ///
    /// Fails if the store no longer matches the layout.
    pub fn current_mask(&self, store: &ParameterStore) -> DualResult<Vec<bool>> {
        self.check_store(store)?;
        Ok(self
            .entries
            .iter()
            .map(|e| store.get_index(e.position).is_some_and(|p| p.has_grad()))
            .collect())
    }

    /// Verifies the store still has the structure the layout was built from.
    fn check_store(&self, store: &ParameterStore) -> DualResult<()> {
        let same_shape = store.len() == self.store_len
            && self.entries.iter().all(|e| {
                store
                    .get_index(e.position)
                    .is_some_and(|p| p.name() == e.name && p.numel() == e.numel)
            });
        if same_shape {
            Ok(())
        } else {
            // The architecture is fixed after construction; a changed store is a bug.
            error::fatal(DualStreamError::LayoutMismatch {
                detail: format!(
                    "parameter store changed since the layout was built ({} parameters, layout expects {})",
                    store.len(),
                    self.store_len
                ),
            })
        }
    }
}

fn fingerprint(store: &ParameterStore) -> u64 {
    let mut hasher = DefaultHasher::new();
    for param in store.iter() {
        param.name().hash(&mut hasher);
        param.shape().hash(&mut hasher);
        param.role().hash(&mut hasher);
    }
    hasher.finish()
}

/// Dense concatenation of gradient buffers, with the mask it was captured under.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientVector {
    values: Vec<f32>,
    mask: Vec<bool>,
    fingerprint: u64,
}

impl GradientVector {
    /// Builds a vector for a layout with an explicit mask.
    ///
    /// # Errors
    ///
    /// Fails with `LayoutMismatch` if the mask length or the value count does
    /// not match the layout.
    pub fn from_parts(layout: &GradientLayout, values: Vec<f32>, mask: Vec<bool>) -> DualResult<Self> {
        if mask.len() != layout.entries.len() {
            return error::fatal(DualStreamError::LayoutMismatch {
                detail: format!(
                    "mask has {} entries, layout has {}",
                    mask.len(),
                    layout.entries.len()
                ),
            });
        }
        let expected = masked_numel(layout, &mask);
        if values.len() != expected {
            return error::fatal(DualStreamError::LayoutMismatch {
                detail: format!("vector has {} values, mask selects {expected}", values.len()),
            });
        }
        Ok(Self {
            values,
            mask,
            fingerprint: layout.fingerprint,
        })
    }

    /// Returns the flat values.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Returns the has-gradient mask, one entry per layout entry.
    #[must_use]
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Number of scalars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns whether the vector holds no scalars.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fails unless `other` was captured under the same layout and mask.
    ///
    /// # Errors
    ///
    /// Returns a recoverable `LayoutMismatch`.
    pub fn ensure_compatible(&self, other: &Self) -> DualResult<()> {
        if self.fingerprint != other.fingerprint {
            return error::skip(DualStreamError::LayoutMismatch {
                detail: "vectors were captured from different parameter layouts".to_string(),
            });
        }
        if self.mask != other.mask {
            let differing = self
                .mask
                .iter()
                .zip(&other.mask)
                .filter(|(a, b)| a != b)
                .count();
            return error::skip(DualStreamError::LayoutMismatch {
                detail: format!("{differing} parameters differ in gradient presence"),
            });
        }
        Ok(())
    }

    /// Dot product with a compatible vector, accumulated in `f64`.
    ///
    /// # Errors
    ///
    /// Returns `LayoutMismatch` for incompatible vectors.
    pub fn dot(&self, other: &Self) -> DualResult<f64> {
        self.ensure_compatible(other)?;
        Ok(dot(&self.values, &other.values))
    }

    /// Squared L2 norm, accumulated in `f64`.
    #[must_use]
    pub fn squared_norm(&self) -> f64 {
        squared_norm(&self.values)
    }

    /// Returns `scale * self + other`.
    ///
    /// # Errors
    ///
    /// Returns `LayoutMismatch` for incompatible vectors.
    pub fn scaled_add(&self, scale: f32, other: &Self) -> DualResult<Self> {
        self.ensure_compatible(other)?;
        let values = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| scale * a + b)
            .collect();
        Ok(Self {
            values,
            mask: self.mask.clone(),
            fingerprint: self.fingerprint,
        })
    }
}

fn masked_numel(layout: &GradientLayout, mask: &[bool]) -> usize {
    layout
        .entries
        .iter()
        .zip(mask)
        .filter(|(_, &present)| present)
        .map(|(e, _)| e.numel)
        .sum()
}

/// Dot product of two equally long slices, accumulated in `f64`.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum()
}

/// Squared L2 norm of a slice, accumulated in `f64`.
#[must_use]
pub fn squared_norm(a: &[f32]) -> f64 {
    a.iter().map(|&x| f64::from(x) * f64::from(x)).sum()
}

/// Concatenates the gradients of every layout parameter that has one.
///
/// Parameters without a gradient buffer are skipped; the returned vector's
/// mask records which ones contributed.
///
/// # Errors
///
/// Fails if the store no longer matches the layout, or a gradient buffer has
/// the wrong size.
pub fn flatten(layout: &GradientLayout, store: &ParameterStore) -> DualResult<GradientVector> {
    layout.check_store(store)?;

    let mut values = Vec::with_capacity(layout.total_numel());
    let mut mask = Vec::with_capacity(layout.entries.len());
    for entry in &layout.entries {
        let param = store.get_index(entry.position).ok_or_else(|| {
            (
                DualStreamError::ParameterError {
                    detail: format!("missing parameter at position {}", entry.position),
                },
                None,
            )
        })?;
        match param.grad() {
            Some(grad) if grad.len() == entry.numel => {
                values.extend_from_slice(grad);
                mask.push(true);
            }
            Some(grad) => {
                return Err((
                    DualStreamError::ShapeMismatch {
                        name: entry.name.clone(),
                        expected: entry.numel,
                        found: grad.len(),
                    },
                    None,
                ));
            }
            None => mask.push(false),
        }
    }

    Ok(GradientVector {
        values,
        mask,
        fingerprint: layout.fingerprint,
    })
}

/// Writes a gradient vector back into the store's gradient buffers.
///
/// Slices are consumed in canonical order under the same skip rule as
/// [`flatten`]. The store's current has-gradient subset must equal the
/// vector's mask.
///
/// # Errors
///
/// Returns a recoverable `LayoutMismatch` when the subsets differ, and a
/// fatal one when the store structure changed.
pub fn assign(
    layout: &GradientLayout,
    store: &mut ParameterStore,
    vector: &GradientVector,
) -> DualResult<()> {
    if vector.fingerprint != layout.fingerprint {
        return error::fatal(DualStreamError::LayoutMismatch {
            detail: "vector was captured from a different parameter layout".to_string(),
        });
    }
    let current = layout.current_mask(store)?;
    if current != vector.mask {
        return error::skip(DualStreamError::LayoutMismatch {
            detail: "gradient presence changed between capture and assignment".to_string(),
        });
    }

    let mut offset = 0;
    for (entry, _) in layout.entries.iter().zip(&vector.mask).filter(|(_, &p)| p) {
        let slice = vector
            .values
            .get(offset..offset + entry.numel)
            .ok_or_else(|| {
                (
                    DualStreamError::LayoutMismatch {
                        detail: format!("vector too short for '{}'", entry.name),
                    },
                    None,
                )
            })?;
        if let Some(param) = store.get_index_mut(entry.position) {
            param.set_grad(slice.to_vec())?;
        }
        offset += entry.numel;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParameterRole;

    fn store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert_named("a.weight", vec![2, 2], vec![0.0; 4]).unwrap();
        store.insert_named("a.bn.running_mean", vec![2], vec![0.0; 2]).unwrap();
        store
            .insert("frozen.weight", vec![3], vec![0.0; 3], ParameterRole::Frozen)
            .unwrap();
        store.insert_named("b.bias", vec![3], vec![0.0; 3]).unwrap();
        store
    }

    #[test]
    fn test_layout_excludes_statistics_and_frozen() {
        let layout = GradientLayout::from_store(&store());
        let names: Vec<&str> = layout.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.weight", "b.bias"]);
        assert_eq!(layout.total_numel(), 7);
    }

    #[test]
    fn test_flatten_skips_missing_gradients() {
        let mut store = store();
        let layout = GradientLayout::from_store(&store);
        store.accumulate_grad("b.bias", &[1.0, 2.0, 3.0]).unwrap();

        let vector = flatten(&layout, &store).unwrap();
        assert_eq!(vector.values(), &[1.0, 2.0, 3.0]);
        assert_eq!(vector.mask(), &[false, true]);
    }

    #[test]
    fn test_flatten_row_major_order() {
        let mut store = store();
        let layout = GradientLayout::from_store(&store);
        store.accumulate_grad("a.weight", &[1.0, 2.0, 3.0, 4.0]).unwrap();
        store.accumulate_grad("b.bias", &[5.0, 6.0, 7.0]).unwrap();
        // Statistics never contribute, even with a buffer.
        store.accumulate_grad("a.bn.running_mean", &[9.0, 9.0]).unwrap();

        let vector = flatten(&layout, &store).unwrap();
        assert_eq!(vector.values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_assign_roundtrip() {
        let mut store = store();
        let layout = GradientLayout::from_store(&store);
        store.accumulate_grad("a.weight", &[0.0; 4]).unwrap();
        store.accumulate_grad("b.bias", &[0.0; 3]).unwrap();

        let mask = layout.current_mask(&store).unwrap();
        let v = GradientVector::from_parts(
            &layout,
            vec![0.5, -1.0, 2.0, 0.25, 3.0, -4.0, 1e-3],
            mask,
        )
        .unwrap();
        assign(&layout, &mut store, &v).unwrap();

        assert_eq!(flatten(&layout, &store).unwrap(), v);
        assert_eq!(
            store.get("a.weight").unwrap().grad(),
            Some(&[0.5, -1.0, 2.0, 0.25][..])
        );
    }

    #[test]
    fn test_assign_rejects_changed_presence() {
        let mut store = store();
        let layout = GradientLayout::from_store(&store);
        store.accumulate_grad("b.bias", &[1.0; 3]).unwrap();
        let captured = flatten(&layout, &store).unwrap();

        store.accumulate_grad("a.weight", &[1.0; 4]).unwrap();
        let (err, action) = assign(&layout, &mut store, &captured).unwrap_err();
        assert!(matches!(err, DualStreamError::LayoutMismatch { .. }));
        assert!(error::is_recoverable(action.as_ref()));
    }

    #[test]
    fn test_incompatible_masks_cannot_be_combined() {
        let mut store = store();
        let layout = GradientLayout::from_store(&store);
        store.accumulate_grad("b.bias", &[1.0; 3]).unwrap();
        let partial = flatten(&layout, &store).unwrap();
        store.accumulate_grad("a.weight", &[1.0; 4]).unwrap();
        let full = flatten(&layout, &store).unwrap();

        assert!(partial.dot(&full).is_err());
        assert!(partial.scaled_add(1.0, &full).is_err());
    }

    #[test]
    fn test_changed_store_is_fatal() {
        let store_a = store();
        let layout = GradientLayout::from_store(&store_a);
        let mut other = store();
        other.insert_named("extra.weight", vec![1], vec![0.0]).unwrap();

        let (_, action) = flatten(&layout, &other).unwrap_err();
        assert!(action.is_none());
    }

    #[test]
    fn test_dot_and_norm() {
        assert!((dot(&[1.0, 2.0], &[3.0, 4.0]) - 11.0).abs() < 1e-12);
        assert!((squared_norm(&[3.0, 4.0]) - 25.0).abs() < 1e-12);
    }
}
