//! Model representation.
//!
//! The coordinator does not know anything about the structure of the models it aggregates. A
//! [`Model`] is a flat vector of weights that can be scaled and summed up element-wise.

use std::{
    iter::{FromIterator, IntoIterator},
    ops::AddAssign,
    slice::Iter,
};

use derive_more::{From, Index, IndexMut, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Default, From, Index, IndexMut, Into, Serialize, Deserialize)]
/// A numerical representation of a machine learning model.
pub struct Model(Vec<f64>);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("model length mismatch: expected {expected} weights, got {actual}")]
/// Two models of different length were combined.
pub struct ModelLengthError {
    pub expected: usize,
    pub actual: usize,
}

#[allow(clippy::len_without_is_empty)]
impl Model {
    /// Creates a model of `len` weights all set to zero.
    pub fn zeros(len: usize) -> Self {
        Self(vec![0.; len])
    }

    /// Gets the number of weights of this model.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Creates an iterator that yields references to the weights of this model.
    pub fn iter(&self) -> Iter<f64> {
        self.0.iter()
    }

    /// Returns a copy of this model with every weight multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        self.iter().map(|w| w * factor).collect()
    }

    /// Returns a copy of this model with every weight divided by `divisor`.
    pub fn divided(&self, divisor: f64) -> Self {
        self.iter().map(|w| w / divisor).collect()
    }

    /// Checks that this model has `expected` weights.
    pub fn check_len(&self, expected: usize) -> Result<(), ModelLengthError> {
        if self.len() == expected {
            Ok(())
        } else {
            Err(ModelLengthError {
                expected,
                actual: self.len(),
            })
        }
    }
}

impl AsRef<[f64]> for Model {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

/// Element-wise addition. Both models must have the same length, which callers check with
/// [`Model::check_len`] beforehand.
impl AddAssign<&Model> for Model {
    fn add_assign(&mut self, rhs: &Model) {
        debug_assert_eq!(self.len(), rhs.len());
        for (w, r) in self.0.iter_mut().zip(rhs.iter()) {
            *w += r;
        }
    }
}

impl FromIterator<f64> for Model {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Model(iter.into_iter().collect())
    }
}

impl IntoIterator for Model {
    type Item = f64;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
