use num_traits::Float;

use crate::blob::Blob;
use crate::error::Result;
use crate::tensor::data::{DataType, Scalar};
use crate::tensor::{BufferError, Tensor};

/// Adds a penalty gradient to a parameter blob. Called from a layer's backward
/// pass after the blob gradient has been written; returns the penalty value.
pub trait Regularizer {
    fn reg(&self, blob: &Blob, num_data: usize) -> Result<f64>;
}

/// `weight * |w|^2`, gradient `2 * weight * num_data * w`.
pub struct L2 {
    weight: f64,
}

impl L2 {
    pub fn new(weight: f64) -> Self {
        L2 { weight }
    }
}

impl Regularizer for L2 {
    fn reg(&self, blob: &Blob, num_data: usize) -> Result<f64> {
        let scale = self.weight * num_data as f64 * 2.0;
        penalize(blob, |w| w * scale, |w| w * w * self.weight)
    }
}

/// `weight * |w|_1`, gradient `weight * num_data * sign(w)`.
pub struct L1 {
    weight: f64,
}

impl L1 {
    pub fn new(weight: f64) -> Self {
        L1 { weight }
    }
}

impl Regularizer for L1 {
    fn reg(&self, blob: &Blob, num_data: usize) -> Result<f64> {
        let scale = self.weight * num_data as f64;
        penalize(
            blob,
            |w| if w == 0.0 { 0.0 } else { w.signum() * scale },
            |w| w.abs() * self.weight,
        )
    }
}

fn penalize<G, P>(blob: &Blob, grad: G, penalty: P) -> Result<f64>
where
    G: Fn(f64) -> f64,
    P: Fn(f64) -> f64,
{
    let data = blob.data()?;
    let diff = blob.gradient()?;

    match data.data_type() {
        DataType::Float => accumulate::<f32, _, _>(&data, &diff, grad, penalty),
        DataType::Double => accumulate::<f64, _, _>(&data, &diff, grad, penalty),
        other => Err(BufferError::IncompatibleType(other, DataType::Double).into()),
    }
}

fn accumulate<T, G, P>(data: &Tensor, diff: &Tensor, grad: G, penalty: P) -> Result<f64>
where
    T: Scalar + Float,
    G: Fn(f64) -> f64,
    P: Fn(f64) -> f64,
{
    if data.shares_storage(diff) {
        // data and gradient aliasing the same buffer cannot be borrowed twice
        let snapshot = data.deep_copy();
        return accumulate::<T, G, P>(&snapshot, diff, grad, penalty);
    }

    let w = data.borrow::<T>()?;
    let mut g = diff.borrow_mut::<T>()?;

    let mut total = 0.0;
    for (w, g) in w.iter().zip(g.iter_mut()) {
        let w = w.to_f64().unwrap_or_default();
        *g += T::from(grad(w)).unwrap_or_else(T::zero);
        total += penalty(w);
    }
    Ok(total)
}
