use crate::blob::{Blob, BlobError};
use crate::error::Result;
use crate::layers::{Layer, Parameter};

/// Hands one blob to several consumers. Every output aliases the input data;
/// the backward pass sums the consumers' gradients into the input gradient.
pub struct Split {
    name: String,
}

impl Split {
    pub const TYPE_NAME: &'static str = "Split";

    pub fn new<T>(name: T) -> Self
    where
        T: AsRef<str>,
    {
        Split {
            name: name.as_ref().to_string(),
        }
    }
}

impl Parameter for Split {}

impl Layer for Split {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        Split::TYPE_NAME
    }

    fn forward(&mut self, inputs: &[&Blob], outputs: &[&Blob]) -> Result<()> {
        let x = inputs[0].data()?;
        for y in outputs {
            y.alias_data(&x)?;
        }
        Ok(())
    }

    fn backward(&mut self, inputs: &[&Blob], outputs: &[&Blob], propagate_down: bool) -> Result<f64> {
        if !propagate_down {
            return Ok(0.0);
        }

        let dx = inputs[0].allocate_gradient(true)?;

        // consumers outside the backward pass leave no gradient behind
        for y in outputs.iter().filter(|y| y.has_gradient()) {
            let dy = y.gradient()?;
            if !dx.host_mut().add_assign(&dy.host()) {
                return Err(BlobError::mismatch(y.name(), Some(dx.desc()), Some(dy.desc())).into());
            }
        }
        Ok(0.0)
    }
}
