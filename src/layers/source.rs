use crate::blob::Blob;
use crate::error::Result;
use crate::layers::DataSource;
use crate::net::NetError;
use crate::tensor::Tensor;

/// Serves caller-supplied arrays, one per output, by aliasing them into the
/// output blobs. Replacing the arrays between passes feeds the next minibatch.
pub struct ArraySource {
    name: String,
    arrays: Vec<Tensor>,
}

impl ArraySource {
    pub fn new<T>(name: T, arrays: Vec<Tensor>) -> Self
    where
        T: AsRef<str>,
    {
        ArraySource {
            name: name.as_ref().to_string(),
            arrays,
        }
    }

    pub fn arrays(&self) -> &[Tensor] {
        &self.arrays
    }

    pub fn set_arrays(&mut self, arrays: Vec<Tensor>) {
        self.arrays = arrays;
    }
}

impl DataSource for ArraySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "ArraySource"
    }

    fn forward(&mut self, outputs: &[&Blob]) -> Result<()> {
        if outputs.len() != self.arrays.len() {
            return Err(NetError::InvalidOperation(format!(
                "source '{}' holds {} arrays but provides {} blobs",
                self.name,
                self.arrays.len(),
                outputs.len()
            ))
            .into());
        }

        for (blob, array) in outputs.iter().zip(self.arrays.iter()) {
            blob.alias_data(array)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::blob::Blob;
    use crate::layers::source::ArraySource;
    use crate::layers::DataSource;
    use crate::tensor::Tensor;

    #[test]
    fn test_array_source() {
        let x = Tensor::new([[1.0_f32, 2.0], [3.0, 4.0]]);
        let y = Tensor::new([0_i32, 1]);
        let mut source = ArraySource::new("src", vec![x.clone(), y]);

        let (bx, by) = (Blob::new("x"), Blob::new("y"));
        source.forward(&[&bx, &by]).unwrap();
        assert!(bx.data().unwrap().shares_storage(&x));
        assert_eq!(by.data().unwrap().to_vec::<i32>().unwrap(), vec![0, 1]);

        source.set_arrays(vec![Tensor::new([5.0_f32])]);
        assert!(source.forward(&[&bx, &by]).is_err());
        source.forward(&[&bx]).unwrap();
        assert_eq!(bx.data().unwrap().extents(), &[1]);
    }
}
