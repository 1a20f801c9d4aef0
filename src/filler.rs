use rand::distributions::{Bernoulli as BernoulliDist, Distribution};
use rand::thread_rng;
use rand_distr::{Normal, Uniform as UniformDist};
use rayon::prelude::*;
use thiserror::Error;

use crate::error::Error;
use crate::tensor::data::{DataType, HostData};
use crate::tensor::{BufferError, Tensor};

#[derive(Error, Debug, PartialEq)]
pub enum FillerError {
    #[error("invalid filler parameter: {0}")]
    InvalidParameter(String),

    #[error("cannot compute fan-in of a tensor with {0} axes")]
    FanIn(usize),

    #[error("value {0} is not representable in {1}")]
    Unrepresentable(f64, DataType),
}

/// Populates a freshly (re)allocated data buffer in place.
pub trait Filler {
    fn fill(&self, tensor: &Tensor) -> Result<(), Error>;
}

pub struct Constant {
    pub value: f64,
}

impl Constant {
    pub fn new(value: f64) -> Self {
        Constant { value }
    }
}

impl Filler for Constant {
    fn fill(&self, tensor: &Tensor) -> Result<(), Error> {
        if !tensor.host_mut().fill_with(self.value) {
            return Err(FillerError::Unrepresentable(self.value, tensor.data_type()).into());
        }
        Ok(())
    }
}

// Samples in [min, max).
pub struct Uniform {
    pub min: f64,
    pub max: f64,
}

impl Uniform {
    pub fn new(min: f64, max: f64) -> Self {
        Uniform { min, max }
    }
}

impl Filler for Uniform {
    fn fill(&self, tensor: &Tensor) -> Result<(), Error> {
        if !(self.min < self.max) || !(self.max - self.min).is_finite() {
            return Err(FillerError::InvalidParameter(format!(
                "uniform range [{}, {}) is empty",
                self.min, self.max
            ))
            .into());
        }
        sample_float(tensor, UniformDist::new(self.min, self.max))
    }
}

pub struct Gaussian {
    pub mean: f64,
    pub std: f64,
}

impl Gaussian {
    pub fn new(mean: f64, std: f64) -> Self {
        Gaussian { mean, std }
    }
}

impl Default for Gaussian {
    fn default() -> Self {
        Gaussian::new(0.0, 1.0)
    }
}

impl Filler for Gaussian {
    fn fill(&self, tensor: &Tensor) -> Result<(), Error> {
        sample_float(tensor, normal(self.mean, self.std)?)
    }
}

// rand_distr only rejects a non-finite std, so the sign is checked here.
fn normal(mean: f64, std: f64) -> Result<Normal<f64>, FillerError> {
    if !(std >= 0.0 && std.is_finite() && mean.is_finite()) {
        return Err(FillerError::InvalidParameter(format!(
            "normal distribution with mean {} and std {}",
            mean, std
        )));
    }
    Normal::new(mean, std).map_err(|e| FillerError::InvalidParameter(e.to_string()))
}

/// Ones with probability `ratio`, zeros otherwise. Used for dropout masks.
pub struct Bernoulli {
    pub ratio: f64,
}

impl Bernoulli {
    pub fn new(ratio: f64) -> Self {
        Bernoulli { ratio }
    }
}

impl Filler for Bernoulli {
    fn fill(&self, tensor: &Tensor) -> Result<(), Error> {
        let dist = BernoulliDist::new(self.ratio)
            .map_err(|e| FillerError::InvalidParameter(e.to_string()))?;

        let mut data = tensor.host_mut();
        let mut rng = thread_rng();
        let mask: Vec<bool> = (0..data.len()).map(|_| dist.sample(&mut rng)).collect();
        write_mask(&mut data, &mask);
        Ok(())
    }
}

fn write_mask(data: &mut HostData, mask: &[bool]) {
    match data {
        HostData::Uchar(v) => v.iter_mut().zip(mask).for_each(|(e, &m)| *e = m as u8),
        HostData::Int(v) => v.iter_mut().zip(mask).for_each(|(e, &m)| *e = m as i32),
        HostData::Long(v) => v.iter_mut().zip(mask).for_each(|(e, &m)| *e = m as i64),
        HostData::Float(v) => v.iter_mut().zip(mask).for_each(|(e, &m)| *e = m as u8 as f32),
        HostData::Double(v) => v.iter_mut().zip(mask).for_each(|(e, &m)| *e = m as u8 as f64),
    }
}

/// Kaiming (He) uniform initialization for `[fan_out, fan_in, ...]` weights.
pub struct KaimingUniform {
    pub gain: f64,
}

impl Filler for KaimingUniform {
    fn fill(&self, tensor: &Tensor) -> Result<(), Error> {
        let (fan_in, _) = fan_in_and_out(tensor.extents())?;
        let std = self.gain * (1.0 / fan_in as f64).sqrt();
        let a = 3.0_f64.sqrt() * std;
        if !(a > 0.0 && a.is_finite()) {
            return Err(FillerError::InvalidParameter(format!(
                "kaiming bound {} from gain {}",
                a, self.gain
            ))
            .into());
        }

        sample_float(tensor, UniformDist::new(-a, a))
    }
}

pub struct KaimingNormal {
    pub gain: f64,
}

impl Filler for KaimingNormal {
    fn fill(&self, tensor: &Tensor) -> Result<(), Error> {
        let (fan_in, _) = fan_in_and_out(tensor.extents())?;
        let std = self.gain * (1.0 / fan_in as f64).sqrt();
        sample_float(tensor, normal(0.0, std)?)
    }
}

fn fan_in_and_out(extents: &[usize]) -> Result<(usize, usize), FillerError> {
    if extents.len() < 2 {
        return Err(FillerError::FanIn(extents.len()));
    }

    let num_in_fmaps = extents[1];
    let num_out_fmaps = extents[0];

    let receptive_field_size: usize = extents[2..].iter().product();

    Ok((
        num_in_fmaps * receptive_field_size,
        num_out_fmaps * receptive_field_size,
    ))
}

fn sample_float<D>(tensor: &Tensor, dist: D) -> Result<(), Error>
where
    D: Distribution<f64> + Sync,
{
    match tensor.data_type() {
        DataType::Float => tensor
            .borrow_mut::<f32>()?
            .par_iter_mut()
            .for_each(|v| *v = dist.sample(&mut thread_rng()) as f32),
        DataType::Double => tensor
            .borrow_mut::<f64>()?
            .par_iter_mut()
            .for_each(|v| *v = dist.sample(&mut thread_rng())),
        other => return Err(BufferError::IncompatibleType(other, DataType::Double).into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::filler::{
        fan_in_and_out, Bernoulli, Constant, Filler, FillerError, Gaussian, KaimingNormal,
        KaimingUniform, Uniform,
    };
    use crate::shape::Shape;
    use crate::tensor::data::DataType;
    use crate::tensor::{BufferError, Tensor};

    fn zeros(extents: [usize; 2], data_type: DataType) -> Tensor {
        Tensor::zeros(Shape::new(extents).unwrap(), data_type)
    }

    #[test]
    fn test_constant() {
        let t = zeros([2, 2], DataType::Int);
        Constant::new(7.0).fill(&t).unwrap();
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![7; 4]);

        let u = zeros([1, 1], DataType::Uchar);
        assert!(matches!(
            Constant::new(-1.0).fill(&u),
            Err(Error::Filler(FillerError::Unrepresentable(_, DataType::Uchar)))
        ));
    }

    #[test]
    fn test_uniform() {
        let t = zeros([32, 8], DataType::Float);
        Uniform::new(2.0, 3.0).fill(&t).unwrap();
        assert!(t.borrow::<f32>().unwrap().iter().all(|v| (2.0..3.0).contains(v)));

        assert!(Uniform::new(1.0, 1.0).fill(&t).is_err());

        let i = zeros([2, 2], DataType::Int);
        assert!(matches!(
            Uniform::new(0.0, 1.0).fill(&i),
            Err(Error::Buffer(BufferError::IncompatibleType(DataType::Int, _)))
        ));
    }

    #[test]
    fn test_gaussian() {
        let t = zeros([100, 100], DataType::Double);
        Gaussian::new(5.0, 0.1).fill(&t).unwrap();
        let data = t.to_vec::<f64>().unwrap();
        let mean = data.iter().sum::<f64>() / data.len() as f64;
        assert!((mean - 5.0).abs() < 0.01);

        assert!(matches!(
            Gaussian::new(0.0, -1.0).fill(&t),
            Err(Error::Filler(FillerError::InvalidParameter(_)))
        ));
        assert!(Gaussian::new(f64::NAN, 1.0).fill(&t).is_err());
        assert!(Gaussian::new(0.0, f64::INFINITY).fill(&t).is_err());
        assert!(Uniform::new(0.0, f64::INFINITY).fill(&t).is_err());
        assert!(KaimingNormal { gain: -1.0 }.fill(&t).is_err());
    }

    #[test]
    fn test_bernoulli() {
        let t = zeros([10, 10], DataType::Uchar);
        Bernoulli::new(1.0).fill(&t).unwrap();
        assert!(t.borrow::<u8>().unwrap().iter().all(|&v| v == 1));

        Bernoulli::new(0.0).fill(&t).unwrap();
        assert!(t.borrow::<u8>().unwrap().iter().all(|&v| v == 0));

        assert!(Bernoulli::new(1.5).fill(&t).is_err());
    }

    #[test]
    fn test_kaiming() {
        assert_eq!(fan_in_and_out(&[8, 4, 3, 3]).unwrap(), (36, 72));
        assert_eq!(fan_in_and_out(&[8]).expect_err(""), FillerError::FanIn(1));

        let t = zeros([16, 9], DataType::Float);
        KaimingUniform { gain: 1.0 }.fill(&t).unwrap();
        let bound = 3.0_f32.sqrt() / 3.0;
        assert!(t.borrow::<f32>().unwrap().iter().all(|v| v.abs() <= bound));
    }
}
