use itertools::Itertools;
use rand::distributions::Distribution;
use rand::thread_rng;
use rayon::prelude::*;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use crate::shape::{Extent, Shape, ShapeError};
use crate::tensor::data::{DataLiteral, DataType, HostData, Scalar};
use thiserror::Error;

pub mod data;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum BufferError {
    #[error("data type {} and {} are not compatible", .0, .1)]
    IncompatibleType(DataType, DataType),

    #[error("buffer of {} elements cannot hold {} elements", .0, .1)]
    LengthMismatch(usize, usize),
}

#[derive(Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub shape: Shape,
    pub data_type: DataType,
}

impl TensorDesc {
    pub fn new(shape: Shape, data_type: DataType) -> Self {
        TensorDesc { shape, data_type }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn extents(&self) -> &[usize] {
        self.shape.extents()
    }

    pub fn rank(&self) -> usize {
        self.shape.num_axes()
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }
}

impl Debug for TensorDesc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({})",
            self.data_type,
            self.extents().iter().map(|v| v.to_string()).join(", ")
        )
    }
}

/// Dense host buffer. Clones share storage; use [`Tensor::deep_copy`] for an
/// independent buffer.
#[derive(Clone)]
pub struct Tensor {
    desc: TensorDesc,
    data: Rc<RefCell<HostData>>,
}

impl Tensor {
    // ******************************** Constructors ******************************** //

    pub fn new<D, T>(data: D) -> Self
    where
        D: DataLiteral<T>,
        T: Scalar,
    {
        Tensor {
            desc: TensorDesc::new(Shape::from_literal(&data.extents()), T::data_type()),
            data: Rc::new(RefCell::new(data.to_buf())),
        }
    }

    pub fn from_vec<E, T>(extents: E, vec: Vec<T>) -> Result<Self, ShapeError>
    where
        E: Extent,
        T: Scalar,
    {
        let shape = Shape::with_size(extents, vec.len())?;

        Ok(Tensor {
            desc: TensorDesc::new(shape, T::data_type()),
            data: Rc::new(RefCell::new(T::vec_to_data(vec))),
        })
    }

    pub fn from_scalar<E, T>(extents: E, val: T) -> Result<Self, ShapeError>
    where
        E: Extent,
        T: Scalar,
    {
        let shape = Shape::new(extents)?;
        let data = T::vec_to_data(vec![val; shape.size()]);

        Ok(Tensor {
            desc: TensorDesc::new(shape, T::data_type()),
            data: Rc::new(RefCell::new(data)),
        })
    }

    pub fn zeros(shape: Shape, data_type: DataType) -> Self {
        let data = HostData::zeros(data_type, shape.size());

        Tensor {
            desc: TensorDesc::new(shape, data_type),
            data: Rc::new(RefCell::new(data)),
        }
    }

    pub fn from_dist<E, D, T>(extents: E, dist: D) -> Result<Self, ShapeError>
    where
        E: Extent,
        D: Distribution<T> + Sync,
        T: Scalar,
    {
        let shape = Shape::new(extents)?;

        let data: Vec<T> = (0..shape.size())
            .into_par_iter()
            .map(|_| dist.sample(&mut thread_rng()))
            .collect();

        Ok(Tensor {
            desc: TensorDesc::new(shape, T::data_type()),
            data: Rc::new(RefCell::new(T::vec_to_data(data))),
        })
    }

    pub(crate) fn from_host(shape: Shape, data: HostData) -> Result<Self, BufferError> {
        if shape.size() != data.len() {
            return Err(BufferError::LengthMismatch(data.len(), shape.size()));
        }

        Ok(Tensor {
            desc: TensorDesc::new(shape, data.data_type()),
            data: Rc::new(RefCell::new(data)),
        })
    }

    // ******************************** Properties ******************************** //

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn shape(&self) -> &Shape {
        self.desc.shape()
    }

    pub fn extents(&self) -> &[usize] {
        self.desc.extents()
    }

    pub fn rank(&self) -> usize {
        self.desc.rank()
    }

    pub fn size(&self) -> usize {
        self.desc.size()
    }

    pub fn data_type(&self) -> DataType {
        self.desc.data_type()
    }

    /// Whether both tensors read and write the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    // ******************************** Views ******************************** //

    /// Zero-copy reinterpretation of the storage with a new shape.
    pub fn view<E>(&self, extents: E) -> Result<Tensor, ShapeError>
    where
        E: Extent,
    {
        let shape = Shape::with_size(extents, self.size())?;

        Ok(Tensor {
            desc: TensorDesc::new(shape, self.data_type()),
            data: self.data.clone(),
        })
    }

    pub fn deep_copy(&self) -> Tensor {
        Tensor {
            desc: self.desc.clone(),
            data: Rc::new(RefCell::new(self.data.borrow().clone())),
        }
    }

    // ******************************** Data ******************************** //

    pub fn host(&self) -> Ref<HostData> {
        self.data.borrow()
    }

    pub fn host_mut(&self) -> RefMut<HostData> {
        self.data.borrow_mut()
    }

    pub fn borrow<T>(&self) -> Result<Ref<[T]>, BufferError>
    where
        T: Scalar,
    {
        self.check_type::<T>()?;
        Ok(Ref::map(self.data.borrow(), |d| {
            T::data_to_slice(d).unwrap_or_default()
        }))
    }

    pub fn borrow_mut<T>(&self) -> Result<RefMut<[T]>, BufferError>
    where
        T: Scalar,
    {
        self.check_type::<T>()?;
        Ok(RefMut::map(self.data.borrow_mut(), |d| {
            T::data_to_slice_mut(d).unwrap_or_default()
        }))
    }

    pub fn to_vec<T>(&self) -> Result<Vec<T>, BufferError>
    where
        T: Scalar,
    {
        Ok(self.borrow::<T>()?.to_vec())
    }

    pub fn set_data<D, T>(&self, data: D) -> Result<(), BufferError>
    where
        D: DataLiteral<T>,
        T: Scalar,
    {
        self.check_type::<T>()?;
        let buf = data.to_buf();
        if !self.data.borrow_mut().copy_from(&buf) {
            return Err(BufferError::LengthMismatch(self.size(), buf.len()));
        }
        Ok(())
    }

    fn check_type<T>(&self) -> Result<(), BufferError>
    where
        T: Scalar,
    {
        if self.data_type() != T::data_type() {
            return Err(BufferError::IncompatibleType(self.data_type(), T::data_type()));
        }
        Ok(())
    }

    // ******************************** Comparison ******************************** //

    pub fn all_close(a: &Tensor, b: &Tensor, eps: f64) -> bool {
        if a.extents() != b.extents() {
            return false;
        }

        match (&*a.host(), &*b.host()) {
            (HostData::Float(x), HostData::Float(y)) => {
                x.iter().zip(y).all(|(p, q)| ((p - q).abs() as f64) < eps)
            }
            (HostData::Double(x), HostData::Double(y)) => {
                x.iter().zip(y).all(|(p, q)| (p - q).abs() < eps)
            }
            (x, y) => x == y,
        }
    }
}

impl AsRef<Tensor> for Tensor {
    fn as_ref(&self) -> &Tensor {
        self
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tensor{:?}", &self.desc)
    }
}

#[cfg(test)]
mod tests {
    use crate::shape::{Shape, ShapeError};
    use crate::tensor::data::DataType;
    use crate::tensor::{BufferError, Tensor};
    use rand_distr::Uniform;

    #[test]
    fn test_new() {
        let t = Tensor::new([[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(t.extents(), &[2, 3]);
        assert_eq!(t.data_type(), DataType::Float);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(
            t.to_vec::<f64>().expect_err(""),
            BufferError::IncompatibleType(DataType::Float, DataType::Double)
        );
    }

    #[test]
    fn test_empty() {
        let t = Tensor::new([[0.0_f32; 0]; 0]);
        assert_eq!(t.extents(), &[0]);
        assert_eq!(t.size(), 0);

        assert_eq!(
            Tensor::from_vec([2, 3], Vec::<f32>::new()).expect_err(""),
            ShapeError::SizeMismatch(0, 6)
        );
        assert_eq!(
            Tensor::from_vec([-1], Vec::<f32>::new()).expect_err(""),
            ShapeError::InvalidInference
        );
    }

    #[test]
    fn test_view_shares_storage() {
        let t = Tensor::from_vec([2, 3], vec![0_i32; 6]).unwrap();
        let v = t.view([3, -1]).unwrap();
        assert_eq!(v.extents(), &[3, 2]);
        assert!(v.shares_storage(&t));

        v.borrow_mut::<i32>().unwrap()[5] = 9;
        assert_eq!(t.borrow::<i32>().unwrap()[5], 9);

        assert_eq!(t.view([4, 2]).expect_err(""), ShapeError::SizeMismatch(6, 8));

        let c = t.deep_copy();
        assert!(!c.shares_storage(&t));
        c.borrow_mut::<i32>().unwrap()[0] = 1;
        assert_eq!(t.borrow::<i32>().unwrap()[0], 0);
    }

    #[test]
    fn test_from_dist() {
        let t = Tensor::from_dist([16, 4], Uniform::new(-1.0_f32, 1.0)).unwrap();
        assert_eq!(t.size(), 64);
        assert!(t.borrow::<f32>().unwrap().iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn test_all_close() {
        let a = Tensor::new([0.1_f64, 0.2]);
        let b = Tensor::new([0.1001_f64, 0.2]);
        assert!(Tensor::all_close(&a, &b, 0.001));
        assert!(!Tensor::all_close(&a, &b, 0.00001));

        let z = Tensor::zeros(Shape::new(2).unwrap(), DataType::Double);
        z.set_data([0.1_f64, 0.2]).unwrap();
        assert!(Tensor::all_close(&a, &z, 1e-12));
        assert_eq!(
            z.set_data([1.0_f64]).expect_err(""),
            BufferError::LengthMismatch(2, 1)
        );
    }
}
