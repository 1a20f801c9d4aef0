use num_traits::{NumAssign, NumCast};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DataType {
    // Integers
    Uchar,
    Int,
    Long,

    // Floats
    Float,
    Double,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HostData {
    Uchar(Vec<u8>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

// Expands `$body` once per variant with `$v` bound to the inner vector.
macro_rules! dispatch {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            HostData::Uchar($v) => $body,
            HostData::Int($v) => $body,
            HostData::Long($v) => $body,
            HostData::Float($v) => $body,
            HostData::Double($v) => $body,
        }
    };
}

impl HostData {
    pub fn zeros(data_type: DataType, len: usize) -> Self {
        match data_type {
            DataType::Uchar => HostData::Uchar(vec![0; len]),
            DataType::Int => HostData::Int(vec![0; len]),
            DataType::Long => HostData::Long(vec![0; len]),
            DataType::Float => HostData::Float(vec![0.0; len]),
            DataType::Double => HostData::Double(vec![0.0; len]),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            HostData::Uchar(_) => DataType::Uchar,
            HostData::Int(_) => DataType::Int,
            HostData::Long(_) => DataType::Long,
            HostData::Float(_) => DataType::Float,
            HostData::Double(_) => DataType::Double,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fill_zero(&mut self) {
        dispatch!(self, arr => arr.iter_mut().for_each(|v| *v = Default::default()))
    }

    /// Writes `val` (cast to the element type) into every element.
    /// Returns false when the value is not representable.
    pub fn fill_with(&mut self, val: f64) -> bool {
        dispatch!(self, arr => match NumCast::from(val) {
            Some(v) => {
                arr.iter_mut().for_each(|e| *e = v);
                true
            }
            None => false,
        })
    }

    /// Element-wise `self -= other`. Integer types wrap.
    pub fn sub_assign(&mut self, other: &HostData) -> bool {
        match (self, other) {
            (HostData::Uchar(a), HostData::Uchar(b)) => zip_apply(a, b, |x, y| *x = x.wrapping_sub(y)),
            (HostData::Int(a), HostData::Int(b)) => zip_apply(a, b, |x, y| *x = x.wrapping_sub(y)),
            (HostData::Long(a), HostData::Long(b)) => zip_apply(a, b, |x, y| *x = x.wrapping_sub(y)),
            (HostData::Float(a), HostData::Float(b)) => zip_apply(a, b, |x, y| *x -= y),
            (HostData::Double(a), HostData::Double(b)) => zip_apply(a, b, |x, y| *x -= y),
            _ => false,
        }
    }

    /// Element-wise `self += other`. Integer types wrap.
    pub fn add_assign(&mut self, other: &HostData) -> bool {
        match (self, other) {
            (HostData::Uchar(a), HostData::Uchar(b)) => zip_apply(a, b, |x, y| *x = x.wrapping_add(y)),
            (HostData::Int(a), HostData::Int(b)) => zip_apply(a, b, |x, y| *x = x.wrapping_add(y)),
            (HostData::Long(a), HostData::Long(b)) => zip_apply(a, b, |x, y| *x = x.wrapping_add(y)),
            (HostData::Float(a), HostData::Float(b)) => zip_apply(a, b, |x, y| *x += y),
            (HostData::Double(a), HostData::Double(b)) => zip_apply(a, b, |x, y| *x += y),
            _ => false,
        }
    }

    /// Element `i` widened to `f64`. None for integer data or an index out of range.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match self {
            HostData::Float(v) => v.get(i).map(|&e| e as f64),
            HostData::Double(v) => v.get(i).copied(),
            _ => None,
        }
    }

    pub fn set_f64(&mut self, i: usize, val: f64) -> bool {
        match self {
            HostData::Float(v) => v.get_mut(i).map(|e| *e = val as f32).is_some(),
            HostData::Double(v) => v.get_mut(i).map(|e| *e = val).is_some(),
            _ => false,
        }
    }

    pub fn copy_from(&mut self, other: &HostData) -> bool {
        if self.data_type() != other.data_type() || self.len() != other.len() {
            return false;
        }
        *self = other.clone();
        true
    }
}

fn zip_apply<T, F>(a: &mut [T], b: &[T], f: F) -> bool
where
    T: Copy,
    F: Fn(&mut T, T),
{
    if a.len() != b.len() {
        return false;
    }
    a.iter_mut().zip(b.iter()).for_each(|(x, y)| f(x, *y));
    true
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            DataType::Uchar => write!(f, "unsigned char"),
            DataType::Int => write!(f, "int"),
            DataType::Long => write!(f, "long"),
            DataType::Float => write!(f, "float"),
            DataType::Double => write!(f, "double"),
        }
    }
}

impl DataType {
    pub fn bytes(&self) -> usize {
        match self {
            DataType::Uchar => 1,
            DataType::Int => 4,
            DataType::Long => 8,
            DataType::Float => 4,
            DataType::Double => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }
}

pub trait Scalar: Sized + Copy + Send + Sync + Debug + Display + NumAssign + NumCast + 'static {
    fn data_type() -> DataType;
    fn vec_to_data(v: Vec<Self>) -> HostData;
    fn data_to_slice(a: &HostData) -> Option<&[Self]>;
    fn data_to_slice_mut(a: &mut HostData) -> Option<&mut [Self]>;
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident) => {
        impl Scalar for $ty {
            fn data_type() -> DataType {
                DataType::$variant
            }

            fn vec_to_data(v: Vec<$ty>) -> HostData {
                HostData::$variant(v)
            }

            fn data_to_slice(a: &HostData) -> Option<&[Self]> {
                if let HostData::$variant(v) = a {
                    Some(v)
                } else {
                    None
                }
            }

            fn data_to_slice_mut(a: &mut HostData) -> Option<&mut [Self]> {
                if let HostData::$variant(v) = a {
                    Some(v)
                } else {
                    None
                }
            }
        }
    };
}

impl_scalar!(u8, Uchar);
impl_scalar!(i32, Int);
impl_scalar!(i64, Long);
impl_scalar!(f32, Float);
impl_scalar!(f64, Double);

pub trait DataLiteral<T>
where
    T: Scalar,
{
    fn flat_iter<'a>(&'a self) -> Box<dyn Iterator<Item = T> + 'a>;

    fn extents(&self) -> Vec<usize>;

    fn to_vec(&self) -> Vec<T> {
        self.flat_iter().collect()
    }

    fn to_buf(&self) -> HostData {
        T::vec_to_data(self.to_vec())
    }
}

impl<T> DataLiteral<T> for Vec<T>
where
    T: Scalar,
{
    fn flat_iter<'a>(&'a self) -> Box<dyn Iterator<Item = T> + 'a> {
        Box::new(self.iter().cloned())
    }

    fn extents(&self) -> Vec<usize> {
        vec![self.len()]
    }
}

impl<T, E, const C: usize> DataLiteral<T> for [E; C]
where
    E: DataLiteral<T>,
    T: Scalar,
{
    fn flat_iter<'a>(&'a self) -> Box<dyn Iterator<Item = T> + 'a> {
        Box::new(self.iter().flat_map(|a| a.flat_iter()))
    }

    fn extents(&self) -> Vec<usize> {
        // an empty literal has no element to ask for the inner extents
        let mut s = self.first().map_or_else(Vec::new, |e| e.extents());
        s.insert(0, C);
        s
    }
}

impl<T> DataLiteral<T> for T
where
    T: Scalar,
{
    fn flat_iter(&self) -> Box<dyn Iterator<Item = T>> {
        Box::new(core::iter::once(*self))
    }

    fn extents(&self) -> Vec<usize> {
        Vec::new()
    }
}
