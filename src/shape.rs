use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{Debug, Formatter};
use thiserror::Error;

pub type Array = SmallVec<[usize; 5]>;

pub fn display_comma(arr: &[usize]) -> String {
    arr.iter().map(|s| s.to_string()).join(", ")
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum ShapeError {
    #[error("size mismatch! expected {} but got {}.", .0, .1)]
    SizeMismatch(usize, usize),

    #[error("cannot infer the size")]
    InvalidInference,

    #[error("invalid shape extent {}, size should be larger than 0 or set to -1 for inference", .0)]
    InvalidExtent(isize),
}

/// Row-major extents of a dense buffer.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    extents: Array,
}

impl Shape {
    pub fn new<E>(extents: E) -> Result<Shape, ShapeError>
    where
        E: Extent,
    {
        Ok(Shape {
            extents: extents.resolve(None)?,
        })
    }

    /// Resolves `extents` against a known element count, inferring a single `-1`.
    pub fn with_size<E>(extents: E, size: usize) -> Result<Shape, ShapeError>
    where
        E: Extent,
    {
        Ok(Shape {
            extents: extents.resolve(Some(size))?,
        })
    }

    // Literal extents are exact by construction and may contain zeros.
    pub(crate) fn from_literal(extents: &[usize]) -> Shape {
        Shape {
            extents: extents.iter().copied().collect(),
        }
    }

    pub fn scalar() -> Shape {
        Shape {
            extents: Array::new(),
        }
    }

    pub fn num_axes(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn size(&self) -> usize {
        self.extents.iter().product()
    }
}

impl Debug for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", display_comma(&self.extents))
    }
}

pub trait Size {
    fn needs_infer(&self) -> bool;
    fn to_usize(&self) -> Result<usize, ShapeError>;
}

impl Size for usize {
    fn needs_infer(&self) -> bool {
        false
    }

    fn to_usize(&self) -> Result<usize, ShapeError> {
        match *self {
            0 => Err(ShapeError::InvalidExtent(0)),
            e => Ok(e),
        }
    }
}

/// `-1` marks the one axis whose extent is inferred from the element count.
impl Size for i32 {
    fn needs_infer(&self) -> bool {
        *self == -1
    }

    fn to_usize(&self) -> Result<usize, ShapeError> {
        usize::try_from(*self)
            .ok()
            .filter(|&e| e > 0)
            .ok_or(ShapeError::InvalidExtent(*self as isize))
    }
}

pub trait Extent {
    /// Resolves the extents. With a known element count the product must
    /// match it exactly; without one, nothing can be inferred.
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError>;
}

fn resolve_extents<E>(extents: &[E], size: Option<usize>) -> Result<Array, ShapeError>
where
    E: Size,
{
    let mut inferred = None;
    let mut known = 1;
    let mut arr = Array::with_capacity(extents.len());

    for (i, extent) in extents.iter().enumerate() {
        if extent.needs_infer() {
            if inferred.replace(i).is_some() {
                return Err(ShapeError::InvalidInference);
            }
        } else {
            let e = extent.to_usize()?;
            arr.push(e);
            known *= e;
        }
    }

    match (inferred, size) {
        (None, None) => Ok(arr),
        (None, Some(size)) if size == known => Ok(arr),
        (None, Some(size)) => Err(ShapeError::SizeMismatch(size, known)),
        (Some(i), Some(size)) if size > 0 && size % known == 0 => {
            arr.insert(i, size / known);
            Ok(arr)
        }
        (Some(_), _) => Err(ShapeError::InvalidInference),
    }
}

impl Extent for usize {
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError> {
        resolve_extents(&[*self], size)
    }
}

impl Extent for i32 {
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError> {
        resolve_extents(&[*self], size)
    }
}

impl<T, const C: usize> Extent for [T; C]
where
    T: Size,
{
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError> {
        resolve_extents(self, size)
    }
}

impl<'a, T> Extent for &'a [T]
where
    T: Size,
{
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError> {
        resolve_extents(self, size)
    }
}

impl<T> Extent for Vec<T>
where
    T: Size,
{
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError> {
        resolve_extents(self, size)
    }
}

impl Extent for &Shape {
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError> {
        resolve_extents(self.extents(), size)
    }
}

impl Extent for Shape {
    fn resolve(&self, size: Option<usize>) -> Result<Array, ShapeError> {
        resolve_extents(self.extents(), size)
    }
}
