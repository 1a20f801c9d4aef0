use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use thiserror::Error;

use crate::error::Result;
use crate::filler::Filler;
use crate::shape::{Extent, Shape};
use crate::tensor::data::DataType;
use crate::tensor::{Tensor, TensorDesc};

#[derive(Error, Debug, Eq, PartialEq)]
pub enum BlobError {
    #[error("blob '{0}' has no data")]
    UninitializedData(String),

    #[error("blob '{name}' expected {expected} but found {found}")]
    ShapeMismatch {
        name: String,
        expected: String,
        found: String,
    },
}

impl BlobError {
    pub(crate) fn mismatch(name: &str, expected: Option<&TensorDesc>, found: Option<&TensorDesc>) -> Self {
        let fmt = |d: Option<&TensorDesc>| match d {
            Some(d) => format!("{:?}", d),
            None => "no data".to_string(),
        };
        BlobError::ShapeMismatch {
            name: name.to_string(),
            expected: fmt(expected),
            found: fmt(found),
        }
    }
}

/// How [`Blob::allocate_data`] initializes the buffer contents.
#[derive(Clone, Copy)]
pub enum Fill<'a> {
    /// The blob's own filler runs when the buffer is (re)allocated.
    OnAlloc,
    /// The blob's own filler (or zeros) runs on every call, reused or not.
    Always,
    /// The given filler runs when the buffer is (re)allocated.
    With(&'a dyn Filler),
    /// Fresh buffers are zeroed, reused buffers keep their contents.
    Skip,
}

/// A named data buffer with an optional gradient of identical shape and type.
///
/// Both buffers are shared tensors: aliasing another buffer binds the same
/// storage instead of copying it, so the source stays alive as long as this
/// blob refers to it.
pub struct Blob {
    name: String,
    data: RefCell<Option<Tensor>>,
    diff: RefCell<Option<Tensor>>,
    aliased: Cell<bool>,
    filler: Option<Box<dyn Filler>>,
}

impl Blob {
    pub fn new<T>(name: T) -> Self
    where
        T: AsRef<str>,
    {
        Blob {
            name: name.as_ref().to_string(),
            data: RefCell::new(None),
            diff: RefCell::new(None),
            aliased: Cell::new(false),
            filler: None,
        }
    }

    pub fn with_filler<T>(name: T, filler: Box<dyn Filler>) -> Self
    where
        T: AsRef<str>,
    {
        Blob {
            filler: Some(filler),
            ..Blob::new(name)
        }
    }

    /// A new blob holding a zeroed buffer shaped like `other`'s data.
    pub fn like<T>(name: T, other: &Blob) -> Result<Self>
    where
        T: AsRef<str>,
    {
        let src = other.data()?;
        let blob = Blob::new(name);
        blob.allocate_data(src.shape(), src.data_type(), Fill::Skip)?;
        Ok(blob)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_data(&self) -> bool {
        self.data.borrow().is_some()
    }

    pub fn has_gradient(&self) -> bool {
        self.diff.borrow().is_some()
    }

    pub fn is_aliased(&self) -> bool {
        self.aliased.get()
    }

    pub fn desc(&self) -> Option<TensorDesc> {
        self.data.borrow().as_ref().map(|t| t.desc().clone())
    }

    pub fn data(&self) -> Result<Tensor> {
        self.data
            .borrow()
            .clone()
            .ok_or_else(|| BlobError::UninitializedData(self.name.clone()).into())
    }

    pub fn gradient(&self) -> Result<Tensor> {
        self.diff
            .borrow()
            .clone()
            .ok_or_else(|| BlobError::UninitializedData(self.name.clone()).into())
    }

    // ******************************** Allocation ******************************** //

    pub fn allocate_data<E>(&self, extents: E, data_type: DataType, fill: Fill) -> Result<Tensor>
    where
        E: Extent,
    {
        let shape = Shape::new(extents)?;

        let reuse = matches!(
            &*self.data.borrow(),
            Some(t) if t.shape() == &shape && t.data_type() == data_type
        );

        let tensor = if reuse {
            self.data()?
        } else {
            if self.aliased.get() {
                tracing::warn!(blob = %self.name, "reallocating an aliased blob detaches it from its source");
            }
            tracing::trace!(blob = %self.name, shape = ?shape, %data_type, "allocating data");

            let tensor = Tensor::zeros(shape, data_type);
            *self.data.borrow_mut() = Some(tensor.clone());
            self.aliased.set(false);
            self.drop_stale_gradient();
            tensor
        };

        let filler = match fill {
            Fill::OnAlloc if !reuse => self.filler.as_deref(),
            Fill::Always => match self.filler.as_deref() {
                Some(f) => Some(f),
                None => {
                    tensor.host_mut().fill_zero();
                    None
                }
            },
            Fill::With(f) if !reuse => Some(f),
            _ => None,
        };

        if let Some(filler) = filler {
            filler.fill(&tensor)?;
        }

        Ok(tensor)
    }

    pub fn allocate_gradient(&self, zero: bool) -> Result<Tensor> {
        let data = self.data()?;

        let reuse = matches!(
            &*self.diff.borrow(),
            Some(t) if t.desc() == data.desc()
        );

        if reuse {
            let diff = self.gradient()?;
            if zero {
                diff.host_mut().fill_zero();
            }
            Ok(diff)
        } else {
            let diff = Tensor::zeros(data.shape().clone(), data.data_type());
            *self.diff.borrow_mut() = Some(diff.clone());
            Ok(diff)
        }
    }

    pub fn clear(&self) {
        *self.data.borrow_mut() = None;
        *self.diff.borrow_mut() = None;
        self.aliased.set(false);
    }

    // ******************************** Aliasing ******************************** //

    /// Binds the data to `source`'s storage without copying.
    pub fn alias_data(&self, source: &Tensor) -> Result<Tensor> {
        self.bind_data(source.clone())
    }

    /// Like [`Blob::alias_data`], reinterpreting the storage as `extents`.
    pub fn alias_data_as<E>(&self, source: &Tensor, extents: E) -> Result<Tensor>
    where
        E: Extent,
    {
        self.bind_data(source.view(extents)?)
    }

    pub fn alias_gradient(&self, source: &Tensor) -> Result<Tensor> {
        self.bind_gradient(source.clone())
    }

    pub fn alias_gradient_as<E>(&self, source: &Tensor, extents: E) -> Result<Tensor>
    where
        E: Extent,
    {
        self.bind_gradient(source.view(extents)?)
    }

    fn bind_data(&self, tensor: Tensor) -> Result<Tensor> {
        *self.data.borrow_mut() = Some(tensor.clone());
        self.aliased.set(true);
        self.drop_stale_gradient();
        Ok(tensor)
    }

    fn bind_gradient(&self, tensor: Tensor) -> Result<Tensor> {
        if let Some(desc) = self.desc() {
            if &desc != tensor.desc() {
                return Err(BlobError::mismatch(&self.name, Some(&desc), Some(tensor.desc())).into());
            }
        }
        *self.diff.borrow_mut() = Some(tensor.clone());
        Ok(tensor)
    }

    // the gradient must always mirror the data descriptor
    fn drop_stale_gradient(&self) {
        let stale = match (&*self.data.borrow(), &*self.diff.borrow()) {
            (Some(d), Some(g)) => d.desc() != g.desc(),
            _ => false,
        };
        if stale {
            *self.diff.borrow_mut() = None;
        }
    }

    // ******************************** Update ******************************** //

    /// `data -= gradient`, the only sign convention: gradients always point
    /// uphill and every update minimizes.
    pub fn apply_update(&self) -> Result<()> {
        let data = self.data()?;
        let diff = self.gradient()?;

        let ok = if data.shares_storage(&diff) {
            let g = diff.host().clone();
            data.host_mut().sub_assign(&g)
        } else {
            data.host_mut().sub_assign(&diff.host())
        };

        if !ok {
            return Err(BlobError::mismatch(&self.name, Some(data.desc()), Some(diff.desc())).into());
        }
        Ok(())
    }

    /// Exchanges the data buffers of two blobs with identical shape and type.
    pub fn swap_data(&self, other: &Blob) -> Result<()> {
        let (mine, theirs) = (self.desc(), other.desc());

        match (&mine, &theirs) {
            (Some(a), Some(b)) if a == b => {}
            _ => return Err(BlobError::mismatch(&self.name, mine.as_ref(), theirs.as_ref()).into()),
        }

        if std::ptr::eq(self, other) {
            return Ok(());
        }

        self.data.swap(&other.data);

        let aliased = self.aliased.get();
        self.aliased.set(other.aliased.get());
        other.aliased.set(aliased);
        Ok(())
    }
}

impl Debug for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let fmt = |t: &Option<Tensor>| match t {
            Some(t) => format!("{:?}", t.desc()),
            None => "empty".to_string(),
        };
        write!(
            f,
            "{}(data: {}, diff: {})",
            self.name,
            fmt(&self.data.borrow()),
            fmt(&self.diff.borrow())
        )
    }
}
