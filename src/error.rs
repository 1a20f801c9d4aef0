use crate::blob::BlobError;
use crate::filler::FillerError;
use crate::net::NetError;
use crate::shape::ShapeError;
use crate::tensor::BufferError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("net error: {0}")]
    Net(#[from] NetError),
    #[error("blob error: {0}")]
    Blob(#[from] BlobError),
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("filler error: {0}")]
    Filler(#[from] FillerError),
}

pub type Result<T> = std::result::Result<T, Error>;
