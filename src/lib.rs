pub mod blob;
pub mod error;
pub mod filler;
pub mod gradcheck;
pub mod layers;
pub mod net;
pub mod regularizer;
pub mod shape;
pub mod tensor;

pub use blob::{Blob, Fill};
pub use error::{Error, Result};
pub use gradcheck::{GradChecker, GradReport};
pub use layers::{DataSource, Layer, LayerKind, LayerNode, Loss, Parameter};
pub use net::{FanoutPolicy, Net, NetConfig};
pub use tensor::data::DataType;
pub use tensor::Tensor;
