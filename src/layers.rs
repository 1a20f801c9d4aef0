use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

use crate::blob::Blob;
use crate::error::Result;
use crate::net::NetError;

pub mod source;
pub mod split;

#[cfg(test)]
pub(crate) mod mock;

pub trait Parameter {
    /// Pushes this layer's parameter blobs in a fixed order. External
    /// optimizers flatten every layer's list into one vector and rely on it.
    fn params<'a>(&'a self, _p: &mut Vec<&'a Blob>) {}
}

/// A generic computation node.
pub trait Layer: Parameter {
    fn name(&self) -> &str;

    /// Frozen layers keep their parameters fixed wherever they sit in the graph.
    fn frozen(&self) -> bool {
        false
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Computes the outputs' data from the inputs' data. May (re)allocate the
    /// output buffers; must be repeatable across minibatches.
    fn forward(&mut self, inputs: &[&Blob], outputs: &[&Blob]) -> Result<()>;

    /// Inference-time forward pass. Must not touch any gradient.
    fn predict(&mut self, inputs: &[&Blob], outputs: &[&Blob]) -> Result<()> {
        self.forward(inputs, outputs)
    }

    /// Reads the outputs' gradients and writes the parameter gradients. Writes
    /// the inputs' gradients only when `propagate_down` is set. Returns this
    /// layer's scalar contribution to the objective (0 when none).
    fn backward(&mut self, inputs: &[&Blob], outputs: &[&Blob], propagate_down: bool)
        -> Result<f64>;

    /// One step on the parameters from their own gradients.
    fn update(&mut self) -> Result<()> {
        let mut params = Vec::new();
        self.params(&mut params);

        for blob in params {
            blob.apply_update()?;
        }
        Ok(())
    }
}

/// A node without inputs that produces data.
pub trait DataSource {
    fn name(&self) -> &str;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn forward(&mut self, outputs: &[&Blob]) -> Result<()>;
}

/// A terminal node without outputs. The forward pass computes both the loss
/// and, when `propagate_down` is set, the gradient with respect to the inputs.
pub trait Loss {
    fn name(&self) -> &str;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn forward(&mut self, inputs: &[&Blob], propagate_down: bool) -> Result<()>;

    /// The loss stored by the last forward pass.
    fn loss(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Generic,
    DataSource,
    Loss,
}

/// Closed set of node variants the net schedules.
pub enum LayerNode {
    Generic(Box<dyn Layer>),
    DataSource(Box<dyn DataSource>),
    Loss(Box<dyn Loss>),
}

impl LayerNode {
    pub fn generic<L>(layer: L) -> Self
    where
        L: Layer + 'static,
    {
        LayerNode::Generic(Box::new(layer))
    }

    pub fn data_source<D>(source: D) -> Self
    where
        D: DataSource + 'static,
    {
        LayerNode::DataSource(Box::new(source))
    }

    pub fn loss<L>(loss: L) -> Self
    where
        L: Loss + 'static,
    {
        LayerNode::Loss(Box::new(loss))
    }

    // ******************************** Properties ******************************** //

    pub fn name(&self) -> &str {
        match self {
            LayerNode::Generic(l) => l.name(),
            LayerNode::DataSource(d) => d.name(),
            LayerNode::Loss(l) => l.name(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            LayerNode::Generic(l) => l.type_name(),
            LayerNode::DataSource(d) => d.type_name(),
            LayerNode::Loss(l) => l.type_name(),
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            LayerNode::Generic(_) => LayerKind::Generic,
            LayerNode::DataSource(_) => LayerKind::DataSource,
            LayerNode::Loss(_) => LayerKind::Loss,
        }
    }

    pub fn frozen(&self) -> bool {
        match self {
            LayerNode::Generic(l) => l.frozen(),
            LayerNode::DataSource(_) => false,
            LayerNode::Loss(_) => false,
        }
    }

    pub fn params<'a>(&'a self, p: &mut Vec<&'a Blob>) {
        match self {
            LayerNode::Generic(l) => l.params(p),
            LayerNode::DataSource(_) => {}
            LayerNode::Loss(_) => {}
        }
    }

    pub fn has_parameters(&self) -> bool {
        let mut p = Vec::new();
        self.params(&mut p);
        !p.is_empty()
    }

    pub fn is_data_source(&self) -> bool {
        matches!(self, LayerNode::DataSource(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LayerNode::Loss(_))
    }

    /// Rejects wiring the variant cannot have: inputs on a data source,
    /// outputs on a loss.
    pub(crate) fn check_arity(&self, needs: usize, provides: usize) -> Result<()> {
        match self {
            LayerNode::DataSource(d) if needs > 0 => Err(NetError::InvalidOperation(format!(
                "data source '{}' cannot have inputs",
                d.name()
            ))
            .into()),
            LayerNode::Loss(l) if provides > 0 => Err(NetError::InvalidOperation(format!(
                "loss '{}' cannot have outputs",
                l.name()
            ))
            .into()),
            _ => Ok(()),
        }
    }

    // ******************************** Passes ******************************** //

    pub fn forward(&mut self, inputs: &[&Blob], outputs: &[&Blob], propagate_down: bool) -> Result<()> {
        match self {
            LayerNode::Generic(l) => l.forward(inputs, outputs),
            LayerNode::DataSource(d) => d.forward(outputs),
            LayerNode::Loss(l) => l.forward(inputs, propagate_down),
        }
    }

    pub fn predict(&mut self, inputs: &[&Blob], outputs: &[&Blob]) -> Result<()> {
        match self {
            LayerNode::Generic(l) => l.predict(inputs, outputs),
            LayerNode::DataSource(d) => d.forward(outputs),
            // nothing to predict; the loss needs labels and writes gradients
            LayerNode::Loss(_) => Ok(()),
        }
    }

    pub fn backward(&mut self, inputs: &[&Blob], outputs: &[&Blob], propagate_down: bool) -> Result<f64> {
        match self {
            LayerNode::Generic(l) => l.backward(inputs, outputs, propagate_down),
            LayerNode::DataSource(d) => Err(NetError::InvalidOperation(format!(
                "backward reached data source '{}'",
                d.name()
            ))
            .into()),
            LayerNode::Loss(l) => Ok(l.loss()),
        }
    }

    /// The scalar a loss contributes regardless of scheduling; 0 otherwise.
    pub fn stored_loss(&self) -> f64 {
        match self {
            LayerNode::Loss(l) => l.loss(),
            _ => 0.0,
        }
    }

    pub fn update(&mut self) -> Result<()> {
        match self {
            LayerNode::Generic(l) if l.frozen() => Ok(()),
            LayerNode::Generic(l) => l.update(),
            LayerNode::DataSource(_) => Ok(()),
            LayerNode::Loss(_) => Ok(()),
        }
    }
}

impl From<Box<dyn Layer>> for LayerNode {
    fn from(layer: Box<dyn Layer>) -> Self {
        LayerNode::Generic(layer)
    }
}

impl From<Box<dyn DataSource>> for LayerNode {
    fn from(source: Box<dyn DataSource>) -> Self {
        LayerNode::DataSource(source)
    }
}

impl From<Box<dyn Loss>> for LayerNode {
    fn from(loss: Box<dyn Loss>) -> Self {
        LayerNode::Loss(loss)
    }
}

impl Debug for LayerNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.name(), self.kind())
    }
}
