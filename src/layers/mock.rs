// Small f64 layers with hand-checkable gradients, shared by the unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use crate::blob::{Blob, Fill};
use crate::error::Result;
use crate::filler::Constant;
use crate::layers::{Layer, Loss, Parameter};
use crate::tensor::data::DataType;

pub type Log = Rc<RefCell<Vec<String>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn record(log: &Option<Log>, event: String) {
    if let Some(log) = log {
        log.borrow_mut().push(event);
    }
}

fn copy_data(from: &Blob, to: &Blob) -> Result<()> {
    let src = from.data()?;
    let dst = to.allocate_data(src.shape(), DataType::Double, Fill::Skip)?;
    dst.set_data(src.to_vec::<f64>()?)?;
    Ok(())
}

// Zero when the blob never received a gradient.
fn gradient_values(blob: &Blob) -> Result<Vec<f64>> {
    if blob.has_gradient() {
        Ok(blob.gradient()?.to_vec::<f64>()?)
    } else {
        Ok(vec![0.0; blob.data()?.size()])
    }
}

/// Emits its single learnable value: `y = w`.
pub struct Bias {
    name: String,
    w: Blob,
    frozen: bool,
}

impl Bias {
    pub fn new(name: &str, init: f64) -> Self {
        Bias {
            name: name.to_string(),
            w: Blob::with_filler(format!("{}.w", name), Box::new(Constant::new(init))),
            frozen: false,
        }
    }

    pub fn freeze(mut self) -> Self {
        self.frozen = true;
        self
    }
}

impl Parameter for Bias {
    fn params<'a>(&'a self, p: &mut Vec<&'a Blob>) {
        p.push(&self.w);
    }
}

impl Layer for Bias {
    fn name(&self) -> &str {
        &self.name
    }

    fn frozen(&self) -> bool {
        self.frozen
    }

    fn forward(&mut self, _inputs: &[&Blob], outputs: &[&Blob]) -> Result<()> {
        self.w.allocate_data([1], DataType::Double, Fill::OnAlloc)?;
        copy_data(&self.w, outputs[0])
    }

    fn backward(&mut self, _inputs: &[&Blob], outputs: &[&Blob], _propagate_down: bool) -> Result<f64> {
        let g = gradient_values(outputs[0])?;
        self.w.allocate_gradient(true)?.set_data(g)?;
        Ok(0.0)
    }
}

/// `y = x`, copying.
pub struct Identity {
    name: String,
    log: Option<Log>,
}

impl Identity {
    pub fn new(name: &str) -> Self {
        Identity {
            name: name.to_string(),
            log: None,
        }
    }

    pub fn logged(mut self, log: &Log) -> Self {
        self.log = Some(log.clone());
        self
    }
}

impl Parameter for Identity {}

impl Layer for Identity {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, inputs: &[&Blob], outputs: &[&Blob]) -> Result<()> {
        record(&self.log, format!("forward:{}", self.name));
        for (x, y) in inputs.iter().zip(outputs.iter()) {
            copy_data(x, y)?;
        }
        Ok(())
    }

    fn predict(&mut self, inputs: &[&Blob], outputs: &[&Blob]) -> Result<()> {
        record(&self.log, format!("predict:{}", self.name));
        for (x, y) in inputs.iter().zip(outputs.iter()) {
            copy_data(x, y)?;
        }
        Ok(())
    }

    fn backward(&mut self, inputs: &[&Blob], outputs: &[&Blob], propagate_down: bool) -> Result<f64> {
        record(&self.log, format!("backward:{}:{}", self.name, propagate_down));
        if propagate_down {
            for (x, y) in inputs.iter().zip(outputs.iter()) {
                let g = gradient_values(y)?;
                x.allocate_gradient(true)?.set_data(g)?;
            }
        }
        Ok(0.0)
    }
}

/// `y = w * x` with a scalar weight.
pub struct Scale {
    name: String,
    w: Blob,
    frozen: bool,
}

impl Scale {
    pub fn new(name: &str, init: f64) -> Self {
        Scale {
            name: name.to_string(),
            w: Blob::with_filler(format!("{}.w", name), Box::new(Constant::new(init))),
            frozen: false,
        }
    }

    pub fn freeze(mut self) -> Self {
        self.frozen = true;
        self
    }
}

impl Parameter for Scale {
    fn params<'a>(&'a self, p: &mut Vec<&'a Blob>) {
        p.push(&self.w);
    }
}

impl Layer for Scale {
    fn name(&self) -> &str {
        &self.name
    }

    fn frozen(&self) -> bool {
        self.frozen
    }

    fn forward(&mut self, inputs: &[&Blob], outputs: &[&Blob]) -> Result<()> {
        let w = self.w.allocate_data([1], DataType::Double, Fill::OnAlloc)?.to_vec::<f64>()?[0];
        let x = inputs[0].data()?;
        let y = outputs[0].allocate_data(x.shape(), DataType::Double, Fill::Skip)?;
        y.set_data(x.to_vec::<f64>()?.iter().map(|v| v * w).collect::<Vec<_>>())?;
        Ok(())
    }

    fn backward(&mut self, inputs: &[&Blob], outputs: &[&Blob], propagate_down: bool) -> Result<f64> {
        let w = self.w.data()?.to_vec::<f64>()?[0];
        let x = inputs[0].data()?.to_vec::<f64>()?;
        let dy = gradient_values(outputs[0])?;

        let dw: f64 = x.iter().zip(&dy).map(|(a, b)| a * b).sum();
        self.w.allocate_gradient(true)?.set_data(vec![dw])?;

        if propagate_down {
            let dx = dy.iter().map(|g| g * w).collect::<Vec<_>>();
            inputs[0].allocate_gradient(true)?.set_data(dx)?;
        }
        Ok(0.0)
    }
}

/// `0.5 * sum(y^2)`; the input gradient is `y`.
pub struct SquaredLoss {
    name: String,
    loss: f64,
    log: Option<Log>,
}

impl SquaredLoss {
    pub fn new(name: &str) -> Self {
        SquaredLoss {
            name: name.to_string(),
            loss: 0.0,
            log: None,
        }
    }

    pub fn logged(mut self, log: &Log) -> Self {
        self.log = Some(log.clone());
        self
    }
}

impl Loss for SquaredLoss {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, inputs: &[&Blob], propagate_down: bool) -> Result<()> {
        record(&self.log, format!("forward:{}:{}", self.name, propagate_down));
        let y = inputs[0].data()?.to_vec::<f64>()?;
        self.loss = 0.5 * y.iter().map(|v| v * v).sum::<f64>();

        if propagate_down {
            inputs[0].allocate_gradient(true)?.set_data(y)?;
        }
        Ok(())
    }

    fn loss(&self) -> f64 {
        self.loss
    }
}
