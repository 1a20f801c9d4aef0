use std::iter;

use itertools::Itertools;

use crate::blob::Blob;
use crate::error::Result;
use crate::layers::LayerNode;
use crate::net::{Net, NetError};
use crate::tensor::data::DataType;
use crate::tensor::{BufferError, Tensor};

/// Which values a layer check differentiates with respect to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    Param,
    Input,
}

/// Scalar reduction of a layer's flattened outputs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Objective {
    SumOfSquares,
    Output(usize),
}

impl Objective {
    fn value(&self, y: &[f64]) -> f64 {
        match *self {
            Objective::SumOfSquares => y.iter().map(|v| v * v).sum(),
            Objective::Output(i) => y.get(i).copied().unwrap_or(0.0),
        }
    }

    // gradient of `value` with respect to `y`
    fn seed(&self, y: &[f64]) -> Vec<f64> {
        match *self {
            Objective::SumOfSquares => y.iter().map(|v| 2.0 * v).collect(),
            Objective::Output(i) => (0..y.len()).map(|j| if j == i { 1.0 } else { 0.0 }).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mismatch {
    pub target: Target,
    /// None for whole-net checks, which differentiate the value
    /// `forward_backward` returns.
    pub objective: Option<Objective>,
    pub error: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GradReport {
    pub max_error: f64,
    /// The first case above the threshold. Checking stops there.
    pub mismatch: Option<Mismatch>,
}

impl GradReport {
    pub fn passed(&self) -> bool {
        self.mismatch.is_none()
    }
}

/// Compares written gradients with central differences. The error of one case
/// is the euclidean distance between the two gradient vectors.
///
/// A gradient passes only if it points uphill, which is what
/// [`Blob::apply_update`] expects when it subtracts it.
pub struct GradChecker {
    threshold: f64,
    step: f64,
}

impl GradChecker {
    pub fn new(threshold: f64) -> Self {
        GradChecker { threshold, step: 1e-6 }
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    /// Checks the gradients of every parameter of the non-frozen layers
    /// against the value `forward_backward` returns. The net must be finished
    /// and deterministic. Parameters are restored afterwards.
    pub fn check_net(&self, net: &mut Net) -> Result<GradReport> {
        net.forward_backward()?;

        let (params, analytic) = {
            let blobs = trainable_params(net)?;
            (data_handles(&blobs)?, gradient_values(&blobs)?)
        };

        let mut numeric = Vec::with_capacity(analytic.len());
        for k in 0..analytic.len() {
            numeric.push(self.central_difference(&params, k, || net.forward_backward())?);
        }

        // leave gradients matching the restored parameters
        net.forward_backward()?;

        let error = distance(&analytic, &numeric);
        tracing::debug!(net = %net.name(), params = analytic.len(), error, "checked net gradients");

        let mismatch = (error > self.threshold).then(|| Mismatch {
            target: Target::Param,
            objective: None,
            error,
        });
        Ok(GradReport {
            max_error: error,
            mismatch,
        })
    }

    /// Checks one layer's parameter and input gradients, first against the
    /// sum of squared outputs, then against each output element. A loss has
    /// no outputs; its objective is the loss itself.
    pub fn check(&self, layer: &mut LayerNode, inputs: &[&Blob], outputs: &[&Blob]) -> Result<GradReport> {
        if layer.is_data_source() {
            return Err(NetError::InvalidOperation(format!(
                "data source '{}' has no gradients to check",
                layer.name()
            ))
            .into());
        }

        layer.forward(inputs, outputs, false)?;
        let num_outputs = outputs
            .iter()
            .map(|o| o.data().map(|t| t.size()))
            .sum::<Result<usize>>()?;
        let objectives = iter::once(Objective::SumOfSquares)
            .chain((0..num_outputs).map(Objective::Output))
            .collect_vec();

        let mut max_error = 0.0_f64;

        for target in [Target::Param, Target::Input] {
            let x = match target {
                Target::Param => {
                    let mut p = Vec::new();
                    layer.params(&mut p);
                    data_handles(&p)?
                }
                Target::Input => data_handles(inputs)?,
            };
            let count: usize = x.iter().map(|t| t.size()).sum();
            if count == 0 {
                continue;
            }

            for &objective in &objectives {
                let analytic = analytic_gradient(layer, inputs, outputs, objective, target)?;

                let mut numeric = Vec::with_capacity(count);
                for k in 0..count {
                    numeric.push(self.central_difference(&x, k, || {
                        evaluate(layer, inputs, outputs, objective)
                    })?);
                }

                let error = distance(&analytic, &numeric);
                max_error = max_error.max(error);

                if error > self.threshold {
                    tracing::warn!(layer = %layer.name(), ?target, ?objective, error, "gradient mismatch");
                    return Ok(GradReport {
                        max_error,
                        mismatch: Some(Mismatch {
                            target,
                            objective: Some(objective),
                            error,
                        }),
                    });
                }
            }
        }

        tracing::debug!(layer = %layer.name(), max_error, "checked layer gradients");
        Ok(GradReport {
            max_error,
            mismatch: None,
        })
    }

    // Restores element `k` even when `f` fails.
    fn central_difference<F>(&self, x: &[Tensor], k: usize, mut f: F) -> Result<f64>
    where
        F: FnMut() -> Result<f64>,
    {
        let orig = get(x, k)?;

        let plus = set(x, k, orig + self.step).and_then(|_| f());
        let minus = set(x, k, orig - self.step).and_then(|_| f());
        set(x, k, orig)?;

        Ok((plus? - minus?) / (2.0 * self.step))
    }
}

// ******************************** Layer passes ******************************** //

fn evaluate(layer: &mut LayerNode, inputs: &[&Blob], outputs: &[&Blob], objective: Objective) -> Result<f64> {
    layer.forward(inputs, outputs, false)?;
    let y = flatten(&data_handles(outputs)?)?;

    for o in outputs {
        o.allocate_gradient(true)?;
    }
    // regularization penalties and stored losses
    let extra = layer.backward(inputs, outputs, false)?;

    Ok(objective.value(&y) + extra)
}

fn analytic_gradient(
    layer: &mut LayerNode,
    inputs: &[&Blob],
    outputs: &[&Blob],
    objective: Objective,
    target: Target,
) -> Result<Vec<f64>> {
    let propagate_down = target == Target::Input;

    for x in inputs {
        x.allocate_gradient(true)?;
    }
    let mut params = Vec::new();
    layer.params(&mut params);
    for p in params {
        p.allocate_gradient(true)?;
    }

    layer.forward(inputs, outputs, propagate_down)?;
    let y = flatten(&data_handles(outputs)?)?;

    let seeds = outputs.iter().map(|o| o.allocate_gradient(true)).collect::<Result<Vec<_>>>()?;
    write_flat(&seeds, &objective.seed(&y))?;

    layer.backward(inputs, outputs, propagate_down)?;

    match target {
        Target::Param => {
            let mut p = Vec::new();
            layer.params(&mut p);
            gradient_values(&p)
        }
        Target::Input => gradient_values(inputs),
    }
}

// ******************************** Flat views ******************************** //

fn trainable_params(net: &Net) -> Result<Vec<&Blob>> {
    let mut params = Vec::new();
    for name in net.forward_order()? {
        let layer = net.layer(name)?;
        if !layer.frozen() {
            layer.params(&mut params);
        }
    }
    Ok(params)
}

fn data_handles(blobs: &[&Blob]) -> Result<Vec<Tensor>> {
    blobs.iter().map(|b| b.data()).collect()
}

// A blob without a gradient contributes zeros.
fn gradient_values(blobs: &[&Blob]) -> Result<Vec<f64>> {
    let mut values = Vec::new();
    for blob in blobs {
        if blob.has_gradient() {
            values.extend(flatten(&[blob.gradient()?])?);
        } else {
            values.extend(iter::repeat(0.0).take(blob.data()?.size()));
        }
    }
    Ok(values)
}

fn not_float(t: &Tensor) -> BufferError {
    BufferError::IncompatibleType(t.data_type(), DataType::Double)
}

fn flatten(tensors: &[Tensor]) -> Result<Vec<f64>> {
    let mut values = Vec::new();
    for t in tensors {
        let host = t.host();
        for i in 0..host.len() {
            values.push(host.get_f64(i).ok_or_else(|| not_float(t))?);
        }
    }
    Ok(values)
}

fn write_flat(tensors: &[Tensor], values: &[f64]) -> Result<()> {
    let mut values = values.iter();
    for t in tensors {
        let mut host = t.host_mut();
        for (i, &v) in (0..host.len()).zip(values.by_ref()) {
            if !host.set_f64(i, v) {
                return Err(not_float(t).into());
            }
        }
    }
    Ok(())
}

fn locate(x: &[Tensor], mut k: usize) -> Result<(&Tensor, usize)> {
    for t in x {
        if k < t.size() {
            return Ok((t, k));
        }
        k -= t.size();
    }
    Err(NetError::InvalidOperation("element index past the checked values".to_string()).into())
}

fn get(x: &[Tensor], k: usize) -> Result<f64> {
    let (t, i) = locate(x, k)?;
    let value = t.host().get_f64(i);
    value.ok_or_else(|| not_float(t).into())
}

fn set(x: &[Tensor], k: usize, value: f64) -> Result<()> {
    let (t, i) = locate(x, k)?;
    let written = t.host_mut().set_f64(i, value);
    if !written {
        return Err(not_float(t).into());
    }
    Ok(())
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use crate::blob::{Blob, Fill};
    use crate::error::{Error, Result};
    use crate::filler::Constant;
    use crate::gradcheck::{GradChecker, Target};
    use crate::layers::mock::{Bias, Scale, SquaredLoss};
    use crate::layers::source::ArraySource;
    use crate::layers::split::Split;
    use crate::layers::{Layer, LayerNode, Parameter};
    use crate::net::{FanoutPolicy, Net, NetConfig, NetError};
    use crate::tensor::data::DataType;
    use crate::tensor::Tensor;

    // `y = w * x` writing gradients that point downhill
    struct Descending {
        w: Blob,
    }

    impl Descending {
        fn new() -> Self {
            Descending {
                w: Blob::with_filler("d.w", Box::new(Constant::new(1.5))),
            }
        }
    }

    impl Parameter for Descending {
        fn params<'a>(&'a self, p: &mut Vec<&'a Blob>) {
            p.push(&self.w);
        }
    }

    impl Layer for Descending {
        fn name(&self) -> &str {
            "d"
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
            let dy = outputs[0].gradient()?.to_vec::<f64>()?;

            let dw: f64 = x.iter().zip(&dy).map(|(a, b)| a * b).sum();
            self.w.allocate_gradient(true)?.set_data(vec![-dw])?;
            if propagate_down {
                let dx = dy.iter().map(|g| -g * w).collect::<Vec<_>>();
                inputs[0].allocate_gradient(true)?.set_data(dx)?;
            }
            Ok(0.0)
        }
    }

    fn param_values(net: &Net) -> Vec<f64> {
        net.params()
            .unwrap()
            .iter()
            .flat_map(|p| p.data().unwrap().to_vec::<f64>().unwrap())
            .collect()
    }

    #[test]
    fn test_net_chain() {
        let mut net = Net::default();
        net.add_layer(LayerNode::generic(Bias::new("a", 2.0)), &[], &["x"]).unwrap();
        net.add_layer(LayerNode::generic(Scale::new("s", 1.5)), &["x"], &["y"]).unwrap();
        net.add_layer(LayerNode::loss(SquaredLoss::new("loss")), &["y"], &[]).unwrap();
        net.finish().unwrap();

        let report = GradChecker::new(1e-4).check_net(&mut net).unwrap();
        assert!(report.passed(), "{:?}", report);
        assert_eq!(param_values(&net), vec![2.0, 1.5]);
        // d/da = 1.5 * 3, d/ds = 2 * 3
        assert_eq!(net.params().unwrap()[0].gradient().unwrap().to_vec::<f64>().unwrap(), vec![4.5]);
    }

    #[test]
    fn test_net_with_split() {
        let config = NetConfig::new("split").with_fanout(FanoutPolicy::InsertSplit);
        let mut net = Net::new(config);
        net.add_layer(LayerNode::generic(Bias::new("a", 1.5)), &[], &["x"]).unwrap();
        net.add_layer(LayerNode::generic(Scale::new("p", 2.0)), &["x"], &["y"]).unwrap();
        net.add_layer(LayerNode::generic(Scale::new("q", -1.0)), &["x"], &["z"]).unwrap();
        net.add_layer(LayerNode::loss(SquaredLoss::new("l1")), &["y"], &[]).unwrap();
        net.add_layer(LayerNode::loss(SquaredLoss::new("l2")), &["z"], &[]).unwrap();
        net.finish().unwrap();

        let report = GradChecker::new(1e-4).check_net(&mut net).unwrap();
        assert!(report.passed(), "{:?}", report);
    }

    #[test]
    fn test_net_skips_frozen() {
        let mut net = Net::default();
        net.add_layer(LayerNode::generic(Bias::new("a", 2.0).freeze()), &[], &["x"]).unwrap();
        net.add_layer(LayerNode::generic(Scale::new("s", 0.5)), &["x"], &["y"]).unwrap();
        net.add_layer(LayerNode::loss(SquaredLoss::new("loss")), &["y"], &[]).unwrap();
        net.finish().unwrap();

        assert!(GradChecker::new(1e-4).check_net(&mut net).unwrap().passed());
    }

    #[test]
    fn test_net_wrong_sign() {
        let mut net = Net::default();
        net.add_layer(LayerNode::generic(Bias::new("a", 2.0)), &[], &["x"]).unwrap();
        net.add_layer(LayerNode::generic(Descending::new()), &["x"], &["y"]).unwrap();
        net.add_layer(LayerNode::loss(SquaredLoss::new("loss")), &["y"], &[]).unwrap();
        net.finish().unwrap();

        let report = GradChecker::new(1e-4).check_net(&mut net).unwrap();
        let mismatch = report.mismatch.unwrap();
        assert_eq!(mismatch.target, Target::Param);
        assert_eq!(mismatch.objective, None);
        assert_eq!(param_values(&net), vec![2.0, 1.5]);
    }

    #[test]
    fn test_net_not_finished() {
        let mut net = Net::default();
        assert!(matches!(
            GradChecker::new(1e-4).check_net(&mut net),
            Err(Error::Net(NetError::NotFinished))
        ));
    }

    #[test]
    fn test_layer_scale() {
        let x = Blob::new("x");
        x.alias_data(&Tensor::new([1.0_f64, -2.0, 3.0])).unwrap();
        let y = Blob::new("y");

        let mut layer = LayerNode::generic(Scale::new("s", 0.7));
        let report = GradChecker::new(1e-4).check(&mut layer, &[&x], &[&y]).unwrap();
        assert!(report.passed(), "{:?}", report);
        assert_eq!(x.data().unwrap().to_vec::<f64>().unwrap(), vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_layer_bias() {
        let y = Blob::new("y");
        let mut layer = LayerNode::generic(Bias::new("a", -0.3));
        assert!(GradChecker::new(1e-4).check(&mut layer, &[], &[&y]).unwrap().passed());
    }

    #[test]
    fn test_layer_split() {
        let x = Blob::new("x");
        x.alias_data(&Tensor::new([0.5_f64, -1.0])).unwrap();
        let (a, b) = (Blob::new("x_split_0"), Blob::new("x_split_1"));

        let mut layer = LayerNode::generic(Split::new("x_split"));
        let report = GradChecker::new(1e-4).check(&mut layer, &[&x], &[&a, &b]).unwrap();
        assert!(report.passed(), "{:?}", report);
    }

    #[test]
    fn test_layer_loss() {
        let y = Blob::new("y");
        y.alias_data(&Tensor::new([1.0_f64, 2.0])).unwrap();

        let mut layer = LayerNode::loss(SquaredLoss::new("loss"));
        assert!(GradChecker::new(1e-4).check(&mut layer, &[&y], &[]).unwrap().passed());
    }

    #[test]
    fn test_layer_wrong_sign() {
        let x = Blob::new("x");
        x.alias_data(&Tensor::new([1.0_f64, 2.0])).unwrap();
        let y = Blob::new("y");

        let mut layer = LayerNode::generic(Descending::new());
        let report = GradChecker::new(1e-4).check(&mut layer, &[&x], &[&y]).unwrap();
        assert_eq!(report.mismatch.unwrap().target, Target::Param);
    }

    #[test]
    fn test_data_source_rejected() {
        let y = Blob::new("y");
        let mut layer = LayerNode::data_source(ArraySource::new("src", vec![Tensor::new([1.0_f64])]));
        assert!(matches!(
            GradChecker::new(1e-4).check(&mut layer, &[], &[&y]),
            Err(Error::Net(NetError::InvalidOperation(_)))
        ));
    }
}
