use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::blob::{Blob, BlobError};
use crate::error::Result;
use crate::layers::LayerNode;
use crate::net::graph::Graph;
use crate::net::plan::ExecutionPlan;
use crate::tensor::Tensor;

mod graph;
mod plan;
pub mod snapshot;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum NetError {
    #[error("name '{0}' is already taken")]
    DuplicateName(String),

    #[error("graph has a cycle through [{}]", .0.join(", "))]
    CyclicGraph(Vec<String>),

    #[error("blob '{blob}' is produced by several layers [{}]", .producers.join(", "))]
    MultiProducer { blob: String, producers: Vec<String> },

    #[error("blob '{blob}' is consumed by several layers [{}]", .consumers.join(", "))]
    Fanout { blob: String, consumers: Vec<String> },

    #[error("net is not finished")]
    NotFinished,

    #[error("net is finished; cannot add layer '{0}'")]
    FrozenMutation(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("no layer named '{0}'")]
    UnknownLayer(String),

    #[error("no blob named '{0}'")]
    UnknownBlob(String),
}

/// What `finish` does with a blob that has more than one consumer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum FanoutPolicy {
    /// Fail with [`NetError::Fanout`].
    #[default]
    Reject,
    /// Route the consumers through an automatically inserted split layer.
    InsertSplit,
}

#[derive(Clone, Debug)]
pub struct NetConfig {
    pub name: String,
    pub fanout: FanoutPolicy,
}

impl NetConfig {
    pub fn new<T>(name: T) -> Self
    where
        T: AsRef<str>,
    {
        NetConfig {
            name: name.as_ref().to_string(),
            fanout: FanoutPolicy::Reject,
        }
    }

    pub fn with_fanout(mut self, fanout: FanoutPolicy) -> Self {
        self.fanout = fanout;
        self
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig::new("net")
    }
}

/// A directed acyclic graph of layers and the blobs they exchange.
///
/// Layers are registered with the names of the blobs they need and provide;
/// blobs come into existence the first time they are named. `finish`
/// validates the graph and compiles the execution plan, after which the
/// structure is fixed until `unfinish` is called.
pub struct Net {
    config: NetConfig,
    graph: Graph,
    plan: Option<ExecutionPlan>,
}

impl Default for Net {
    fn default() -> Self {
        Net::new(NetConfig::default())
    }
}

impl Net {
    pub fn new(config: NetConfig) -> Self {
        Net {
            config,
            graph: Graph::default(),
            plan: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn is_finished(&self) -> bool {
        self.plan.is_some()
    }

    // ******************************** Construction ******************************** //

    /// Registers a layer. Nothing changes when the call fails.
    pub fn add_layer<L>(&mut self, layer: L, needs: &[&str], provides: &[&str]) -> Result<()>
    where
        L: Into<LayerNode>,
    {
        let node = layer.into();

        if self.is_finished() {
            return Err(NetError::FrozenMutation(node.name().to_string()).into());
        }

        self.graph.check_layer(&node, needs, provides)?;

        tracing::trace!(layer = %node.name(), ?needs, ?provides, "adding layer");
        self.graph.insert_layer(node, needs, provides);
        Ok(())
    }

    /// Checks the graph without changing it: acyclic, at most one producer per
    /// blob, and at most one consumer per blob unless the fan-out policy can
    /// insert splits.
    pub fn validate(&self) -> Result<()> {
        self.graph.topo_order()?;
        self.graph.check_producers()?;

        let fanned = self.graph.fanned_out();
        match (self.config.fanout, fanned.first()) {
            (_, None) => Ok(()),
            (FanoutPolicy::Reject, Some(&blob)) => Err(self.graph.fanout_error(blob).into()),
            (FanoutPolicy::InsertSplit, Some(_)) => self.graph.check_splits(&fanned),
        }
    }

    /// Validates the graph and compiles the plan. On failure the net stays
    /// unfinished and the graph untouched. Finishing twice is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }

        self.validate()?;

        for blob in self.graph.fanned_out() {
            self.graph.insert_split(blob);
        }

        let order = self.graph.topo_order()?;
        self.plan = Some(ExecutionPlan::compile(&self.graph, &order));

        tracing::debug!(net = %self.config.name, layers = self.graph.layers.len(), blobs = self.graph.blobs.len(), "net finished");
        Ok(())
    }

    /// Drops the plan so the graph can be extended again. Inserted split
    /// layers stay in place.
    pub fn unfinish(&mut self) {
        if self.plan.take().is_some() {
            tracing::debug!(net = %self.config.name, "net unfinished");
        }
    }

    // ******************************** Execution ******************************** //

    /// One forward sweep then one backward sweep. Returns the summed scalar
    /// contributions of every backward step plus the stored loss of every
    /// loss layer that the backward sweep does not visit.
    pub fn forward_backward(&mut self) -> Result<f64> {
        self.run_forward()?;

        let plan = self.plan.as_ref().ok_or(NetError::NotFinished)?;
        let mut loss = 0.0;

        for step in &plan.backward {
            loss += self
                .graph
                .run(step.layer, "backward", |node, x, y| node.backward(x, y, step.propagate_down))?;
        }

        for step in plan.forward.iter().filter(|s| !s.need_backward) {
            loss += self.graph.layers[step.layer].node.stored_loss();
        }
        Ok(loss)
    }

    /// Forward sweep only. Loss layers still write their input gradients where
    /// the plan propagates. Returns the summed stored losses.
    pub fn forward(&mut self) -> Result<f64> {
        self.run_forward()?;

        Ok(self.graph.layers.iter().map(|e| e.node.stored_loss()).sum())
    }

    fn run_forward(&mut self) -> Result<()> {
        let plan = self.plan.as_ref().ok_or(NetError::NotFinished)?;

        for step in &plan.forward {
            self.graph
                .run(step.layer, "forward", |node, x, y| node.forward(x, y, step.propagate_down))?;
        }
        Ok(())
    }

    /// Applies one update step on every layer, in forward order.
    pub fn update(&mut self) -> Result<()> {
        let plan = self.plan.as_ref().ok_or(NetError::NotFinished)?;

        for step in &plan.forward {
            self.graph.layers[step.layer].node.update()?;
        }
        Ok(())
    }

    /// Inference pass. Each `(blob, tensor)` pair is aliased into the named
    /// blob, which must be an external input or a data-source output; data
    /// sources whose outputs are all bound this way are skipped, and a source
    /// cannot be bound in part.
    /// Returns the data of every blob no layer other than a loss consumes.
    /// Gradients are neither allocated nor written.
    pub fn predict<'a, I, K>(&mut self, inputs: I) -> Result<HashMap<String, Tensor>>
    where
        I: IntoIterator<Item = (K, &'a Tensor)>,
        K: AsRef<str>,
    {
        let plan = self.plan.as_ref().ok_or(NetError::NotFinished)?;

        // resolve every name before binding anything
        let mut resolved = Vec::new();
        for (name, tensor) in inputs {
            let blob = self.graph.blob_index(name.as_ref())?;
            let entry = &self.graph.blobs[blob];
            if let Some(&producer) = entry.producers.first() {
                let node = &self.graph.layers[producer].node;
                if !node.is_data_source() {
                    return Err(NetError::InvalidOperation(format!(
                        "blob '{}' is computed by layer '{}' and cannot be bound",
                        name.as_ref(),
                        node.name()
                    ))
                    .into());
                }
            }
            resolved.push((blob, tensor));
        }
        let bound: HashSet<usize> = resolved.iter().map(|&(b, _)| b).collect();

        // a source either runs or is replaced by the caller as a whole
        for entry in self.graph.layers.iter().filter(|e| e.node.is_data_source()) {
            let count = entry.provides.iter().filter(|&b| bound.contains(b)).count();
            if count > 0 && count < entry.provides.len() {
                return Err(NetError::InvalidOperation(format!(
                    "data source '{}' has {} of {} outputs bound",
                    entry.node.name(),
                    count,
                    entry.provides.len()
                ))
                .into());
            }
        }

        for (blob, tensor) in resolved {
            self.graph.blobs[blob].blob.alias_data(tensor)?;
        }

        let steps = plan
            .forward
            .iter()
            .filter(|s| {
                let entry = &self.graph.layers[s.layer];
                let fed = entry.node.is_data_source() && entry.provides.iter().all(|b| bound.contains(b));
                !fed && !entry.node.is_terminal()
            })
            .map(|s| s.layer)
            .collect_vec();

        for &layer in &steps {
            for &b in &self.graph.layers[layer].needs {
                let entry = &self.graph.blobs[b];
                if entry.is_external() && !entry.blob.has_data() {
                    return Err(BlobError::UninitializedData(entry.blob.name().to_string()).into());
                }
            }
        }

        for layer in steps {
            self.graph.run(layer, "predict", |node, x, y| node.predict(x, y))?;
        }

        let outputs = self
            .output_indices()
            .into_iter()
            .filter_map(|b| {
                let blob = &self.graph.blobs[b].blob;
                blob.data().ok().map(|t| (blob.name().to_string(), t))
            })
            .collect();
        Ok(outputs)
    }

    /// Binds `tensor` as the data of an external input blob.
    pub fn feed(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let entry = &self.graph.blobs[self.graph.blob_index(name)?];

        if !entry.is_external() {
            let producer = self.graph.layers[entry.producers[0]].node.name();
            return Err(NetError::InvalidOperation(format!(
                "blob '{}' is produced by layer '{}'",
                name, producer
            ))
            .into());
        }

        entry.blob.alias_data(tensor)?;
        Ok(())
    }

    // ******************************** Introspection ******************************** //

    /// Every parameter blob, layer by layer in forward order.
    pub fn params(&self) -> Result<Vec<&Blob>> {
        let plan = self.plan.as_ref().ok_or(NetError::NotFinished)?;

        let mut params = Vec::new();
        for step in &plan.forward {
            self.graph.layers[step.layer].node.params(&mut params);
        }
        Ok(params)
    }

    pub fn layer(&self, name: &str) -> Result<&LayerNode> {
        Ok(&self.graph.layers[self.graph.layer_index(name)?].node)
    }

    pub fn blob(&self, name: &str) -> Result<&Blob> {
        Ok(&self.graph.blobs[self.graph.blob_index(name)?].blob)
    }

    /// Layer names in registration order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.graph.layers.iter().map(|e| e.node.name()).collect()
    }

    /// Blob names in order of first reference.
    pub fn blob_names(&self) -> Vec<&str> {
        self.graph.blobs.iter().map(|e| e.blob.name()).collect()
    }

    pub fn needs(&self, layer: &str) -> Result<Vec<&str>> {
        let entry = &self.graph.layers[self.graph.layer_index(layer)?];
        Ok(entry.needs.iter().map(|&b| self.graph.blobs[b].blob.name()).collect())
    }

    pub fn provides(&self, layer: &str) -> Result<Vec<&str>> {
        let entry = &self.graph.layers[self.graph.layer_index(layer)?];
        Ok(entry.provides.iter().map(|&b| self.graph.blobs[b].blob.name()).collect())
    }

    /// Blobs without a producer; their data has to come from the caller.
    pub fn external_inputs(&self) -> Vec<&str> {
        self.graph
            .blobs
            .iter()
            .filter(|e| e.is_external())
            .map(|e| e.blob.name())
            .collect()
    }

    /// Blobs that no layer other than a loss consumes.
    pub fn outputs(&self) -> Vec<&str> {
        self.output_indices()
            .into_iter()
            .map(|b| self.graph.blobs[b].blob.name())
            .collect()
    }

    fn output_indices(&self) -> Vec<usize> {
        (0..self.graph.blobs.len())
            .filter(|&b| {
                self.graph.blobs[b]
                    .consumers
                    .iter()
                    .all(|&l| self.graph.layers[l].node.is_terminal())
            })
            .collect()
    }

    pub fn forward_order(&self) -> Result<Vec<&str>> {
        let plan = self.plan.as_ref().ok_or(NetError::NotFinished)?;
        Ok(plan
            .forward
            .iter()
            .map(|s| self.graph.layers[s.layer].node.name())
            .collect())
    }

    /// Layers the backward sweep visits, each with its propagate-down flag.
    pub fn backward_order(&self) -> Result<Vec<(&str, bool)>> {
        let plan = self.plan.as_ref().ok_or(NetError::NotFinished)?;
        Ok(plan
            .backward
            .iter()
            .map(|s| (self.graph.layers[s.layer].node.name(), s.propagate_down))
            .collect())
    }
}
