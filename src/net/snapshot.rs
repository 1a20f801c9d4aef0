use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::blob::{Blob, BlobError, Fill};
use crate::error::Result;
use crate::layers::split::Split;
use crate::layers::{LayerKind, LayerNode};
use crate::net::{Net, NetConfig, NetError};
use crate::shape::{display_comma, Shape};
use crate::tensor::data::{DataType, HostData};
use crate::tensor::Tensor;

// ******************************** Summary ******************************** //

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub name: String,
    pub type_name: String,
    pub kind: LayerKind,
    pub needs: Vec<String>,
    pub provides: Vec<String>,
    pub frozen: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobSummary {
    pub name: String,
    pub extents: Option<Vec<usize>>,
    pub data_type: Option<DataType>,
    pub external: bool,
}

/// Read-only view of a net's structure for inspection tools.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetSummary {
    pub name: String,
    pub finished: bool,
    pub layers: Vec<LayerSummary>,
    pub blobs: Vec<BlobSummary>,
}

impl Display for NetSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "net '{}' ({} layers, {} blobs)", self.name, self.layers.len(), self.blobs.len())?;

        for l in &self.layers {
            writeln!(
                f,
                "  {} [{}{}] ({}) -> ({})",
                l.name,
                l.type_name,
                if l.frozen { ", frozen" } else { "" },
                l.needs.iter().join(", "),
                l.provides.iter().join(", ")
            )?;
        }

        for b in &self.blobs {
            let desc = match (&b.extents, b.data_type) {
                (Some(e), Some(t)) => format!("{}({})", t, display_comma(e)),
                _ => "empty".to_string(),
            };
            writeln!(f, "  {}: {}{}", b.name, desc, if b.external { " (input)" } else { "" })?;
        }
        Ok(())
    }
}

impl Net {
    pub fn summary(&self) -> NetSummary {
        let layers = self
            .graph
            .layers
            .iter()
            .map(|e| LayerSummary {
                name: e.node.name().to_string(),
                type_name: e.node.type_name().to_string(),
                kind: e.node.kind(),
                needs: self.blob_names_of(&e.needs),
                provides: self.blob_names_of(&e.provides),
                frozen: e.node.frozen(),
            })
            .collect();

        let blobs = self
            .graph
            .blobs
            .iter()
            .map(|e| {
                let desc = e.blob.desc();
                BlobSummary {
                    name: e.blob.name().to_string(),
                    extents: desc.as_ref().map(|d| d.shape.extents().to_vec()),
                    data_type: desc.map(|d| d.data_type),
                    external: e.is_external(),
                }
            })
            .collect();

        NetSummary {
            name: self.config.name.clone(),
            finished: self.is_finished(),
            layers,
            blobs,
        }
    }
}

// ******************************** Snapshot ******************************** //

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub extents: Vec<usize>,
    pub data: HostData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub name: String,
    /// `None` for a parameter the layer has not allocated yet.
    pub value: Option<TensorRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    pub kind: LayerKind,
    pub type_name: String,
    pub needs: Vec<String>,
    pub provides: Vec<String>,
    pub frozen: bool,
    pub params: Vec<ParamRecord>,
}

/// Structure plus parameter data, in registration order. Gradients are
/// derived state and never recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetSnapshot {
    pub name: String,
    pub layers: Vec<LayerRecord>,
}

impl Net {
    pub fn snapshot(&self) -> NetSnapshot {
        let layers = self
            .graph
            .layers
            .iter()
            .map(|e| {
                let mut params = Vec::new();
                e.node.params(&mut params);

                LayerRecord {
                    name: e.node.name().to_string(),
                    kind: e.node.kind(),
                    type_name: e.node.type_name().to_string(),
                    needs: self.blob_names_of(&e.needs),
                    provides: self.blob_names_of(&e.provides),
                    frozen: e.node.frozen(),
                    params: params.into_iter().map(param_record).collect(),
                }
            })
            .collect();

        NetSnapshot {
            name: self.config.name.clone(),
            layers,
        }
    }

    /// Rebuilds a net from a snapshot. `factory` constructs every layer except
    /// the split layers, which are recreated directly. Registration is
    /// replayed in order, parameter data copied in, and the net finished.
    pub fn restore<F>(snapshot: &NetSnapshot, config: NetConfig, mut factory: F) -> Result<Net>
    where
        F: FnMut(&LayerRecord) -> Result<LayerNode>,
    {
        let mut net = Net::new(config);

        for record in &snapshot.layers {
            let node = if record.kind == LayerKind::Generic && record.type_name == Split::TYPE_NAME {
                LayerNode::generic(Split::new(&record.name))
            } else {
                factory(record)?
            };

            if node.name() != record.name {
                return Err(NetError::InvalidOperation(format!(
                    "factory built layer '{}' for record '{}'",
                    node.name(),
                    record.name
                ))
                .into());
            }

            let mut params = Vec::new();
            node.params(&mut params);
            if params.len() != record.params.len() {
                return Err(BlobError::ShapeMismatch {
                    name: record.name.clone(),
                    expected: format!("{} parameters", record.params.len()),
                    found: format!("{} parameters", params.len()),
                }
                .into());
            }

            for (blob, p) in params.into_iter().zip(record.params.iter()) {
                if let Some(value) = &p.value {
                    restore_param(blob, value)?;
                }
            }

            let needs = record.needs.iter().map(String::as_str).collect_vec();
            let provides = record.provides.iter().map(String::as_str).collect_vec();
            net.add_layer(node, &needs, &provides)?;
        }

        net.finish()?;
        tracing::debug!(net = %snapshot.name, layers = snapshot.layers.len(), "restored net");
        Ok(net)
    }

    fn blob_names_of(&self, blobs: &[usize]) -> Vec<String> {
        blobs
            .iter()
            .map(|&b| self.graph.blobs[b].blob.name().to_string())
            .collect()
    }
}

fn param_record(blob: &Blob) -> ParamRecord {
    ParamRecord {
        name: blob.name().to_string(),
        value: blob.data().ok().map(|t| TensorRecord {
            extents: t.extents().to_vec(),
            data: t.host().clone(),
        }),
    }
}

fn restore_param(blob: &Blob, value: &TensorRecord) -> Result<()> {
    let src = Tensor::from_host(Shape::new(value.extents.as_slice())?, value.data.clone())?;
    let dst = blob.allocate_data(src.shape(), src.data_type(), Fill::Skip)?;
    dst.host_mut().copy_from(&src.host());
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::{Error, Result};
    use crate::layers::mock::{Bias, Identity, Scale, SquaredLoss};
    use crate::layers::LayerNode;
    use crate::net::snapshot::{LayerRecord, NetSnapshot};
    use crate::net::{FanoutPolicy, Net, NetConfig, NetError};

    fn build() -> Net {
        let mut net = Net::new(NetConfig::new("chain"));
        net.add_layer(LayerNode::generic(Bias::new("a", 3.0)), &[], &["x"]).unwrap();
        net.add_layer(LayerNode::generic(Scale::new("b", 0.5)), &["x"], &["y"]).unwrap();
        net.add_layer(LayerNode::loss(SquaredLoss::new("loss")), &["y"], &[]).unwrap();
        net.finish().unwrap();
        net
    }

    fn factory(record: &LayerRecord) -> Result<LayerNode> {
        // fresh instances with different initial values; restore must overwrite them
        Ok(match record.name.as_str() {
            "a" => LayerNode::generic(Bias::new("a", 0.0)),
            "b" => LayerNode::generic(Scale::new("b", 0.0)),
            "c" => LayerNode::generic(Identity::new("c")),
            "d" => LayerNode::generic(Identity::new("d")),
            "loss" => LayerNode::loss(SquaredLoss::new("loss")),
            other => return Err(NetError::UnknownLayer(other.to_string()).into()),
        })
    }

    fn param_values(net: &Net) -> Vec<Vec<f64>> {
        net.params()
            .unwrap()
            .iter()
            .map(|p| p.data().unwrap().to_vec::<f64>().unwrap())
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let mut net = build();
        net.forward_backward().unwrap();
        net.update().unwrap();
        let before = param_values(&net);

        let snapshot = net.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: NetSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);

        let mut restored = Net::restore(&parsed, NetConfig::new("chain"), factory).unwrap();
        assert!(restored.is_finished());
        assert_eq!(restored.forward_order().unwrap(), vec!["a", "b", "loss"]);
        assert_eq!(param_values(&restored), before);
        assert!(restored.params().unwrap().iter().all(|p| !p.has_gradient()));

        // both nets continue identically
        let l1 = net.forward_backward().unwrap();
        let l2 = restored.forward_backward().unwrap();
        assert!((l1 - l2).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_excludes_gradients() {
        let mut net = build();
        net.forward_backward().unwrap();

        let snapshot = net.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("diff"));
        assert!(!json.contains("gradient"));
        assert_eq!(snapshot.layers[0].params.len(), 1);
        assert!(snapshot.layers[0].params[0].value.is_some());
    }

    #[test]
    fn test_unallocated_params() {
        // never run: parameters are recorded without values
        let snapshot = build().snapshot();
        assert!(snapshot.layers[0].params[0].value.is_none());
        let restored = Net::restore(&snapshot, NetConfig::default(), factory).unwrap();
        assert!(!restored.params().unwrap()[0].has_data());
    }

    #[test]
    fn test_restore_splits() {
        let mut net = Net::new(NetConfig::new("fan").with_fanout(FanoutPolicy::InsertSplit));
        net.add_layer(LayerNode::generic(Bias::new("a", 1.0)), &[], &["x"]).unwrap();
        net.add_layer(LayerNode::generic(Identity::new("c")), &["x"], &["y"]).unwrap();
        net.add_layer(LayerNode::generic(Identity::new("d")), &["x"], &["z"]).unwrap();
        net.finish().unwrap();

        // the restored graph already carries the split, so rejection is fine
        let restored = Net::restore(&net.snapshot(), NetConfig::new("fan"), factory).unwrap();
        assert_eq!(restored.forward_order().unwrap(), vec!["a", "x_split", "c", "d"]);
        assert_eq!(restored.needs("c").unwrap(), vec!["x_split_0"]);
    }

    #[test]
    fn test_restore_param_count_mismatch() {
        let snapshot = build().snapshot();
        let res = Net::restore(&snapshot, NetConfig::default(), |r: &LayerRecord| {
            if r.name == "b" {
                Ok(LayerNode::generic(Identity::new("b")))
            } else {
                factory(r)
            }
        });
        assert!(matches!(res, Err(Error::Blob(_))));
    }

    #[test]
    fn test_summary() {
        let mut net = build();
        net.forward_backward().unwrap();
        let summary = net.summary();

        assert!(summary.finished);
        assert_eq!(summary.layers.len(), 3);
        assert_eq!(summary.layers[1].needs, vec!["x"]);
        assert_eq!(summary.blobs[0].extents, Some(vec![1]));
        assert!(!summary.blobs[0].external);

        let text = summary.to_string();
        assert!(text.starts_with("net 'chain' (3 layers, 2 blobs)"));
        assert!(text.contains("x: double(1)"));
    }
}
