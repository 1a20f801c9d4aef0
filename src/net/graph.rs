use itertools::Itertools;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Instant;

use crate::blob::Blob;
use crate::error::Result;
use crate::layers::split::Split;
use crate::layers::LayerNode;
use crate::net::NetError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum Node {
    Layer(usize),
    Blob(usize),
}

pub(crate) struct LayerEntry {
    pub node: LayerNode,
    pub needs: Vec<usize>,
    pub provides: Vec<usize>,
    seq: usize,
}

pub(crate) struct BlobEntry {
    pub blob: Blob,
    pub producers: Vec<usize>,
    pub consumers: Vec<usize>,
    seq: usize,
}

impl BlobEntry {
    pub fn is_external(&self) -> bool {
        self.producers.is_empty()
    }
}

/// Layers and blobs in two index-addressed tables. Adjacency is stored on
/// both sides, so every traversal is a plain index walk.
#[derive(Default)]
pub(crate) struct Graph {
    pub layers: Vec<LayerEntry>,
    pub blobs: Vec<BlobEntry>,
    names: HashMap<String, Node>,
    // registration counter shared by both tables; ties in the sort break on it
    seq: usize,
}

impl Graph {
    pub fn lookup(&self, name: &str) -> Option<Node> {
        self.names.get(name).copied()
    }

    pub fn layer_index(&self, name: &str) -> Result<usize> {
        match self.lookup(name) {
            Some(Node::Layer(i)) => Ok(i),
            _ => Err(NetError::UnknownLayer(name.to_string()).into()),
        }
    }

    pub fn blob_index(&self, name: &str) -> Result<usize> {
        match self.lookup(name) {
            Some(Node::Blob(i)) => Ok(i),
            _ => Err(NetError::UnknownBlob(name.to_string()).into()),
        }
    }

    pub fn node_name(&self, node: Node) -> &str {
        match node {
            Node::Layer(i) => self.layers[i].node.name(),
            Node::Blob(i) => self.blobs[i].blob.name(),
        }
    }

    fn seq(&self, node: Node) -> usize {
        match node {
            Node::Layer(i) => self.layers[i].seq,
            Node::Blob(i) => self.blobs[i].seq,
        }
    }

    // ******************************** Registration ******************************** //

    /// Checks a registration without touching the tables.
    pub fn check_layer(&self, node: &LayerNode, needs: &[&str], provides: &[&str]) -> Result<()> {
        let name = node.name();

        if self.names.contains_key(name) || needs.contains(&name) || provides.contains(&name) {
            return Err(NetError::DuplicateName(name.to_string()).into());
        }

        for blob in needs.iter().chain(provides.iter()) {
            if let Some(Node::Layer(_)) = self.lookup(blob) {
                return Err(NetError::DuplicateName(blob.to_string()).into());
            }
        }

        for (role, list) in [("needs", needs), ("provides", provides)] {
            if let Some(dup) = list.iter().duplicates().next() {
                return Err(NetError::InvalidOperation(format!(
                    "layer '{}' {} blob '{}' more than once",
                    name, role, dup
                ))
                .into());
            }
        }

        node.check_arity(needs.len(), provides.len())
    }

    /// Registers a layer that already passed [`Graph::check_layer`].
    pub fn insert_layer(&mut self, node: LayerNode, needs: &[&str], provides: &[&str]) -> usize {
        let idx = self.layers.len();

        let needs = needs.iter().map(|n| self.get_or_create_blob(n)).collect_vec();
        let seq = self.next_seq();
        let provides = provides.iter().map(|n| self.get_or_create_blob(n)).collect_vec();

        for &b in &needs {
            self.blobs[b].consumers.push(idx);
        }
        for &b in &provides {
            self.blobs[b].producers.push(idx);
        }

        self.names.insert(node.name().to_string(), Node::Layer(idx));
        self.layers.push(LayerEntry {
            node,
            needs,
            provides,
            seq,
        });
        idx
    }

    fn get_or_create_blob(&mut self, name: &str) -> usize {
        if let Some(Node::Blob(i)) = self.lookup(name) {
            return i;
        }

        let idx = self.blobs.len();
        let seq = self.next_seq();
        self.names.insert(name.to_string(), Node::Blob(idx));
        self.blobs.push(BlobEntry {
            blob: Blob::new(name),
            producers: Vec::new(),
            consumers: Vec::new(),
            seq,
        });
        idx
    }

    fn next_seq(&mut self) -> usize {
        self.seq += 1;
        self.seq
    }

    // ******************************** Validation ******************************** //

    /// Kahn's algorithm over both tables. Among ready nodes the earliest
    /// registered goes first, so the order is fully deterministic.
    pub fn topo_order(&self) -> Result<Vec<Node>> {
        let mut indegree = HashMap::<Node, usize>::new();
        let mut queue = BinaryHeap::<Reverse<Ranked<Node>>>::new();

        let nodes = (0..self.layers.len())
            .map(Node::Layer)
            .chain((0..self.blobs.len()).map(Node::Blob));

        for node in nodes {
            let degree = match node {
                Node::Layer(i) => self.layers[i].needs.len(),
                Node::Blob(i) => self.blobs[i].producers.len(),
            };
            if degree == 0 {
                queue.push(Reverse(Ranked::new(node, self.seq(node))));
            } else {
                indegree.insert(node, degree);
            }
        }

        let mut order = Vec::with_capacity(self.layers.len() + self.blobs.len());

        while let Some(Reverse(ranked)) = queue.pop() {
            let node = ranked.into_inner();
            order.push(node);

            let succ = match node {
                Node::Layer(i) => self.layers[i].provides.iter().map(|&b| Node::Blob(b)).collect_vec(),
                Node::Blob(i) => self.blobs[i].consumers.iter().map(|&l| Node::Layer(l)).collect_vec(),
            };

            for s in succ {
                if let Some(d) = indegree.get_mut(&s) {
                    *d -= 1;
                    if *d == 0 {
                        indegree.remove(&s);
                        queue.push(Reverse(Ranked::new(s, self.seq(s))));
                    }
                }
            }
        }

        if !indegree.is_empty() {
            // every node left over sits on or behind a cycle
            let stuck = indegree
                .keys()
                .sorted_by_key(|n| self.seq(**n))
                .map(|n| self.node_name(*n).to_string())
                .collect_vec();
            return Err(NetError::CyclicGraph(stuck).into());
        }
        Ok(order)
    }

    pub fn check_producers(&self) -> Result<()> {
        if let Some(entry) = self.blobs.iter().find(|b| b.producers.len() > 1) {
            return Err(NetError::MultiProducer {
                blob: entry.blob.name().to_string(),
                producers: self.layer_names(&entry.producers),
            }
            .into());
        }
        Ok(())
    }

    /// Blobs with more than one consumer, in registration order.
    pub fn fanned_out(&self) -> Vec<usize> {
        (0..self.blobs.len())
            .filter(|&b| self.blobs[b].consumers.len() > 1)
            .collect()
    }

    pub fn fanout_error(&self, blob: usize) -> NetError {
        let entry = &self.blobs[blob];
        NetError::Fanout {
            blob: entry.blob.name().to_string(),
            consumers: self.layer_names(&entry.consumers),
        }
    }

    fn layer_names(&self, layers: &[usize]) -> Vec<String> {
        layers
            .iter()
            .map(|&l| self.layers[l].node.name().to_string())
            .collect()
    }

    // ******************************** Splits ******************************** //

    pub fn split_names(&self, blob: usize) -> (String, Vec<String>) {
        let entry = &self.blobs[blob];
        let layer = format!("{}_split", entry.blob.name());
        let outputs = (0..entry.consumers.len())
            .map(|i| format!("{}_{}", layer, i))
            .collect();
        (layer, outputs)
    }

    /// Fails when a split layer or one of its outputs would collide with an
    /// existing name or with another planned split.
    pub fn check_splits(&self, blobs: &[usize]) -> Result<()> {
        let mut planned = HashSet::new();

        for &b in blobs {
            let (layer, outputs) = self.split_names(b);
            for name in std::iter::once(layer).chain(outputs) {
                if self.names.contains_key(&name) || !planned.insert(name.clone()) {
                    return Err(NetError::DuplicateName(name).into());
                }
            }
        }
        Ok(())
    }

    /// Routes every consumer of `blob` through its own output of a new
    /// [`Split`] layer.
    pub fn insert_split(&mut self, blob: usize) -> usize {
        let (layer, outputs) = self.split_names(blob);
        let consumers = std::mem::take(&mut self.blobs[blob].consumers);

        let provides = outputs.iter().map(String::as_str).collect_vec();
        let source = self.blobs[blob].blob.name().to_string();
        let split = self.insert_layer(LayerNode::generic(Split::new(&layer)), &[source.as_str()], &provides);
        let outs = self.layers[split].provides.clone();

        for (&consumer, &out) in consumers.iter().zip(outs.iter()) {
            for need in self.layers[consumer].needs.iter_mut().filter(|n| **n == blob) {
                *need = out;
            }
            self.blobs[out].consumers.push(consumer);
        }

        tracing::info!(blob = %source, split = %layer, consumers = consumers.len(), "inserted split layer");
        split
    }

    // ******************************** Execution ******************************** //

    /// Runs `f` on one layer with its resolved input and output blobs.
    pub fn run<F, R>(&mut self, layer: usize, pass: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut LayerNode, &[&Blob], &[&Blob]) -> Result<R>,
    {
        let entry = &mut self.layers[layer];
        let inputs = entry.needs.iter().map(|&b| &self.blobs[b].blob).collect_vec();
        let outputs = entry.provides.iter().map(|&b| &self.blobs[b].blob).collect_vec();

        let start = Instant::now();
        let res = f(&mut entry.node, &inputs, &outputs);

        tracing::trace!(layer = %entry.node.name(), pass, elapsed = ?start.elapsed(), "layer executed");
        res
    }
}

pub(crate) struct Ranked<T> {
    inner: T,
    rank: usize,
}

impl<T> Ranked<T> {
    pub fn new(inner: T, rank: usize) -> Self {
        Ranked { inner, rank }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
