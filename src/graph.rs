use std::collections::{ HashMap, HashSet };

use serde::{ Serialize, Deserialize };

pub(crate) mod ops;
mod build;
mod checkpoint;

pub use ops::Op;

use crate::{
  shape::Shape,
  tensor::Tensor,
};


/// Index of a node in its [Graph].

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
  pub fn index(self) -> usize {
    self.0
  }
}


#[derive(Debug)]
pub enum NodeKind {
  /// Leaf whose value gets fed on every run.
  Placeholder,
  /// Leaf owning a persistent value.
  Variable { trainable: bool },
  Operation(Op),
}


/// How often a node has been visited by forward and backward passes.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
  pub computed: usize,
  pub differentiated: usize,
}


#[derive(Debug)]
pub struct Node {
  pub(crate) name: String,
  pub(crate) kind: NodeKind,
  pub(crate) inputs: Vec<NodeId>,
  pub(crate) consumers: Vec<NodeId>,
  pub(crate) shape: Shape,
  pub(crate) output: Tensor,
  pub(crate) gradient: Option<Tensor>,
  pub(crate) input_gradients: Vec<Tensor>,
  pub(crate) care_about_gradient: bool,
  pub(crate) stats: NodeStats,
}

impl Node {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> &NodeKind {
    &self.kind
  }

  /// Shape fixed at construction. The batch length of
  /// [values](Graph::value) may differ from run to run.

  pub fn shape(&self) -> Shape {
    self.shape
  }

  pub fn inputs(&self) -> &[NodeId] {
    &self.inputs
  }

  pub fn consumers(&self) -> &[NodeId] {
    &self.consumers
  }

  pub fn is_variable(&self) -> bool {
    matches!(self.kind, NodeKind::Variable { .. })
  }

  pub fn is_trainable(&self) -> bool {
    matches!(self.kind, NodeKind::Variable { trainable: true })
  }

  /// Whether the last gradient pass found a trainable variable upstream.

  pub fn cares_about_gradient(&self) -> bool {
    self.care_about_gradient
  }
}


/// Arena of computation nodes forming a directed acyclic graph.
///
/// Nodes reference their inputs and consumers by [NodeId]. Inputs are
/// always created before the nodes consuming them, so every input has
/// a lower index than its consumers. Nodes live until [reset](Graph::reset).

#[derive(Debug, Default)]
pub struct Graph {
  pub(crate) nodes: Vec<Node>,
  names: HashMap<String, NodeId>,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Drop all nodes at once.

  pub fn reset(&mut self) {
    self.nodes.clear();
    self.names.clear();
  }

  pub fn node(&self, id: NodeId) -> &Node {
    self.nodes.get(id.0)
      .unwrap_or_else(|| panic!("Node {:?} is not part of this graph", id) )
  }

  fn node_mut(&mut self, id: NodeId) -> &mut Node {
    self.nodes.get_mut(id.0)
      .unwrap_or_else(|| panic!("Node {:?} is not part of this graph", id) )
  }

  pub fn ids(&self) -> impl Iterator<Item=NodeId> {
    (0..self.nodes.len()).map(NodeId)
  }

  pub fn find(&self, name: &str) -> Option<NodeId> {
    self.names.get(name).copied()
  }

  /// All variables, trainable or not.

  pub fn variables(&self) -> Vec<NodeId> {
    self.ids().filter(|&id| self.node(id).is_variable() ).collect()
  }

  pub(crate) fn insert(&mut self, base_name: &str, kind: NodeKind, inputs: Vec<NodeId>, shape: Shape, mut output: Tensor) -> NodeId {
    let id = NodeId(self.nodes.len());
    let name = self.unique_name(base_name);
    output.set_name(&name);
    for input in &inputs {
      self.node_mut(*input).consumers.push(id);
    }
    let input_gradients = inputs.iter()
      .map(|input| Tensor::named(self.node(*input).shape, &format!("{}_grad_{}", name, input.0)) )
      .collect();
    self.names.insert(name.clone(), id);
    self.nodes.push(Node {
      name,
      kind,
      inputs,
      consumers: vec![],
      shape,
      output,
      gradient: None,
      input_gradients,
      care_about_gradient: false,
      stats: NodeStats::default(),
    });
    id
  }

  fn unique_name(&self, base: &str) -> String {
    if !self.names.contains_key(base) { return base.to_string() }
    (1..)
      .map(|i| format!("{base}_{i}") )
      .find(|name| !self.names.contains_key(name) )
      .unwrap_or_default()
  }

  /// Give a node an explicit name. Names must be unique within the graph.

  pub fn with_name(&mut self, id: NodeId, name: &str) -> NodeId {
    if self.node(id).name == name { return id }
    assert!(!self.names.contains_key(name), "Node name '{}' is already taken", name);
    let node = self.node_mut(id);
    let old = std::mem::replace(&mut node.name, name.to_string());
    node.output.set_name(name);
    self.names.remove(&old);
    self.names.insert(name.to_string(), id);
    id
  }

  pub fn value(&self, id: NodeId) -> &Tensor {
    &self.node(id).output
  }

  /// Gradient accumulated for a node by the last gradient pass.

  pub fn gradient(&self, id: NodeId) -> &Tensor {
    let node = self.node(id);
    node.gradient.as_ref()
      .unwrap_or_else(|| panic!("Node '{}' never accumulated a gradient", node.name) )
  }

  pub fn try_gradient(&self, id: NodeId) -> Option<&Tensor> {
    self.node(id).gradient.as_ref()
  }

  /// Value and gradient of a variable, for optimizers to update in place.

  pub fn parameter_mut(&mut self, id: NodeId) -> (&mut Tensor, &Tensor) {
    let node = self.node_mut(id);
    assert!(node.is_variable(), "Node '{}' is not a variable", node.name);
    let name = &node.name;
    let gradient = node.gradient.as_ref()
      .unwrap_or_else(|| panic!("Variable '{}' never accumulated a gradient", name) );
    (&mut node.output, gradient)
  }

  /// Overwrite a variable's value.

  pub fn assign(&mut self, id: NodeId, value: &Tensor) {
    let node = self.node_mut(id);
    assert!(node.is_variable(), "Cannot assign to '{}', which is not a variable", node.name);
    assert!(node.shape == value.shape(),
      "Cannot assign {} to variable '{}' of {}", value.shape(), node.name, node.shape);
    value.copy_to(&mut node.output);
  }

  pub fn freeze(&mut self, id: NodeId) {
    self.set_trainable(id, false);
  }

  pub fn unfreeze(&mut self, id: NodeId) {
    self.set_trainable(id, true);
  }

  fn set_trainable(&mut self, id: NodeId, value: bool) {
    let node = self.node_mut(id);
    match &mut node.kind {
      NodeKind::Variable { trainable } => *trainable = value,
      _ => panic!("Only variables can be frozen, '{}' is not one", node.name),
    }
  }

  pub fn visits(&self, id: NodeId) -> NodeStats {
    self.node(id).stats
  }

  /// Every node the `outputs` transitively depend on, each placed
  /// after all of its inputs.

  pub fn forward_order(&self, outputs: &[NodeId]) -> Vec<NodeId> {
    let mut order = vec![];
    let mut visited = HashSet::new();
    for &output in outputs {
      self.order_recurse(output, &mut order, &mut visited);
    }
    order
  }

  fn order_recurse(&self, id: NodeId, order: &mut Vec<NodeId>, visited: &mut HashSet<NodeId>) {
    if visited.contains(&id) { return }
    visited.insert(id);
    for &input in &self.node(id).inputs {
      self.order_recurse(input, order, visited);
    }
    order.push(id);
  }
}


/// Mutable access to one node along with its inputs and consumers.
///
/// Returns the nodes before and after `id` as separate slices.

pub(crate) fn split(nodes: &mut [Node], id: NodeId) -> (&mut [Node], &mut Node, &mut [Node]) {
  let (before, rest) = nodes.split_at_mut(id.0);
  let (node, after) = rest.split_at_mut(1);
  (before, &mut node[0], after)
}
