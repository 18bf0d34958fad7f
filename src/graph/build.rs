use crate::{
  shape::{ Axis, Shape },
  tensor::Tensor,
  backend::{ Activation, Conv2dParams, Pool2dParams, NormParams, NormStats, group_shape },
};

use super::{ Graph, NodeId, NodeKind, ops::{ self, Op } };


/// Node constructors.
///
/// Every operation computes its output shape right away and panics,
/// naming the operation, if its inputs don't fit together.

impl Graph {
  /// Input fed anew on every [run](crate::Session::run). Only the batch
  /// length of fed tensors may differ from `shape`.

  pub fn placeholder(&mut self, shape: Shape) -> NodeId {
    self.insert("placeholder", NodeKind::Placeholder, vec![], shape, Tensor::new(shape))
  }

  /// Trainable parameter initialized to `value`.

  pub fn variable(&mut self, value: Tensor) -> NodeId {
    let shape = value.shape();
    self.insert("variable", NodeKind::Variable { trainable: true }, vec![], shape, value)
  }

  /// Variable that never receives gradients unless [unfrozen](Graph::unfreeze).

  pub fn constant(&mut self, value: Tensor) -> NodeId {
    let shape = value.shape();
    self.insert("constant", NodeKind::Variable { trainable: false }, vec![], shape, value)
  }

  pub fn operation(&mut self, op: Op, inputs: &[NodeId]) -> NodeId {
    let shapes: Vec<Shape> = inputs.iter().map(|&id| self.node(id).shape ).collect();
    let shape = op.output_shape(&shapes);
    self.insert(op.name(), NodeKind::Operation(op), inputs.to_vec(), shape, Tensor::new(shape))
  }

  pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
    self.operation(Op::Add, &[a, b])
  }

  pub fn add_scalar(&mut self, a: NodeId, value: f32) -> NodeId {
    self.operation(Op::AddScalar(value), &[a])
  }

  pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
    self.operation(Op::Sub, &[a, b])
  }

  /// Elementwise product with broadcasting.

  pub fn multiply(&mut self, a: NodeId, b: NodeId) -> NodeId {
    self.operation(Op::Multiply, &[a, b])
  }

  pub fn scale(&mut self, a: NodeId, factor: f32) -> NodeId {
    self.operation(Op::Scale(factor), &[a])
  }

  pub fn divide(&mut self, a: NodeId, b: NodeId) -> NodeId {
    let shape = self.node(a).shape.broadcast(&self.node(b).shape);
    self.operation(Op::Divide { quotient: Tensor::new(shape) }, &[a, b])
  }

  /// Matrix product of `a` with `b`, broadcasting depth and batch.

  pub fn matmul(&mut self, a: NodeId, b: NodeId) -> NodeId {
    self.operation(Op::MatMul, &[a, b])
  }

  pub fn transpose(&mut self, a: NodeId) -> NodeId {
    self.operation(Op::Transpose, &[a])
  }

  pub fn negative(&mut self, a: NodeId) -> NodeId {
    self.operation(Op::Negative, &[a])
  }

  pub fn log(&mut self, a: NodeId) -> NodeId {
    self.operation(Op::Log, &[a])
  }

  pub fn pow(&mut self, a: NodeId, power: f32) -> NodeId {
    self.operation(Op::Pow(power), &[a])
  }

  pub fn sum(&mut self, a: NodeId, axes: &[Axis]) -> NodeId {
    self.operation(Op::Sum(axes.to_vec()), &[a])
  }

  pub fn mean(&mut self, a: NodeId, axes: &[Axis]) -> NodeId {
    let shape = self.node(a).shape;
    self.operation(Op::Mean { axes: axes.to_vec(), sum: Tensor::new(shape) }, &[a])
  }

  pub fn activation(&mut self, a: NodeId, kind: Activation) -> NodeId {
    self.operation(Op::Activation(kind), &[a])
  }

  pub fn sigmoid(&mut self, a: NodeId) -> NodeId {
    self.activation(a, Activation::Sigmoid)
  }

  pub fn tanh(&mut self, a: NodeId) -> NodeId {
    self.activation(a, Activation::Tanh)
  }

  pub fn relu(&mut self, a: NodeId) -> NodeId {
    self.activation(a, Activation::ReLU)
  }

  pub fn leaky_relu(&mut self, a: NodeId, slope: f32) -> NodeId {
    self.activation(a, Activation::LeakyReLU(slope))
  }

  pub fn elu(&mut self, a: NodeId, alpha: f32) -> NodeId {
    self.activation(a, Activation::Elu(alpha))
  }

  pub fn softmax(&mut self, a: NodeId) -> NodeId {
    self.activation(a, Activation::Softmax)
  }

  pub fn conv2d(&mut self, input: NodeId, kernels: NodeId, params: Conv2dParams) -> NodeId {
    self.operation(Op::Conv2d(params), &[input, kernels])
  }

  /// Fused convolution, per-channel `bias` of shape (1, 1, channels, 1)
  /// and activation.

  pub fn conv2d_bias_activation(&mut self, input: NodeId, kernels: NodeId, bias: NodeId, params: Conv2dParams, activation: Activation) -> NodeId {
    let op = Op::Conv2dBiasActivation { params, activation, workspace: ops::workspace(Shape::vector(1)) };
    self.operation(op, &[input, kernels, bias])
  }

  pub fn pool2d(&mut self, input: NodeId, params: Pool2dParams) -> NodeId {
    self.operation(Op::Pool2d(params), &[input])
  }

  /// Nearest neighbour upsampling of width and height by `scale`.

  pub fn upsample2d(&mut self, input: NodeId, scale: usize) -> NodeId {
    self.operation(Op::UpSample2d(scale), &[input])
  }

  /// Batch normalization with learned `gamma` and `beta` of the
  /// [group shape](crate::backend::group_shape) of `input`.

  pub fn batch_norm(&mut self, input: NodeId, gamma: NodeId, beta: NodeId, params: NormParams) -> NodeId {
    let groups = group_shape(self.node(input).shape, params.mode);
    self.operation(Op::BatchNorm { params, stats: NormStats::new(groups) }, &[input, gamma, beta])
  }

  pub fn dropout(&mut self, input: NodeId, prob: f32) -> NodeId {
    let shape = self.node(input).shape;
    self.operation(Op::Dropout { prob, mask: Tensor::new(shape) }, &[input])
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::{ DataFormat, NormMode };

  #[test]
  fn inference() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(5, 1, 1, 1));
    let w = graph.variable(Tensor::ones(Shape::matrix(2, 5)));
    let b = graph.variable(Tensor::ones(Shape::matrix(2, 1)));
    let mm = graph.matmul(x, w);
    let y = graph.add(mm, b);
    let y = graph.sigmoid(y);
    assert_eq!(graph.node(y).shape(), Shape::matrix(2, 1));
    assert_eq!(graph.node(y).name(), "sigmoid");
    assert_eq!(graph.node(w).consumers(), &[mm]);
    assert!(graph.node(b).is_trainable());
  }

  #[test]
  fn constants_are_frozen() {
    let mut graph = Graph::new();
    let c = graph.constant(Tensor::ones(Shape::vector(2)));
    assert!(graph.node(c).is_variable());
    assert!(!graph.node(c).is_trainable());
  }

  #[test]
  fn image_shapes() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(8, 8, 3, 1));
    let k = graph.variable(Tensor::ones(Shape::new(3, 3, 3, 4)));
    let bias = graph.variable(Tensor::zeros(Shape::new(1, 1, 4, 1)));
    let params = Conv2dParams { stride: 1, padding: 1, format: DataFormat::Nchw };
    let conv = graph.conv2d_bias_activation(x, k, bias, params, Activation::ReLU);
    assert_eq!(graph.node(conv).shape(), Shape::new(8, 8, 4, 1));
    let gamma = graph.variable(Tensor::ones(Shape::new(1, 1, 4, 1)));
    let beta = graph.variable(Tensor::zeros(Shape::new(1, 1, 4, 1)));
    let norm = graph.batch_norm(conv, gamma, beta, NormParams { mode: NormMode::Spatial, epsilon: 1e-5, momentum: 0.9 });
    let up = graph.upsample2d(norm, 2);
    assert_eq!(graph.node(up).shape(), Shape::new(16, 16, 4, 1));
  }

  #[test]
  #[should_panic(expected = "Operation batch_norm")]
  fn batch_norm_parameter_shapes() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(4, 1, 1, 1));
    let gamma = graph.variable(Tensor::ones(Shape::vector(3)));
    let params = NormParams { mode: NormMode::PerActivation, epsilon: 1e-5, momentum: 0.9 };
    graph.batch_norm(x, gamma, gamma, params);
  }
}
