use std::collections::HashSet;

use itertools::Itertools;
use log::debug;
use rand::{ SeedableRng, rngs::StdRng };

use crate::{
  tensor::Tensor,
  shape::Shape,
  backend::{ Backend, Cpu },
  graph::{ Graph, NodeId, NodeKind, split, ops::Context },
};


/// Executes [Graph]s on a compute [Backend].
///
/// A session schedules the nodes a set of fetches depends on, runs
/// them in dependency order and differentiates a loss in reverse. It
/// owns the random state used by dropout and whether the graph runs in
/// training or in inference mode.

#[derive(Debug)]
pub struct Session {
  backend: Box<dyn Backend>,
  training: bool,
  rng: StdRng,
  scratch: Tensor,
}

impl Default for Session {
  fn default() -> Self {
    Self::new(Box::new(Cpu))
  }
}

impl Session {
  pub fn new(backend: Box<dyn Backend>) -> Self {
    Self {
      backend,
      training: false,
      rng: StdRng::seed_from_u64(0),
      scratch: Tensor::named(Shape::vector(1), "session_scratch"),
    }
  }

  pub fn training(mut self, training: bool) -> Self {
    self.training = training;
    self
  }

  /// Seed the random state used by dropout.

  pub fn seed(mut self, seed: u64) -> Self {
    self.rng = StdRng::seed_from_u64(seed);
    self
  }

  pub fn set_training(&mut self, training: bool) {
    self.training = training;
  }

  pub fn is_training(&self) -> bool {
    self.training
  }

  pub fn backend(&self) -> &dyn Backend {
    &*self.backend
  }

  /// Compute `fetches` and return their values in the requested order.
  ///
  /// Every placeholder the fetches depend on needs an entry in `feeds`
  /// whose shape matches in all but the batch axis.

  pub fn run<'g>(&mut self, graph: &'g mut Graph, fetches: &[NodeId], feeds: &[(NodeId, &Tensor)]) -> Vec<&'g Tensor> {
    let order = graph.forward_order(fetches);
    debug!("Running {} nodes for {} fetches on {}", order.len(), fetches.len(), self.backend.name());
    let mut ctx = Context {
      backend: &*self.backend,
      training: self.training,
      rng: &mut self.rng,
      scratch: &mut self.scratch,
    };
    for &id in &order {
      let (before, node, _) = split(&mut graph.nodes, id);
      match &mut node.kind {
        NodeKind::Placeholder => {
          let (_, value) = feeds.iter()
            .find(|(target, _)| *target == id )
            .unwrap_or_else(|| panic!("Placeholder '{}' has not been fed", node.name) );
          assert!(value.shape().same_item(&node.shape),
            "Placeholder '{}' of {} cannot be fed a tensor of {}", node.name, node.shape, value.shape());
          value.copy_to(&mut node.output);
        },
        NodeKind::Variable { .. } => {},
        NodeKind::Operation(op) => {
          let inputs: Vec<&Tensor> = node.inputs.iter().map(|input| &before[input.0].output ).collect();
          op.compute(&mut ctx, &inputs, &mut node.output);
        },
      }
      node.stats.computed += 1;
    }
    let graph: &'g Graph = graph;
    fetches.iter().map(|&id| graph.value(id) ).collect()
  }

  /// Differentiate `loss` with respect to every trainable variable it
  /// depends on, using the values of the last [run](Self::run).
  ///
  /// Only nodes lying on a path from a trainable variable to the loss
  /// get visited. Returns the variables that received a gradient.

  pub fn compute_gradients(&mut self, graph: &mut Graph, loss: NodeId) -> Vec<NodeId> {
    let order = graph.forward_order(&[loss]);
    let members: HashSet<NodeId> = order.iter().copied().collect();

    // Mark nodes depending on trainable variables
    for &id in &order {
      let node = graph.node(id);
      let cares = match &node.kind {
        NodeKind::Placeholder => false,
        NodeKind::Variable { trainable } => *trainable,
        NodeKind::Operation(_) => node.inputs.iter().any(|input| graph.node(*input).care_about_gradient ),
      };
      graph.nodes[id.0].care_about_gradient = cares;
    }

    let backward: Vec<NodeId> = order.iter().rev()
      .copied()
      .filter(|&id| graph.node(id).care_about_gradient )
      .collect();
    debug!("Differentiating {} of {} nodes", backward.len(), order.len());

    for &id in &backward {
      let (before, node, after) = split(&mut graph.nodes, id);

      // Sum contributions of all consumers
      let mut gradient = node.gradient.take()
        .unwrap_or_else(|| Tensor::named(node.shape, &format!("{}_grad", node.name)) );
      if id == loss {
        gradient.resize(node.output.shape());
        self.backend.fill(&mut gradient, 1.0);
      } else {
        let mut first = true;
        for consumer in node.consumers.iter().unique() {
          if !members.contains(consumer) { continue }
          let consumer = &after[consumer.0 - id.0 - 1];
          for (slot, _) in consumer.inputs.iter().enumerate().filter(|(_, input)| **input == id ) {
            let contribution = &consumer.input_gradients[slot];
            if first {
              self.backend.copy(contribution, &mut gradient);
              first = false;
            } else {
              self.backend.add(1.0, &gradient, 1.0, contribution, &mut self.scratch);
              gradient.swap_contents(&mut self.scratch);
            }
          }
        }
      }

      if let NodeKind::Operation(op) = &mut node.kind {
        let inputs: Vec<&Tensor> = node.inputs.iter().map(|input| &before[input.0].output ).collect();
        let cares: Vec<bool> = node.inputs.iter().map(|input| before[input.0].care_about_gradient ).collect();
        let mut ctx = Context {
          backend: &*self.backend,
          training: self.training,
          rng: &mut self.rng,
          scratch: &mut self.scratch,
        };
        op.gradient(&mut ctx, &inputs, &node.output, &gradient, &cares, &mut node.input_gradients);
      }
      node.gradient = Some(gradient);
      node.stats.differentiated += 1;
    }

    backward.into_iter()
      .rev()
      .filter(|&id| graph.node(id).is_trainable() )
      .collect()
  }

  /// Compare the gradients of all trainable variables `loss` depends
  /// on with central finite differences of width `2 * epsilon`.
  ///
  /// Returns the largest error found, relative to the larger of both
  /// gradients or 1, whichever is bigger.

  pub fn check_gradients(&mut self, graph: &mut Graph, loss: NodeId, feeds: &[(NodeId, &Tensor)], epsilon: f32) -> f32 {
    self.run(graph, &[loss], feeds);
    let variables = self.compute_gradients(graph, loss);
    let mut max_error = 0.0f32;
    for id in variables {
      let analytic = graph.gradient(id).to_vec();
      for (i, &expected) in analytic.iter().enumerate() {
        let original = graph.value(id).values()[i];
        let (up, down) = (original + epsilon, original - epsilon);
        graph.value(id).values_mut()[i] = up;
        let next = self.total(graph, loss, feeds);
        graph.value(id).values_mut()[i] = down;
        let prev = self.total(graph, loss, feeds);
        graph.value(id).values_mut()[i] = original;
        // Divide by the step actually taken after rounding
        let numeric = ((next - prev) / (up as f64 - down as f64)) as f32;
        let error = (numeric - expected).abs() / numeric.abs().max(expected.abs()).max(1.0);
        if error > max_error {
          debug!("Gradient of '{}' at {}: analytic {} numeric {}", graph.node(id).name(), i, expected, numeric);
          max_error = error;
        }
      }
    }
    max_error
  }

  fn total(&mut self, graph: &mut Graph, loss: NodeId, feeds: &[(NodeId, &Tensor)]) -> f64 {
    self.run(graph, &[loss], feeds)[0].values().iter().map(|&v| v as f64 ).sum()
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use rand::{ Rng, seq::SliceRandom };
  use crate::{
    shape::Axis,
    backend::{ Accelerator, Activation, Conv2dParams, DataFormat, NormMode, NormParams, Pool2dParams, PoolMode },
  };

  fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
  }

  fn random(shape: Shape, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::random_uniform(shape, -1.0, 1.0, &mut rng)
  }

  fn positive(shape: Shape, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::random_uniform(shape, 0.5, 2.0, &mut rng)
  }

  // Values at least 0.1 away from zero
  fn away_from_zero(shape: Shape, seed: u64) -> Tensor {
    let tensor = random(shape, seed);
    for v in tensor.values_mut().iter_mut() {
      *v = v.signum() * (0.1 + v.abs());
    }
    tensor
  }

  // Shuffled values with a spacing of 0.05 so that windows have no near ties
  fn distinct(shape: Shape, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values: Vec<f32> = (0..shape.size()).map(|i| i as f32 * 0.05 - 1.0 ).collect();
    values.shuffle(&mut rng);
    Tensor::from_vec(shape, values)
  }

  // Largest relative error accepted from finite differences of width 2e-2
  const TOLERANCE: f32 = 1e-3;

  /// Reduce a node to a scalar loss through a fixed random weighting,
  /// so that every output value influences the loss differently.

  fn weighted_loss(graph: &mut Graph, node: NodeId, seed: u64) -> NodeId {
    let weights = graph.constant(random(graph.node(node).shape(), seed));
    let product = graph.multiply(node, weights);
    graph.sum(product, &Axis::ALL)
  }

  fn check(graph: &mut Graph, output: NodeId, feeds: &[(NodeId, &Tensor)]) -> f32 {
    init_logger();
    let loss = weighted_loss(graph, output, 99);
    let mut session = Session::default().training(true);
    session.check_gradients(graph, loss, feeds, 1e-2)
  }

  #[test]
  fn scenario_dense_sigmoid() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::matrix(5, 1));
    let w = graph.variable(random(Shape::matrix(2, 5), 1));
    let b = graph.variable(random(Shape::matrix(2, 1), 2));
    let mm = graph.matmul(x, w);
    let sum = graph.add(mm, b);
    let y = graph.sigmoid(sum);

    let input = Tensor::from_vec(Shape::matrix(5, 1), vec![0.1, -0.2, 0.3, 0.4, -0.5]);
    let expected = input.matmul(graph.value(w)).add(graph.value(b));
    let mut session = Session::default();
    let output = session.run(&mut graph, &[y], &[(x, &input)])[0];
    assert_eq!(output.shape(), Shape::matrix(2, 1));
    for (value, linear) in output.to_vec().into_iter().zip(expected.to_vec()) {
      assert!(value > 0.0 && value < 1.0);
      assert!((value - 1.0 / (1.0 + (-linear).exp())).abs() < 1e-6);
    }
  }

  #[test]
  fn scenario_bias_over_batch() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(3, 1, 1, 1));
    let b = graph.variable(random(Shape::new(3, 1, 1, 1), 3));
    let y = graph.add(x, b);
    let input = random(Shape::new(3, 1, 1, 32), 4);
    let mut session = Session::default();
    assert_eq!(session.run(&mut graph, &[y], &[(x, &input)])[0].shape(), Shape::new(3, 1, 1, 32));
    assert_eq!(session.compute_gradients(&mut graph, y), vec![b]);
    let gradient = graph.gradient(b);
    assert_eq!(gradient.shape(), Shape::new(3, 1, 1, 1));
    assert_eq!(gradient.to_vec(), vec![32.0; 3]);
  }

  #[test]
  fn scenario_matmul_gradients() {
    let mut graph = Graph::new();
    let a = graph.variable(random(Shape::matrix(5, 2), 5));
    let b = graph.variable(random(Shape::matrix(2, 5), 6));
    let y = graph.matmul(a, b);
    let loss = weighted_loss(&mut graph, y, 7);
    let mut session = Session::default();
    session.run(&mut graph, &[loss], &[]);
    session.compute_gradients(&mut graph, loss);

    let grad_output = graph.gradient(y).clone();
    assert_eq!(grad_output.shape(), Shape::matrix(2, 2));
    let expected_a = grad_output.matmul(&graph.value(b).transposed());
    let expected_b = graph.value(a).transposed().matmul(&grad_output);
    assert!(graph.gradient(a).approx_eq(&expected_a, 1e-6));
    assert!(graph.gradient(b).approx_eq(&expected_b, 1e-6));
    assert!(session.check_gradients(&mut graph, loss, &[], 1e-2) < TOLERANCE);
  }

  #[test]
  fn elementwise_gradients() {
    let mut graph = Graph::new();
    let a = graph.variable(positive(Shape::new(3, 2, 1, 2), 10));
    let b = graph.variable(positive(Shape::new(3, 2, 1, 2), 11));
    let c = graph.variable(positive(Shape::new(3, 1, 1, 1), 12));
    let sum = graph.add(a, b);
    let diff = graph.sub(sum, c);
    let product = graph.multiply(diff, b);
    let quotient = graph.divide(product, c);
    let scaled = graph.scale(quotient, 0.5);
    let shifted = graph.add_scalar(scaled, 5.0);
    let logs = graph.log(shifted);
    let powers = graph.pow(logs, 1.5);
    let negative = graph.negative(powers);
    assert!(check(&mut graph, negative, &[]) < TOLERANCE);
  }

  #[test]
  fn reduction_gradients() {
    let mut graph = Graph::new();
    let a = graph.variable(random(Shape::new(4, 3, 2, 2), 13));
    let sum = graph.sum(a, &[Axis::Width, Axis::Depth]);
    let mean = graph.mean(a, &[Axis::Height, Axis::Batch]);
    let t = graph.transpose(sum);
    let tm = graph.transpose(mean);
    let l1 = weighted_loss(&mut graph, t, 14);
    let l2 = weighted_loss(&mut graph, tm, 15);
    let total = graph.add(l1, l2);
    let mut session = Session::default();
    assert!(session.check_gradients(&mut graph, total, &[], 1e-2) < TOLERANCE);
  }

  #[test]
  fn activation_gradients() {
    for (seed, kind) in [
      Activation::Sigmoid,
      Activation::Tanh,
      Activation::ReLU,
      Activation::LeakyReLU(0.1),
      Activation::Elu(1.0),
      Activation::Softmax,
    ].into_iter().enumerate() {
      let mut graph = Graph::new();
      let a = graph.variable(away_from_zero(Shape::new(5, 2, 1, 3), seed as u64));
      let y = graph.activation(a, kind);
      assert!(check(&mut graph, y, &[]) < TOLERANCE, "{:?}", kind);
    }
  }

  #[test]
  fn bias_over_channel_and_batch() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(4, 4, 3, 1));
    let bias = graph.variable(random(Shape::new(1, 1, 3, 1), 20));
    let y = graph.add(x, bias);
    let input = random(Shape::new(4, 4, 3, 5), 21);
    let loss = weighted_loss(&mut graph, y, 22);
    let mut session = Session::default();
    session.run(&mut graph, &[loss], &[(x, &input)]);
    session.compute_gradients(&mut graph, loss);
    let mut generic = Tensor::new(Shape::vector(1));
    session.backend().sum(graph.gradient(y), &[Axis::Width, Axis::Height, Axis::Batch], &mut generic);
    assert_eq!(graph.gradient(bias).shape(), Shape::new(1, 1, 3, 1));
    assert_eq!(graph.gradient(bias).to_vec(), generic.to_vec());
    assert!(session.check_gradients(&mut graph, loss, &[(x, &input)], 1e-2) < TOLERANCE);
  }

  #[test]
  fn convolution_gradients() {
    for format in [DataFormat::Nchw, DataFormat::Nhwc] {
      let input_shape = match format {
        DataFormat::Nchw => Shape::new(5, 4, 2, 2),
        DataFormat::Nhwc => Shape::new(2, 5, 4, 2),
      };
      let mut graph = Graph::new();
      let x = graph.variable(random(input_shape, 30));
      let k = graph.variable(random(Shape::new(3, 3, 2, 3), 31));
      let params = Conv2dParams { stride: 2, padding: 1, format };
      let y = graph.conv2d(x, k, params);
      assert!(check(&mut graph, y, &[]) < TOLERANCE, "{:?}", format);
    }
  }

  #[test]
  fn fused_convolution_gradients() {
    let mut graph = Graph::new();
    let x = graph.variable(random(Shape::new(5, 5, 2, 2), 32));
    let k = graph.variable(random(Shape::new(3, 3, 2, 3), 33));
    let bias = graph.variable(random(Shape::new(1, 1, 3, 1), 34));
    let params = Conv2dParams { stride: 1, padding: 1, format: DataFormat::Nchw };
    let y = graph.conv2d_bias_activation(x, k, bias, params, Activation::Tanh);
    assert!(check(&mut graph, y, &[]) < TOLERANCE);
  }

  #[test]
  fn pooling_gradients() {
    for mode in [PoolMode::Max, PoolMode::Avg] {
      let mut graph = Graph::new();
      let x = graph.variable(distinct(Shape::new(6, 4, 2, 2), 40));
      let params = Pool2dParams { filter: 2, stride: 2, padding: 0, mode, format: DataFormat::Nchw };
      let pooled = graph.pool2d(x, params);
      let y = graph.upsample2d(pooled, 2);
      assert!(check(&mut graph, y, &[]) < TOLERANCE, "{:?}", mode);
    }
  }

  #[test]
  fn batch_norm_gradients() {
    for (mode, groups) in [(NormMode::Spatial, Shape::new(1, 1, 2, 1)), (NormMode::PerActivation, Shape::new(3, 2, 2, 1))] {
      let mut graph = Graph::new();
      let x = graph.variable(random(Shape::new(3, 2, 2, 8), 50));
      let gamma = graph.variable(positive(groups, 51));
      let beta = graph.variable(random(groups, 52));
      let params = NormParams { mode, epsilon: 1e-3, momentum: 0.9 };
      let y = graph.batch_norm(x, gamma, beta, params);
      assert!(check(&mut graph, y, &[]) < 2.0 * TOLERANCE, "{:?}", mode);
    }
  }

  #[test]
  fn batch_norm_skips_inputs_without_gradient() {
    let groups = Shape::new(1, 1, 2, 1);
    let params = NormParams { mode: NormMode::Spatial, epsilon: 1e-3, momentum: 0.9 };
    let input = random(Shape::new(3, 2, 2, 8), 53);
    let weights = random(Shape::new(3, 2, 2, 1), 56);

    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(3, 2, 2, 1));
    let gamma = graph.variable(positive(groups, 54));
    let beta = graph.constant(random(groups, 55));
    let y = graph.batch_norm(x, gamma, beta, params);
    let w = graph.constant(weights.clone());
    let product = graph.multiply(y, w);
    let loss = graph.sum(product, &Axis::ALL);
    let mut session = Session::default().training(true);
    session.run(&mut graph, &[loss], &[(x, &input)]);
    assert_eq!(session.compute_gradients(&mut graph, loss), vec![gamma]);
    let node = graph.node(y);
    assert!(!node.input_gradients[0].storage().is_allocated_on_host());
    assert!(node.input_gradients[1].storage().is_allocated_on_host());
    assert!(!node.input_gradients[2].storage().is_allocated_on_host());

    // Same gamma gradient as when every input cares
    let mut full = Graph::new();
    let fx = full.variable(input.clone());
    let fgamma = full.variable(graph.value(gamma).clone());
    let fbeta = full.variable(graph.value(beta).clone());
    let fy = full.batch_norm(fx, fgamma, fbeta, params);
    let fw = full.constant(weights);
    let fproduct = full.multiply(fy, fw);
    let floss = full.sum(fproduct, &Axis::ALL);
    session.run(&mut full, &[floss], &[]);
    session.compute_gradients(&mut full, floss);
    assert_eq!(full.gradient(fgamma).to_vec(), graph.gradient(gamma).to_vec());
  }

  #[test]
  fn dropout() {
    let mut graph = Graph::new();
    let x = graph.variable(Tensor::ones(Shape::new(50, 1, 1, 4)));
    let y = graph.dropout(x, 0.5);
    let loss = graph.sum(y, &Axis::ALL);
    let mut session = Session::default().training(true).seed(3);
    let output = session.run(&mut graph, &[y], &[])[0].to_vec();
    assert!(output.iter().all(|&v| v == 0.0 || v == 2.0 ));
    session.run(&mut graph, &[loss], &[]);
    session.compute_gradients(&mut graph, loss);
    assert_eq!(graph.gradient(x).to_vec(), graph.value(y).to_vec());

    session.set_training(false);
    assert_eq!(session.run(&mut graph, &[y], &[])[0].to_vec(), vec![1.0; 200]);
  }

  #[test]
  fn batch_norm_inference_uses_running_statistics() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(1, 1, 1, 1));
    let gamma = graph.constant(Tensor::ones(Shape::new(1, 1, 1, 1)));
    let beta = graph.constant(Tensor::zeros(Shape::new(1, 1, 1, 1)));
    let params = NormParams { mode: NormMode::PerActivation, epsilon: 0.0, momentum: 0.0 };
    let y = graph.batch_norm(x, gamma, beta, params);
    let batch = Tensor::from_vec(Shape::new(1, 1, 1, 2), vec![1.0, 3.0]);
    let mut session = Session::default().training(true);
    session.run(&mut graph, &[y], &[(x, &batch)]);
    session.set_training(false);
    // Running mean 2 and unbiased variance 2
    let single = Tensor::from_vec(Shape::new(1, 1, 1, 1), vec![4.0]);
    let output = session.run(&mut graph, &[y], &[(x, &single)])[0].to_vec();
    assert!((output[0] - 2.0 / 2.0f32.sqrt()).abs() < 1e-5);
  }

  #[test]
  fn topological_order_of_random_graphs() {
    let mut rng = StdRng::seed_from_u64(60);
    for _ in 0..20 {
      let mut graph = Graph::new();
      let mut ids = vec![graph.variable(Tensor::ones(Shape::vector(2)))];
      for _ in 0..30 {
        let a = ids[rng.gen_range(0, ids.len())];
        let b = ids[rng.gen_range(0, ids.len())];
        let id = if rng.gen::<bool>() { graph.add(a, b) } else { graph.tanh(a) };
        ids.push(id);
      }
      let fetches = [ids[rng.gen_range(0, ids.len())], ids[rng.gen_range(0, ids.len())]];
      let order = graph.forward_order(&fetches);
      let mut seen = HashSet::new();
      for id in order {
        assert!(graph.node(id).inputs().iter().all(|input| seen.contains(input) ));
        assert!(seen.insert(id));
      }
    }
  }

  #[test]
  fn deterministic() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(6, 6, 2, 1));
    let k = graph.variable(random(Shape::new(3, 3, 2, 4), 70));
    let bias = graph.variable(random(Shape::new(1, 1, 4, 1), 71));
    let params = Conv2dParams { stride: 1, padding: 1, format: DataFormat::Nchw };
    let y = graph.conv2d_bias_activation(x, k, bias, params, Activation::ReLU);
    let input = random(Shape::new(6, 6, 2, 3), 72);
    for backend in [Box::new(Cpu) as Box<dyn Backend>, Box::new(Accelerator)] {
      let mut session = Session::new(backend);
      let first = session.run(&mut graph, &[y], &[(x, &input)])[0].to_vec();
      let second = session.run(&mut graph, &[y], &[(x, &input)])[0].to_vec();
      assert_eq!(first, second);
    }
  }

  #[test]
  fn pruning() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::vector(4));
    // Frozen feature extractor
    let w1 = graph.constant(random(Shape::matrix(4, 4), 80));
    let h1 = graph.matmul(x, w1);
    let f1 = graph.tanh(h1);
    // Trained head
    let w2 = graph.variable(random(Shape::matrix(2, 4), 81));
    let h2 = graph.matmul(f1, w2);
    let loss = graph.sum(h2, &Axis::ALL);

    let input = random(Shape::vector(4), 82);
    let mut session = Session::default();
    session.run(&mut graph, &[loss], &[(x, &input)]);
    assert_eq!(session.compute_gradients(&mut graph, loss), vec![w2]);
    for id in [x, w1, h1, f1] {
      assert_eq!(graph.visits(id).differentiated, 0);
      assert!(graph.try_gradient(id).is_none());
      assert!(!graph.node(id).cares_about_gradient());
    }
    for id in [w2, h2, loss] {
      assert_eq!(graph.visits(id).differentiated, 1);
    }
    assert_eq!(graph.visits(h1).computed, 1);

    graph.unfreeze(w1);
    assert_eq!(session.compute_gradients(&mut graph, loss), vec![w1, w2]);
    assert_eq!(graph.visits(f1).differentiated, 1);
  }

  #[test]
  fn diamond_accumulation() {
    let mut graph = Graph::new();
    let w = graph.variable(Tensor::from_vec(Shape::vector(2), vec![1.0, 2.0]));
    let a = graph.scale(w, 3.0);
    let b = graph.pow(w, 2.0);
    let c = graph.add(a, b);
    let same = graph.multiply(w, w);
    let total = graph.add(c, same);
    let loss = graph.sum(total, &[Axis::Width]);
    let mut session = Session::default();
    session.run(&mut graph, &[loss], &[]);
    session.compute_gradients(&mut graph, loss);
    // 3 + 2w + 2w
    assert_eq!(graph.gradient(w).to_vec(), vec![7.0, 11.0]);
  }

  #[test]
  fn gradient_buffers_keep_their_names() {
    let mut graph = Graph::new();
    let w = graph.variable(random(Shape::new(3, 1, 1, 1), 70));
    let x = graph.constant(random(Shape::new(3, 1, 1, 4), 71));
    let a = graph.add(w, x);
    let b = graph.multiply(w, x);
    let c = graph.add(a, b);
    let loss = graph.sum(c, &Axis::ALL);
    let mut session = Session::default();
    session.run(&mut graph, &[loss], &[]);
    session.compute_gradients(&mut graph, loss);
    assert_eq!(graph.gradient(w).name(), format!("{}_grad", graph.node(w).name()));
    let expected = format!("{}_grad_{}", graph.node(a).name(), w.index());
    assert_eq!(graph.node(a).input_gradients[0].name(), expected);
    assert_eq!(graph.node(a).input_gradients[0].shape(), Shape::new(3, 1, 1, 1));
  }

  #[test]
  fn fetch_order() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::vector(2));
    let a = graph.scale(x, 2.0);
    let b = graph.negative(x);
    let input = Tensor::ones(Shape::vector(2));
    let mut session = Session::default();
    let outputs = session.run(&mut graph, &[b, a, x], &[(x, &input)]);
    assert_eq!(outputs[0].to_vec(), vec![-1.0; 2]);
    assert_eq!(outputs[1].to_vec(), vec![2.0; 2]);
    assert_eq!(outputs[2].to_vec(), vec![1.0; 2]);
    assert_eq!(graph.visits(x).computed, 1);
  }

  #[test]
  fn accelerator_matches_cpu_gradients() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::new(5, 5, 2, 1));
    let k = graph.variable(random(Shape::new(3, 3, 2, 3), 90));
    let bias = graph.variable(random(Shape::new(1, 1, 3, 1), 91));
    let params = Conv2dParams { stride: 1, padding: 0, format: DataFormat::Nchw };
    let y = graph.conv2d_bias_activation(x, k, bias, params, Activation::Sigmoid);
    let loss = weighted_loss(&mut graph, y, 92);
    let input = random(Shape::new(5, 5, 2, 2), 93);
    let mut results = vec![];
    for backend in [Box::new(Cpu) as Box<dyn Backend>, Box::new(Accelerator)] {
      let mut session = Session::new(backend);
      session.run(&mut graph, &[loss], &[(x, &input)]);
      session.compute_gradients(&mut graph, loss);
      results.push((graph.gradient(k).to_vec(), graph.gradient(bias).to_vec()));
    }
    assert_eq!(results[0], results[1]);
  }

  #[test]
  #[should_panic(expected = "has not been fed")]
  fn missing_feed() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::vector(2));
    let y = graph.negative(x);
    Session::default().run(&mut graph, &[y], &[]);
  }

  #[test]
  #[should_panic(expected = "cannot be fed a tensor of")]
  fn wrong_feed_shape() {
    let mut graph = Graph::new();
    let x = graph.placeholder(Shape::vector(2));
    let y = graph.negative(x);
    let input = Tensor::ones(Shape::vector(3));
    Session::default().run(&mut graph, &[y], &[(x, &input)]);
  }
}
