use std::collections::HashMap;

use log::debug;

use crate::{
  tensor::Tensor,
  backend::Backend,
  graph::{ Graph, NodeId },
  session::Session,
};


/// An optimization strategy to be used with [Optimizer].
///
/// Gradients arrive summed over the batch, so strategies
/// divide them by `batch_size`.

pub trait Strategy {
  fn update(&mut self, backend: &dyn Backend, id: NodeId, param: &mut Tensor, grad: &Tensor, rate: f32, step: usize, batch_size: f32);
}


/// Generic optimizer that allows for several optimization [strategies](Strategy) to be used.

#[derive(Debug)]
pub struct Optimizer<S: Strategy> {
  strategy: S,
  pub learning_rate: f32,
  step: usize,
}

impl<S: Strategy> Optimizer<S> {
  pub fn new(learning_rate: f32, strategy: S) -> Self {
    Self { strategy, learning_rate, step: 1 }
  }

  pub fn step(&self) -> usize {
    self.step
  }

  /// Run `loss`, differentiate it and update all trainable variables
  /// it depends on. Returns the loss averaged over the batch.

  pub fn minimize(&mut self, session: &mut Session, graph: &mut Graph, loss: NodeId, feeds: &[(NodeId, &Tensor)]) -> f32 {
    // Compute loss and gradients
    let (total, batch_size) = {
      let value = session.run(graph, &[loss], feeds)[0];
      (value.values().iter().sum::<f32>(), value.batch() as f32)
    };
    let params = session.compute_gradients(graph, loss);

    // Optimize individual parameters
    for &id in &params {
      let (param, grad) = graph.parameter_mut(id);
      self.strategy.update(session.backend(), id, param, grad, self.learning_rate, self.step, batch_size);
    }
    debug!("Optimizer step {} updated {} variables", self.step, params.len());

    self.step += 1;
    total / batch_size
  }
}


/// Stochastic Gradient Descent strategy

#[derive(Debug, Clone, Default)]
pub struct Sgd;

impl Strategy for Sgd {
  fn update(&mut self, backend: &dyn Backend, _id: NodeId, param: &mut Tensor, grad: &Tensor, rate: f32, _step: usize, batch_size: f32) {
    backend.sgd_step(param, grad, batch_size, rate);
  }
}


/// Stochastic Gradient Descent with momentum

#[derive(Debug)]
pub struct Momentum {
  pub momentum: f32,
  v: HashMap<NodeId, Tensor>,
  scratch: Option<Tensor>,
}

impl Momentum {
  pub fn new(momentum: f32) -> Self {
    Self {
      momentum,
      v: HashMap::new(),
      scratch: None,
    }
  }
}

impl Default for Momentum {
  fn default() -> Self {
    Self::new(0.9)
  }
}

impl Strategy for Momentum {
  fn update(&mut self, backend: &dyn Backend, id: NodeId, param: &mut Tensor, grad: &Tensor, rate: f32, _step: usize, batch_size: f32) {
    let shape = param.shape();
    let v = self.v.entry(id).or_insert_with(|| Tensor::zeros(shape) );
    let scratch = self.scratch.get_or_insert_with(|| Tensor::new(shape) );
    backend.add(self.momentum, v, -rate / batch_size, grad, scratch);
    v.swap_contents(scratch);
    backend.add(1.0, param, 1.0, v, scratch);
    backend.copy(scratch, param);
  }
}


/// Adaptive Movement Estimation strategy (ADAM)

#[derive(Debug)]
pub struct Adam {
  pub beta1: f32,
  pub beta2: f32,
  pub epsilon: f32,
  m: HashMap<NodeId, Tensor>,
  v: HashMap<NodeId, Tensor>,
}

impl Adam {
  pub fn new(beta1: f32, beta2: f32) -> Self {
    Self {
      beta1,
      beta2,
      epsilon: 1e-8,
      m: HashMap::new(),
      v: HashMap::new(),
    }
  }
}

impl Default for Adam {
  fn default() -> Self {
    Self::new(0.9, 0.999)
  }
}

impl Strategy for Adam {
  fn update(&mut self, backend: &dyn Backend, id: NodeId, param: &mut Tensor, grad: &Tensor, rate: f32, step: usize, batch_size: f32) {
    let shape = param.shape();
    let m = self.m.entry(id).or_insert_with(|| Tensor::zeros(shape) );
    let v = self.v.entry(id).or_insert_with(|| Tensor::zeros(shape) );
    let step = step as i32;
    let rate = rate * (1.0 - self.beta2.powi(step)).sqrt() / (1.0 - self.beta1.powi(step));
    backend.adam_step(param, grad, m, v, batch_size, rate, self.beta1, self.beta2, self.epsilon);
  }
}
