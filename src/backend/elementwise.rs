use itertools::izip;
use rand::Rng;

use crate::{
  internal::*,
  shape::Shape,
};

use super::Activation;


impl Activation {
  pub fn apply(self, x: f32) -> f32 {
    match self {
      Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
      Self::Tanh => x.tanh(),
      Self::ReLU => x.max(0.0),
      Self::LeakyReLU(alpha) => if x > 0.0 { x } else { alpha * x },
      Self::Elu(alpha) => if x >= 0.0 { x } else { alpha * (x.exp() - 1.0) },
      Self::Softmax => panic!("Softmax is not elementwise"),
    }
  }

  /// Derivative scaled by `grad`, in terms of the activation's output `y`.

  pub fn derive(self, y: f32, grad: f32) -> f32 {
    match self {
      Self::Sigmoid => grad * y * (1.0 - y),
      Self::Tanh => grad * (1.0 - y * y),
      Self::ReLU => if y > 0.0 { grad } else { 0.0 },
      Self::LeakyReLU(alpha) => if y > 0.0 { grad } else { alpha * grad },
      Self::Elu(alpha) => if y > 0.0 { grad } else { grad * (y + alpha) },
      Self::Softmax => panic!("Softmax is not elementwise"),
    }
  }
}


pub fn fill(out: &mut [f32], value: f32, parallel: bool) {
  chunked(out, CHUNK, parallel, |_, c| c.fill(value) );
}

pub fn map<F>(a: &[f32], out: &mut [f32], parallel: bool, f: F)
where
  F: Fn(f32) -> f32 + Send + Sync,
{
  chunked(out, CHUNK, parallel, |i, c| {
    let a = &a[i * CHUNK..];
    for (v, &x) in c.iter_mut().zip(a) {
      *v = f(x);
    }
  });
}

/// Apply `f` to pairs of values, broadcasting axes of length 1.

#[allow(clippy::too_many_arguments)]
pub fn zip<F>(a: &[f32], sa: Shape, b: &[f32], sb: Shape, out: &mut [f32], so: Shape, parallel: bool, f: F)
where
  F: Fn(f32, f32) -> f32 + Send + Sync,
{
  if sa == so && sb == so {
    chunked(out, CHUNK, parallel, |i, c| {
      let start = i * CHUNK;
      for (j, v) in c.iter_mut().enumerate() {
        *v = f(a[start + j], b[start + j]);
      }
    });
  } else {
    chunked(out, CHUNK, parallel, |i, c| {
      for (j, v) in c.iter_mut().enumerate() {
        let [w, h, d, n] = so.coords(i * CHUNK + j);
        *v = f(a[sa.broadcast_index(w, h, d, n)], b[sb.broadcast_index(w, h, d, n)]);
      }
    });
  }
}

/// Activate `values` in place. Softmax normalizes items of `item_len` values.

pub fn activate(values: &mut [f32], item_len: usize, kind: Activation, parallel: bool) {
  if kind == Activation::Softmax {
    chunked(values, item_len, parallel, |_, item| {
      let max = item.iter().copied().fold(f32::NEG_INFINITY, f32::max);
      let mut sum = 0.0;
      for v in item.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
      }
      for v in item.iter_mut() {
        *v /= sum;
      }
    });
  } else {
    chunked(values, CHUNK, parallel, |_, c| {
      for v in c.iter_mut() {
        *v = kind.apply(*v);
      }
    });
  }
}

pub fn activation_gradient(y: &[f32], grad: &[f32], out: &mut [f32], item_len: usize, kind: Activation, parallel: bool) {
  if kind == Activation::Softmax {
    chunked(out, item_len, parallel, |i, item| {
      let start = i * item_len;
      let y = &y[start..start + item.len()];
      let g = &grad[start..start + item.len()];
      let dot: f32 = y.iter().zip(g).map(|(y, g)| y * g ).sum();
      for (v, (&y, &g)) in item.iter_mut().zip(y.iter().zip(g)) {
        *v = y * (g - dot);
      }
    });
  } else {
    chunked(out, CHUNK, parallel, |i, c| {
      let start = i * CHUNK;
      for (j, v) in c.iter_mut().enumerate() {
        *v = kind.derive(y[start + j], grad[start + j]);
      }
    });
  }
}

/// Fill `mask` with `0` at probability `prob` and `1 / (1 - prob)` elsewhere.

pub fn dropout_mask(mask: &mut [f32], prob: f32, rng: &mut impl Rng) {
  let scale = 1.0 / (1.0 - prob);
  for v in mask.iter_mut() {
    *v = if rng.gen::<f32>() < prob { 0.0 } else { scale };
  }
}

pub fn sgd_step(param: &mut [f32], grad: &[f32], batch_size: f32, lr: f32) {
  for (p, g) in param.iter_mut().zip(grad) {
    *p -= lr * g / batch_size;
  }
}

#[allow(clippy::too_many_arguments)]
pub fn adam_step(param: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32], batch_size: f32, lr: f32, beta1: f32, beta2: f32, epsilon: f32) {
  for (p, g, m, v) in izip!(param.iter_mut(), grad, m.iter_mut(), v.iter_mut()) {
    let g = g / batch_size;
    *m = beta1 * *m + (1.0 - beta1) * g;
    *v = beta2 * *v + (1.0 - beta2) * g * g;
    *p -= lr * *m / (v.sqrt() + epsilon);
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn softmax_gradient_sums_to_zero() {
    let mut y = vec![0.5, -1.0, 2.0, 0.0, 1.0, 3.0];
    activate(&mut y, 3, Activation::Softmax, false);
    let grad = vec![1.0, 2.0, 3.0, 1.0, 1.0, 1.0];
    let mut out = vec![0.0; 6];
    activation_gradient(&y, &grad, &mut out, 3, Activation::Softmax, false);
    assert!(out[..3].iter().sum::<f32>().abs() < 1e-6);
    assert!(out[3..].iter().all(|v| v.abs() < 1e-6 ));
  }

  #[test]
  fn elu() {
    let y = Activation::Elu(1.0).apply(-1.0);
    assert!((y - (-0.63212055)).abs() < 1e-6);
    assert!((Activation::Elu(1.0).derive(y, 1.0) - (-1.0f32).exp()).abs() < 1e-6);
  }

  #[test]
  fn adam() {
    let (mut p, mut m, mut v) = (vec![1.0], vec![0.0], vec![0.0]);
    adam_step(&mut p, &[2.0], &mut m, &mut v, 1.0, 0.1, 0.9, 0.999, 0.0);
    assert!((m[0] - 0.2).abs() < 1e-6);
    assert!((v[0] - 0.004).abs() < 1e-6);
    assert!((p[0] - (1.0 - 0.1 * m[0] / v[0].sqrt())).abs() < 1e-6);
    assert!((p[0] - (1.0 - 0.1 * 0.2 / 0.004f32.sqrt())).abs() < 1e-5);
  }
}
