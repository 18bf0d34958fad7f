use crate::{
  internal::*,
  shape::Shape,
};

use super::{ NormMode, NormParams };


/// Shape of the per-group statistics and of gamma and beta.

pub fn group_shape(shape: Shape, mode: NormMode) -> Shape {
  match mode {
    NormMode::Spatial => Shape::new(1, 1, shape.depth(), 1),
    NormMode::PerActivation => shape.with_batch(1),
  }
}

#[derive(Debug, Clone, Copy)]
struct Groups {
  shape: Shape,
  mode: NormMode,
}

impl Groups {
  fn members(&self) -> usize {
    match self.mode {
      NormMode::Spatial => self.shape.width() * self.shape.height() * self.shape.batch(),
      NormMode::PerActivation => self.shape.batch(),
    }
  }

  fn group_of(&self, index: usize) -> usize {
    match self.mode {
      NormMode::Spatial => self.shape.coords(index)[2],
      NormMode::PerActivation => index % self.shape.batch_length(),
    }
  }

  // Flat index of the `j`th member of group `g`
  fn member(&self, g: usize, j: usize) -> usize {
    match self.mode {
      NormMode::Spatial => {
        let plane = self.shape.width() * self.shape.height();
        j % plane + plane * (g + self.shape.depth() * (j / plane))
      },
      NormMode::PerActivation => g + self.shape.batch_length() * j,
    }
  }
}


/// Batch mean and inverse standard deviation per group. Running
/// statistics get blended with the batch's mean and unbiased variance.

#[allow(clippy::too_many_arguments)]
pub fn statistics(x: &[f32], shape: Shape, params: NormParams, mean: &mut [f32], inv_var: &mut [f32], running_mean: &mut [f32], running_var: &mut [f32], parallel: bool) {
  let groups = Groups { shape, mode: params.mode };
  let m = groups.members();
  chunked(mean, 1, parallel, |g, c| {
    c[0] = (0..m).map(|j| x[groups.member(g, j)] ).sum::<f32>() / m as f32;
  });
  let mean = &*mean;
  let mut var = vec![0.0; mean.len()];
  chunked(&mut var, 1, parallel, |g, c| {
    c[0] = (0..m).map(|j| (x[groups.member(g, j)] - mean[g]).powi(2) ).sum::<f32>() / m as f32;
  });
  let correction = if m > 1 { m as f32 / (m - 1) as f32 } else { 1.0 };
  for g in 0..var.len() {
    inv_var[g] = 1.0 / (var[g] + params.epsilon).sqrt();
    running_mean[g] = params.momentum * running_mean[g] + (1.0 - params.momentum) * mean[g];
    running_var[g] = params.momentum * running_var[g] + (1.0 - params.momentum) * var[g] * correction;
  }
}

#[allow(clippy::too_many_arguments)]
pub fn normalize(x: &[f32], shape: Shape, mode: NormMode, mean: &[f32], inv_var: &[f32], gamma: &[f32], beta: &[f32], out: &mut [f32], parallel: bool) {
  let groups = Groups { shape, mode };
  chunked(out, CHUNK, parallel, |i, c| {
    for (j, v) in c.iter_mut().enumerate() {
      let index = i * CHUNK + j;
      let g = groups.group_of(index);
      *v = gamma[g] * (x[index] - mean[g]) * inv_var[g] + beta[g];
    }
  });
}

/// Gradients of the scale and shift parameters of every group.

#[allow(clippy::too_many_arguments)]
pub fn parameter_gradients(x: &[f32], shape: Shape, mode: NormMode, grad: &[f32], mean: &[f32], inv_var: &[f32], dgamma: &mut [f32], dbeta: &mut [f32], parallel: bool) {
  let groups = Groups { shape, mode };
  let m = groups.members();
  chunked(dbeta, 1, parallel, |g, c| {
    c[0] = (0..m).map(|j| grad[groups.member(g, j)] ).sum();
  });
  chunked(dgamma, 1, parallel, |g, c| {
    c[0] = (0..m)
      .map(|j| groups.member(g, j) )
      .map(|i| grad[i] * (x[i] - mean[g]) * inv_var[g] )
      .sum();
  });
}

#[allow(clippy::too_many_arguments)]
pub fn input_gradient(x: &[f32], shape: Shape, mode: NormMode, gamma: &[f32], grad: &[f32], mean: &[f32], inv_var: &[f32], dgamma: &[f32], dbeta: &[f32], dx: &mut [f32], parallel: bool) {
  let groups = Groups { shape, mode };
  let m = groups.members() as f32;
  chunked(dx, CHUNK, parallel, |i, c| {
    for (j, v) in c.iter_mut().enumerate() {
      let index = i * CHUNK + j;
      let g = groups.group_of(index);
      let xhat = (x[index] - mean[g]) * inv_var[g];
      *v = gamma[g] * inv_var[g] / m * (m * grad[index] - dbeta[g] - xhat * dgamma[g]);
    }
  });
}
