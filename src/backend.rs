use std::fmt::Debug;

use rand::rngs::StdRng;

mod elementwise;
mod linalg;
mod conv;
mod norm;

pub use conv::{ conv_output_shape, pool_output_shape };
pub use linalg::matmul_shape;
pub use norm::group_shape;

use crate::{
  shape::{ Axis, Shape },
  storage::Location,
  tensor::Tensor,
};


/// Nonlinearities with a closed-form derivative in terms of their output.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
  Sigmoid,
  Tanh,
  ReLU,
  LeakyReLU(f32),
  Elu(f32),
  /// Normalizes each batch item separately.
  Softmax,
}


/// Memory order of image tensors.
///
/// `Nchw` is the native [Shape] order (width, height, channels, batch).
/// `Nhwc` stores channels innermost, so its shapes read
/// (channels, width, height, batch).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
  #[default]
  Nchw,
  Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
  Max,
  Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormMode {
  /// One set of statistics per channel, shared across width, height and batch.
  Spatial,
  /// One set of statistics per activation, over the batch only.
  PerActivation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
  pub stride: usize,
  pub padding: usize,
  pub format: DataFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2dParams {
  pub filter: usize,
  pub stride: usize,
  pub padding: usize,
  pub mode: PoolMode,
  pub format: DataFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormParams {
  pub mode: NormMode,
  pub epsilon: f32,
  /// Weight of the previous running statistics in each update.
  pub momentum: f32,
}


/// Running and per-batch statistics of a batch normalization.

#[derive(Debug, Clone)]
pub struct NormStats {
  pub running_mean: Tensor,
  pub running_var: Tensor,
  pub save_mean: Tensor,
  pub save_inv_var: Tensor,
}

impl NormStats {
  pub fn new(shape: Shape) -> Self {
    Self {
      running_mean: Tensor::zeros(shape),
      running_var: Tensor::ones(shape),
      save_mean: Tensor::zeros(shape),
      save_inv_var: Tensor::ones(shape),
    }
  }
}


/// Compute primitives operating on [Tensor]s.
///
/// Implementors only choose the memory space they compute in and whether
/// a single primitive may fork work across threads. Every primitive reads
/// its operands from that space, resizes its output and leaves the output
/// authoritative there. Kernels compute each output value independently,
/// so all backends produce bit-identical results.

pub trait Backend: Debug + Send + Sync {
  fn name(&self) -> &'static str;

  fn location(&self) -> Location {
    Location::Host
  }

  fn parallel(&self) -> bool {
    false
  }

  fn fill(&self, out: &mut Tensor, value: f32) {
    let mut values = out.write(self.location(), true);
    elementwise::fill(&mut values, value, self.parallel());
  }

  fn copy(&self, a: &Tensor, out: &mut Tensor) {
    map_into(self, a, out, |x| x );
  }

  /// `out = alpha * a + beta * b` with broadcasting.

  fn add(&self, alpha: f32, a: &Tensor, beta: f32, b: &Tensor, out: &mut Tensor) {
    zip_into(self, a, b, out, move |x, y| alpha * x + beta * y );
  }

  fn add_scalar(&self, a: &Tensor, value: f32, out: &mut Tensor) {
    map_into(self, a, out, move |x| x + value );
  }

  fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) {
    zip_into(self, a, b, out, |x, y| x - y );
  }

  fn mul_elem(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) {
    zip_into(self, a, b, out, |x, y| x * y );
  }

  fn div(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) {
    zip_into(self, a, b, out, |x, y| x / y );
  }

  fn scale(&self, a: &Tensor, factor: f32, out: &mut Tensor) {
    map_into(self, a, out, move |x| x * factor );
  }

  fn negate(&self, a: &Tensor, out: &mut Tensor) {
    map_into(self, a, out, |x| -x );
  }

  fn pow(&self, a: &Tensor, power: f32, out: &mut Tensor) {
    map_into(self, a, out, move |x| x.powf(power) );
  }

  /// `out = grad * power * a^(power - 1)`

  fn pow_gradient(&self, a: &Tensor, power: f32, grad: &Tensor, out: &mut Tensor) {
    zip_into(self, a, grad, out, move |x, g| g * power * x.powf(power - 1.0) );
  }

  fn log(&self, a: &Tensor, out: &mut Tensor) {
    map_into(self, a, out, |x| x.ln() );
  }

  fn map(&self, f: &(dyn Fn(f32) -> f32 + Send + Sync), a: &Tensor, out: &mut Tensor) {
    map_into(self, a, out, f);
  }

  fn map2(&self, f: &(dyn Fn(f32, f32) -> f32 + Send + Sync), a: &Tensor, b: &Tensor, out: &mut Tensor) {
    zip_into(self, a, b, out, f);
  }

  /// Matrix product of every depth slice and batch item. Width is the
  /// column count, height the row count. Depth and batch of length 1
  /// are broadcast.

  fn matmul(&self, transpose_a: bool, transpose_b: bool, a: &Tensor, b: &Tensor, out: &mut Tensor) {
    let shape = linalg::matmul_shape(transpose_a, transpose_b, a.shape(), b.shape());
    out.resize(shape);
    let loc = self.location();
    let (va, vb) = (a.read(loc), b.read(loc));
    let mut vo = out.write(loc, true);
    linalg::matmul(transpose_a, transpose_b, &va, a.shape(), &vb, b.shape(), &mut vo, shape, self.parallel());
  }

  fn transpose(&self, a: &Tensor, out: &mut Tensor) {
    out.resize(a.shape().transposed());
    let loc = self.location();
    let va = a.read(loc);
    let mut vo = out.write(loc, true);
    linalg::transpose(&va, a.shape(), &mut vo, self.parallel());
  }

  /// Sum over `axes`, keeping them with length 1.

  fn sum(&self, a: &Tensor, axes: &[Axis], out: &mut Tensor) {
    let shape = axes.iter().fold(a.shape(), |shape, &axis| shape.with_len(axis, 1) );
    out.resize(shape);
    let loc = self.location();
    let va = a.read(loc);
    let mut vo = out.write(loc, true);
    if axes == [Axis::Batch] {
      linalg::sum_batches(&va, a.shape(), &mut vo, self.parallel());
    } else {
      linalg::sum(&va, a.shape(), &mut vo, shape, self.parallel());
    }
  }

  fn activation(&self, kind: Activation, a: &Tensor, out: &mut Tensor) {
    out.resize(a.shape());
    let loc = self.location();
    let va = a.read(loc);
    let mut vo = out.write(loc, true);
    vo.copy_from_slice(&va);
    elementwise::activate(&mut vo, a.shape().batch_length(), kind, self.parallel());
  }

  /// Input gradient of an activation given its `output`.

  fn activation_gradient(&self, kind: Activation, output: &Tensor, grad: &Tensor, out: &mut Tensor) {
    out.resize(output.shape());
    let loc = self.location();
    let (vy, vg) = (output.read(loc), grad.read(loc));
    let mut vo = out.write(loc, true);
    elementwise::activation_gradient(&vy, &vg, &mut vo, output.shape().batch_length(), kind, self.parallel());
  }

  /// Cross-correlation of `input` with `kernels` of shape
  /// (kernel width, kernel height, input channels, output channels).

  fn conv2d(&self, input: &Tensor, kernels: &Tensor, params: Conv2dParams, out: &mut Tensor) {
    let shape = conv_output_shape(input.shape(), kernels.shape(), params.stride, params.padding, params.format);
    out.resize(shape);
    let loc = self.location();
    let (vi, vk) = (input.read(loc), kernels.read(loc));
    let mut vo = out.write(loc, true);
    conv::conv2d(&vi, input.shape(), &vk, kernels.shape(), params, &mut vo, shape, self.parallel());
  }

  /// Convolution followed by a per-channel bias and an activation.

  fn conv2d_bias_activation(&self, input: &Tensor, kernels: &Tensor, params: Conv2dParams, bias: &Tensor, activation: Activation, out: &mut Tensor) {
    self.conv2d(input, kernels, params, out);
    let shape = out.shape();
    let loc = self.location();
    let vb = bias.read(loc);
    let mut vo = out.write(loc, false);
    conv::add_channel_bias(&mut vo, shape, &vb, params.format, self.parallel());
    elementwise::activate(&mut vo, shape.batch_length(), activation, self.parallel());
  }

  fn conv2d_input_gradient(&self, grad: &Tensor, kernels: &Tensor, params: Conv2dParams, input_shape: Shape, out: &mut Tensor) {
    out.resize(input_shape);
    let loc = self.location();
    let (vg, vk) = (grad.read(loc), kernels.read(loc));
    let mut vo = out.write(loc, true);
    conv::conv2d_input_gradient(&vg, grad.shape(), &vk, kernels.shape(), params, &mut vo, input_shape, self.parallel());
  }

  fn conv2d_kernels_gradient(&self, input: &Tensor, grad: &Tensor, params: Conv2dParams, kernels_shape: Shape, out: &mut Tensor) {
    out.resize(kernels_shape);
    let loc = self.location();
    let (vi, vg) = (input.read(loc), grad.read(loc));
    let mut vo = out.write(loc, true);
    conv::conv2d_kernels_gradient(&vi, input.shape(), &vg, grad.shape(), params, &mut vo, kernels_shape, self.parallel());
  }

  /// Gradient of a per-channel bias: sum over width, height and batch.

  fn conv2d_bias_gradient(&self, grad: &Tensor, format: DataFormat, out: &mut Tensor) {
    let channels = conv::Layout::new(grad.shape(), format).channels;
    out.resize(Shape::new(1, 1, channels, 1));
    let loc = self.location();
    let vg = grad.read(loc);
    let mut vo = out.write(loc, true);
    conv::conv2d_bias_gradient(&vg, grad.shape(), format, &mut vo, self.parallel());
  }

  fn pool2d(&self, input: &Tensor, params: Pool2dParams, out: &mut Tensor) {
    let shape = pool_output_shape(input.shape(), params.filter, params.stride, params.padding, params.format);
    out.resize(shape);
    let loc = self.location();
    let vi = input.read(loc);
    let mut vo = out.write(loc, true);
    conv::pool2d(&vi, input.shape(), params, &mut vo, shape, self.parallel());
  }

  fn pool2d_gradient(&self, output: &Tensor, input: &Tensor, grad: &Tensor, params: Pool2dParams, out: &mut Tensor) {
    out.resize(input.shape());
    let loc = self.location();
    let (vy, vi, vg) = (output.read(loc), input.read(loc), grad.read(loc));
    let mut vo = out.write(loc, true);
    conv::pool2d_gradient(&vy, output.shape(), &vi, input.shape(), &vg, params, &mut vo, self.parallel());
  }

  fn upsample2d(&self, input: &Tensor, scale: usize, out: &mut Tensor) {
    let s = input.shape();
    let shape = Shape::new(s.width() * scale, s.height() * scale, s.depth(), s.batch());
    out.resize(shape);
    let loc = self.location();
    let vi = input.read(loc);
    let mut vo = out.write(loc, true);
    conv::upsample2d(&vi, s, scale, &mut vo, shape, self.parallel());
  }

  fn upsample2d_gradient(&self, grad: &Tensor, scale: usize, out: &mut Tensor) {
    let s = grad.shape();
    let shape = Shape::new(s.width() / scale, s.height() / scale, s.depth(), s.batch());
    out.resize(shape);
    let loc = self.location();
    let vg = grad.read(loc);
    let mut vo = out.write(loc, true);
    conv::upsample2d_gradient(&vg, s, scale, &mut vo, shape, self.parallel());
  }

  /// Normalize with the running statistics.

  fn batch_norm(&self, input: &Tensor, gamma: &Tensor, beta: &Tensor, params: NormParams, stats: &NormStats, out: &mut Tensor) {
    out.resize(input.shape());
    let loc = self.location();
    let (vi, vgamma, vbeta) = (input.read(loc), gamma.read(loc), beta.read(loc));
    let (mean, var) = (stats.running_mean.read(loc), stats.running_var.read(loc));
    let inv_var: Vec<f32> = var.iter().map(|v| 1.0 / (v + params.epsilon).sqrt() ).collect();
    let mut vo = out.write(loc, true);
    norm::normalize(&vi, input.shape(), params.mode, &mean, &inv_var, &vgamma, &vbeta, &mut vo, self.parallel());
  }

  /// Normalize with batch statistics, saving them for the gradient and
  /// blending them into the running statistics.

  fn batch_norm_train(&self, input: &Tensor, gamma: &Tensor, beta: &Tensor, params: NormParams, stats: &mut NormStats, out: &mut Tensor) {
    let groups = norm::group_shape(input.shape(), params.mode);
    out.resize(input.shape());
    stats.save_mean.resize(groups);
    stats.save_inv_var.resize(groups);
    let loc = self.location();
    let (vi, vgamma, vbeta) = (input.read(loc), gamma.read(loc), beta.read(loc));
    let mut mean = stats.save_mean.write(loc, true);
    let mut inv_var = stats.save_inv_var.write(loc, true);
    let mut running_mean = stats.running_mean.write(loc, false);
    let mut running_var = stats.running_var.write(loc, false);
    norm::statistics(&vi, input.shape(), params, &mut mean, &mut inv_var, &mut running_mean, &mut running_var, self.parallel());
    let mut vo = out.write(loc, true);
    norm::normalize(&vi, input.shape(), params.mode, &mean, &inv_var, &vgamma, &vbeta, &mut vo, self.parallel());
  }

  /// Gradients of batch normalization, written only into the buffers
  /// given. Uses the batch statistics saved by the last training pass.

  fn batch_norm_gradient(&self, input: &Tensor, gamma: &Tensor, grad: &Tensor, params: NormParams, stats: &NormStats, gamma_grad: Option<&mut Tensor>, beta_grad: Option<&mut Tensor>, input_grad: Option<&mut Tensor>) {
    let groups = norm::group_shape(input.shape(), params.mode);
    let loc = self.location();
    let (vi, vg) = (input.read(loc), grad.read(loc));
    let (mean, inv_var) = (stats.save_mean.read(loc), stats.save_inv_var.read(loc));
    let mut dgamma = vec![0.0; groups.size()];
    let mut dbeta = vec![0.0; groups.size()];
    norm::parameter_gradients(&vi, input.shape(), params.mode, &vg, &mean, &inv_var, &mut dgamma, &mut dbeta, self.parallel());
    if let Some(input_grad) = input_grad {
      input_grad.resize(input.shape());
      let vgamma = gamma.read(loc);
      let mut dx = input_grad.write(loc, true);
      norm::input_gradient(&vi, input.shape(), params.mode, &vgamma, &vg, &mean, &inv_var, &dgamma, &dbeta, &mut dx, self.parallel());
    }
    for (target, values) in [(gamma_grad, dgamma), (beta_grad, dbeta)] {
      if let Some(target) = target {
        target.resize(groups);
        target.write(loc, true).copy_from_slice(&values);
      }
    }
  }

  /// Zero values with probability `prob`, scaling the rest by `1 / (1 - prob)`.
  /// The applied mask is kept for the gradient.

  fn dropout(&self, input: &Tensor, prob: f32, rng: &mut StdRng, mask: &mut Tensor, out: &mut Tensor) {
    mask.resize(input.shape());
    {
      let mut vm = mask.write(self.location(), true);
      elementwise::dropout_mask(&mut vm, prob, rng);
    }
    self.mul_elem(input, mask, out);
  }

  fn dropout_gradient(&self, grad: &Tensor, mask: &Tensor, out: &mut Tensor) {
    self.mul_elem(grad, mask, out);
  }

  /// `param -= lr * grad / batch_size`

  fn sgd_step(&self, param: &mut Tensor, grad: &Tensor, batch_size: f32, lr: f32) {
    let loc = self.location();
    let vg = grad.read(loc);
    let mut vp = param.write(loc, false);
    elementwise::sgd_step(&mut vp, &vg, batch_size, lr);
  }

  /// Adam update. `lr` is expected to carry the bias correction.

  fn adam_step(&self, param: &mut Tensor, grad: &Tensor, m: &mut Tensor, v: &mut Tensor, batch_size: f32, lr: f32, beta1: f32, beta2: f32, epsilon: f32) {
    let loc = self.location();
    let vg = grad.read(loc);
    let mut vp = param.write(loc, false);
    let mut vm = m.write(loc, false);
    let mut vv = v.write(loc, false);
    elementwise::adam_step(&mut vp, &vg, &mut vm, &mut vv, batch_size, lr, beta1, beta2, epsilon);
  }
}


fn map_into<B, F>(backend: &B, a: &Tensor, out: &mut Tensor, f: F)
where
  B: Backend + ?Sized,
  F: Fn(f32) -> f32 + Send + Sync,
{
  out.resize(a.shape());
  let loc = backend.location();
  let va = a.read(loc);
  let mut vo = out.write(loc, true);
  elementwise::map(&va, &mut vo, backend.parallel(), f);
}

fn zip_into<B, F>(backend: &B, a: &Tensor, b: &Tensor, out: &mut Tensor, f: F)
where
  B: Backend + ?Sized,
  F: Fn(f32, f32) -> f32 + Send + Sync,
{
  let shape = a.shape().broadcast(&b.shape());
  out.resize(shape);
  let loc = backend.location();
  let (va, vb) = (a.read(loc), b.read(loc));
  let mut vo = out.write(loc, true);
  elementwise::zip(&va, a.shape(), &vb, b.shape(), &mut vo, shape, backend.parallel(), f);
}


/// Single threaded host backend.

#[derive(Debug, Clone, Copy, Default)]
pub struct Cpu;

impl Backend for Cpu {
  fn name(&self) -> &'static str { "cpu" }
}


/// Host backend that splits each primitive across the rayon thread pool.

#[cfg(feature = "rayon")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiCpu;

#[cfg(feature = "rayon")]
impl Backend for MultiCpu {
  fn name(&self) -> &'static str { "multi_cpu" }
  fn parallel(&self) -> bool { true }
}


/// Backend computing in device memory. Operands are staged on their
/// storage's [Device](crate::Device) and results stay there until read.

#[derive(Debug, Clone, Copy, Default)]
pub struct Accelerator;

impl Backend for Accelerator {
  fn name(&self) -> &'static str { "accelerator" }
  fn location(&self) -> Location { Location::Device }
  fn parallel(&self) -> bool { cfg!(feature = "rayon") }
}
