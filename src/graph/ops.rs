use rand::rngs::StdRng;

use crate::{
  shape::{ Axis, Shape },
  tensor::Tensor,
  storage::{ Location, StorageType },
  backend::{
    Backend, Activation, Conv2dParams, Pool2dParams, NormParams, NormStats, DataFormat,
    conv_output_shape, pool_output_shape, matmul_shape, group_shape,
  },
};


/// Everything an operation needs from the running session.

pub(crate) struct Context<'a> {
  pub backend: &'a dyn Backend,
  pub training: bool,
  pub rng: &'a mut StdRng,
  pub scratch: &'a mut Tensor,
}


/// Kinds of computation a graph node can perform.
///
/// Variants carry their parameters along with any buffers they
/// keep between the forward and the backward pass.

#[derive(Debug)]
pub enum Op {
  Add,
  AddScalar(f32),
  Sub,
  Multiply,
  Scale(f32),
  Divide { quotient: Tensor },
  MatMul,
  Transpose,
  Negative,
  Log,
  Pow(f32),
  Sum(Vec<Axis>),
  Mean { axes: Vec<Axis>, sum: Tensor },
  Activation(Activation),
  Conv2d(Conv2dParams),
  Conv2dBiasActivation { params: Conv2dParams, activation: Activation, workspace: Tensor },
  Pool2d(Pool2dParams),
  UpSample2d(usize),
  BatchNorm { params: NormParams, stats: NormStats },
  Dropout { prob: f32, mask: Tensor },
}

impl Op {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Add => "add",
      Self::AddScalar(_) => "add_scalar",
      Self::Sub => "sub",
      Self::Multiply => "multiply",
      Self::Scale(_) => "scale",
      Self::Divide { .. } => "divide",
      Self::MatMul => "matmul",
      Self::Transpose => "transpose",
      Self::Negative => "negative",
      Self::Log => "log",
      Self::Pow(_) => "pow",
      Self::Sum(_) => "sum",
      Self::Mean { .. } => "mean",
      Self::Activation(kind) => match kind {
        Activation::Sigmoid => "sigmoid",
        Activation::Tanh => "tanh",
        Activation::ReLU => "relu",
        Activation::LeakyReLU(_) => "leaky_relu",
        Activation::Elu(_) => "elu",
        Activation::Softmax => "softmax",
      },
      Self::Conv2d(_) => "conv2d",
      Self::Conv2dBiasActivation { .. } => "conv2d_bias_activation",
      Self::Pool2d(_) => "pool2d",
      Self::UpSample2d(_) => "upsample2d",
      Self::BatchNorm { .. } => "batch_norm",
      Self::Dropout { .. } => "dropout",
    }
  }

  pub fn arity(&self) -> usize {
    match self {
      Self::Add | Self::Sub | Self::Multiply | Self::Divide { .. } | Self::MatMul | Self::Conv2d(_) => 2,
      Self::Conv2dBiasActivation { .. } | Self::BatchNorm { .. } => 3,
      _ => 1,
    }
  }

  /// Shape of the result for inputs of the given shapes.

  pub fn output_shape(&self, inputs: &[Shape]) -> Shape {
    let name = self.name();
    assert!(inputs.len() == self.arity(),
      "Operation {} takes {} inputs, got {}", name, self.arity(), inputs.len());
    let a = inputs[0];
    match self {
      Self::Add | Self::Sub | Self::Multiply | Self::Divide { .. } => {
        let b = inputs[1];
        assert!(a.dims.iter().zip(b.dims.iter()).all(|(&x, &y)| x == y || x == 1 || y == 1 ),
          "Operation {} could not broadcast {} & {}", name, a, b);
        a.broadcast(&b)
      },
      Self::MatMul => {
        let b = inputs[1];
        assert!(a.width() == b.height(),
          "Operation {}: inner dimensions of {} & {} don't match", name, a, b);
        matmul_shape(false, false, a, b)
      },
      Self::Transpose => a.transposed(),
      Self::Sum(axes) | Self::Mean { axes, .. } => {
        axes.iter().fold(a, |shape, &axis| shape.with_len(axis, 1) )
      },
      Self::Conv2d(params) => conv_shape(name, a, inputs[1], params),
      Self::Conv2dBiasActivation { params, .. } => {
        let shape = conv_shape(name, a, inputs[1], params);
        let bias = inputs[2];
        assert!(bias == Shape::new(1, 1, inputs[1].batch(), 1),
          "Operation {}: bias {} doesn't match {} output channels", name, bias, inputs[1].batch());
        shape
      },
      Self::Pool2d(params) => {
        pool_output_shape(a, params.filter, params.stride, params.padding, params.format)
      },
      Self::UpSample2d(scale) => {
        assert!(*scale > 0, "Operation {}: scale must be positive", name);
        Shape::new(a.width() * scale, a.height() * scale, a.depth(), a.batch())
      },
      Self::BatchNorm { params, .. } => {
        let groups = group_shape(a, params.mode);
        assert!(inputs[1] == groups && inputs[2] == groups,
          "Operation {}: gamma {} and beta {} must be of {} for input {}", name, inputs[1], inputs[2], groups, a);
        a
      },
      Self::Dropout { prob, .. } => {
        assert!((0.0..1.0).contains(prob), "Operation {}: drop probability {} not in [0, 1)", name, prob);
        a
      },
      _ => a,
    }
  }

  pub(crate) fn compute(&mut self, ctx: &mut Context, inputs: &[&Tensor], output: &mut Tensor) {
    let backend = ctx.backend;
    let a = inputs[0];
    match self {
      Self::Add => backend.add(1.0, a, 1.0, inputs[1], output),
      Self::AddScalar(value) => backend.add_scalar(a, *value, output),
      Self::Sub => backend.sub(a, inputs[1], output),
      Self::Multiply => backend.mul_elem(a, inputs[1], output),
      Self::Scale(factor) => backend.scale(a, *factor, output),
      Self::Divide { .. } => backend.div(a, inputs[1], output),
      Self::MatMul => backend.matmul(false, false, a, inputs[1], output),
      Self::Transpose => backend.transpose(a, output),
      Self::Negative => backend.negate(a, output),
      Self::Log => backend.log(a, output),
      Self::Pow(power) => backend.pow(a, *power, output),
      Self::Sum(axes) => backend.sum(a, axes, output),
      Self::Mean { axes, sum } => {
        backend.sum(a, axes, sum);
        backend.scale(sum, 1.0 / count(a.shape(), axes), output);
      },
      Self::Activation(kind) => backend.activation(*kind, a, output),
      Self::Conv2d(params) => backend.conv2d(a, inputs[1], *params, output),
      Self::Conv2dBiasActivation { params, activation, .. } => {
        backend.conv2d_bias_activation(a, inputs[1], *params, inputs[2], *activation, output);
      },
      Self::Pool2d(params) => backend.pool2d(a, *params, output),
      Self::UpSample2d(scale) => backend.upsample2d(a, *scale, output),
      Self::BatchNorm { params, stats } => if ctx.training {
        backend.batch_norm_train(a, inputs[1], inputs[2], *params, stats, output);
      } else {
        backend.batch_norm(a, inputs[1], inputs[2], *params, stats, output);
      },
      Self::Dropout { prob, mask } => if ctx.training {
        backend.dropout(a, *prob, ctx.rng, mask, output);
      } else {
        backend.copy(a, output);
      },
    }
  }

  /// Write the gradient with respect to every input that `cares`
  /// into `input_grads`, reduced to that input's current shape.

  pub(crate) fn gradient(&mut self, ctx: &mut Context, inputs: &[&Tensor], output: &Tensor, grad: &Tensor, cares: &[bool], input_grads: &mut [Tensor]) {
    let backend = ctx.backend;
    let a = inputs[0];
    match self {
      Self::Add => {
        for (i, input) in inputs.iter().enumerate() {
          if !cares[i] { continue }
          backend.copy(grad, &mut input_grads[i]);
          reduce_to(ctx, input.shape(), &mut input_grads[i]);
        }
      },
      Self::Sub => {
        if cares[0] {
          backend.copy(grad, &mut input_grads[0]);
          reduce_to(ctx, a.shape(), &mut input_grads[0]);
        }
        if cares[1] {
          backend.negate(grad, &mut input_grads[1]);
          reduce_to(ctx, inputs[1].shape(), &mut input_grads[1]);
        }
      },
      Self::Multiply => {
        for i in 0..2 {
          if !cares[i] { continue }
          backend.mul_elem(grad, inputs[1 - i], &mut input_grads[i]);
          reduce_to(ctx, inputs[i].shape(), &mut input_grads[i]);
        }
      },
      Self::Divide { quotient } => {
        let b = inputs[1];
        backend.div(grad, b, quotient);
        if cares[0] {
          backend.copy(quotient, &mut input_grads[0]);
          reduce_to(ctx, a.shape(), &mut input_grads[0]);
        }
        if cares[1] {
          // d(a / b) / db = -(grad / b) * (a / b)
          backend.map2(&|q: f32, y: f32| -q * y, quotient, output, &mut input_grads[1]);
          reduce_to(ctx, b.shape(), &mut input_grads[1]);
        }
      },
      Self::MatMul => {
        let b = inputs[1];
        if cares[0] {
          backend.matmul(false, true, grad, b, &mut input_grads[0]);
          reduce_to(ctx, a.shape(), &mut input_grads[0]);
        }
        if cares[1] {
          backend.matmul(true, false, a, grad, &mut input_grads[1]);
          reduce_to(ctx, b.shape(), &mut input_grads[1]);
        }
      },
      Self::Conv2d(params) => {
        let kernels = inputs[1];
        if cares[0] {
          backend.conv2d_input_gradient(grad, kernels, *params, a.shape(), &mut input_grads[0]);
        }
        if cares[1] {
          backend.conv2d_kernels_gradient(a, grad, *params, kernels.shape(), &mut input_grads[1]);
        }
      },
      Self::Conv2dBiasActivation { params, activation, workspace } => {
        let on_device = backend.location() == Location::Device;
        if on_device { workspace.try_device_allocate() }
        backend.activation_gradient(*activation, output, grad, workspace);
        let kernels = inputs[1];
        if cares[0] {
          backend.conv2d_input_gradient(workspace, kernels, *params, a.shape(), &mut input_grads[0]);
        }
        if cares[1] {
          backend.conv2d_kernels_gradient(a, workspace, *params, kernels.shape(), &mut input_grads[1]);
        }
        if cares[2] {
          backend.conv2d_bias_gradient(workspace, params.format, &mut input_grads[2]);
        }
        if on_device { workspace.try_device_release() }
      },
      Self::BatchNorm { params, stats } => {
        if let [input_grad, gamma_grad, beta_grad] = input_grads {
          backend.batch_norm_gradient(a, inputs[1], grad, *params, stats,
            cares[1].then_some(gamma_grad), cares[2].then_some(beta_grad), cares[0].then_some(input_grad));
        }
      },
      op => {
        // Single input operations
        if !cares[0] { return }
        let out = &mut input_grads[0];
        match op {
          Self::AddScalar(_) => backend.copy(grad, out),
          Self::Scale(factor) => backend.scale(grad, *factor, out),
          Self::Transpose => backend.transpose(grad, out),
          Self::Negative => backend.negate(grad, out),
          Self::Log => backend.div(grad, a, out),
          Self::Pow(power) => backend.pow_gradient(a, *power, grad, out),
          Self::Sum(_) => backend.map2(&|g: f32, _: f32| g, grad, a, out),
          Self::Mean { axes, .. } => {
            let factor = 1.0 / count(a.shape(), axes);
            backend.map2(&move |g: f32, _: f32| g * factor, grad, a, out);
          },
          Self::Activation(kind) => backend.activation_gradient(*kind, output, grad, out),
          Self::Pool2d(params) => backend.pool2d_gradient(output, a, grad, *params, out),
          Self::UpSample2d(scale) => backend.upsample2d_gradient(grad, *scale, out),
          Self::Dropout { mask, .. } => if ctx.training {
            backend.dropout_gradient(grad, mask, out);
          } else {
            backend.copy(grad, out);
          },
          _ => unreachable!(),
        }
      },
    }
  }
}


fn conv_shape(name: &str, input: Shape, kernels: Shape, params: &Conv2dParams) -> Shape {
  let channels = match params.format {
    DataFormat::Nchw => input.depth(),
    DataFormat::Nhwc => input.width(),
  };
  assert!(kernels.depth() == channels,
    "Operation {}: kernels {} don't match the {} channels of input {}", name, kernels, channels, input);
  conv_output_shape(input, kernels, params.stride, params.padding, params.format)
}

fn count(shape: Shape, axes: &[Axis]) -> f32 {
  axes.iter().map(|&axis| shape.len(axis) ).product::<usize>() as f32
}

/// Sum a gradient down to the `target` shape of the input it belongs
/// to, over exactly the axes along which that input was broadcast.

pub(crate) fn reduce_to(ctx: &mut Context, target: Shape, grad: &mut Tensor) {
  if grad.shape() == target { return }
  grad.swap_contents(ctx.scratch);
  reduce_into(ctx.backend, ctx.scratch, target, grad);
}

pub(crate) fn reduce_into(backend: &dyn Backend, full: &Tensor, target: Shape, out: &mut Tensor) {
  let axes = target.broadcast_axes(&full.shape());
  if axes.is_empty() {
    backend.copy(full, out);
  } else if axes == [Axis::Width, Axis::Height, Axis::Batch] {
    // Per channel bias
    backend.conv2d_bias_gradient(full, DataFormat::Nchw, out);
  } else {
    backend.sum(full, &axes, out);
  }
}

/// Scratch buffers shared with device kernels get reference counted.

pub(crate) fn workspace(shape: Shape) -> Tensor {
  Tensor::with_type(shape, StorageType::DEVICE_REF_COUNTED)
}
