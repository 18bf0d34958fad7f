use crate::{
  internal::*,
  shape::Shape,
};

use super::{ Conv2dParams, DataFormat, Pool2dParams, PoolMode };


/// Image view of a [Shape] in a given [DataFormat].

#[derive(Debug, Clone, Copy)]
pub struct Layout {
  pub width: usize,
  pub height: usize,
  pub channels: usize,
  pub batch: usize,
  format: DataFormat,
}

impl Layout {
  pub fn new(shape: Shape, format: DataFormat) -> Self {
    let [a, b, c, batch] = shape.dims;
    match format {
      DataFormat::Nchw => Self { width: a, height: b, channels: c, batch, format },
      DataFormat::Nhwc => Self { width: b, height: c, channels: a, batch, format },
    }
  }

  pub fn shape(width: usize, height: usize, channels: usize, batch: usize, format: DataFormat) -> Shape {
    match format {
      DataFormat::Nchw => Shape::new(width, height, channels, batch),
      DataFormat::Nhwc => Shape::new(channels, width, height, batch),
    }
  }

  #[inline]
  pub fn index(&self, w: usize, h: usize, c: usize, n: usize) -> usize {
    match self.format {
      DataFormat::Nchw => w + self.width * (h + self.height * (c + self.channels * n)),
      DataFormat::Nhwc => c + self.channels * (w + self.width * (h + self.height * n)),
    }
  }

  /// `(w, h, c, n)` of a flat index.

  #[inline]
  pub fn coords(&self, index: usize) -> [usize; 4] {
    match self.format {
      DataFormat::Nchw => {
        let w = index % self.width;
        let rest = index / self.width;
        let h = rest % self.height;
        let rest = rest / self.height;
        [w, h, rest % self.channels, rest / self.channels]
      },
      DataFormat::Nhwc => {
        let c = index % self.channels;
        let rest = index / self.channels;
        let w = rest % self.width;
        let rest = rest / self.width;
        [w, rest % self.height, c, rest / self.height]
      },
    }
  }
}


fn window_output(len: usize, filter: usize, stride: usize, padding: usize) -> usize {
  assert!(stride > 0, "Stride must be positive");
  assert!(len + 2 * padding >= filter,
    "Filter of size {} doesn't fit input of size {} with padding {}", filter, len, padding);
  (len + 2 * padding - filter) / stride + 1
}

/// Output shape of a convolution with `kernels` of shape
/// (kernel width, kernel height, input channels, output channels).

pub fn conv_output_shape(input: Shape, kernels: Shape, stride: usize, padding: usize, format: DataFormat) -> Shape {
  let lay = Layout::new(input, format);
  assert!(kernels.depth() == lay.channels,
    "Kernels {} don't match the {} channels of input {}", kernels, lay.channels, input);
  Layout::shape(
    window_output(lay.width, kernels.width(), stride, padding),
    window_output(lay.height, kernels.height(), stride, padding),
    kernels.batch(),
    lay.batch,
    format,
  )
}

pub fn pool_output_shape(input: Shape, filter: usize, stride: usize, padding: usize, format: DataFormat) -> Shape {
  let lay = Layout::new(input, format);
  Layout::shape(
    window_output(lay.width, filter, stride, padding),
    window_output(lay.height, filter, stride, padding),
    lay.channels,
    lay.batch,
    format,
  )
}

// Input coordinate under a window offset, if inside the image
#[inline]
fn source(out: usize, offset: usize, stride: usize, padding: usize, len: usize) -> Option<usize> {
  let pos = (out * stride + offset).checked_sub(padding)?;
  (pos < len).then_some(pos)
}

// Output coordinate whose window places `offset` over input `pos`
#[inline]
fn target(pos: usize, offset: usize, stride: usize, padding: usize, len: usize) -> Option<usize> {
  let shifted = (pos + padding).checked_sub(offset)?;
  if shifted % stride != 0 { return None }
  let out = shifted / stride;
  (out < len).then_some(out)
}


#[allow(clippy::too_many_arguments)]
pub fn conv2d(input: &[f32], si: Shape, kernels: &[f32], sk: Shape, params: Conv2dParams, out: &mut [f32], so: Shape, parallel: bool) {
  let li = Layout::new(si, params.format);
  let lo = Layout::new(so, params.format);
  let Conv2dParams { stride, padding, .. } = params;
  chunked(out, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let [w, h, k, n] = lo.coords(i * CHUNK + j);
      let mut sum = 0.0;
      for c in 0..li.channels {
        for kh in 0..sk.height() {
          let Some(y) = source(h, kh, stride, padding, li.height) else { continue };
          for kw in 0..sk.width() {
            let Some(x) = source(w, kw, stride, padding, li.width) else { continue };
            sum += input[li.index(x, y, c, n)] * kernels[sk.index(kw, kh, c, k)];
          }
        }
      }
      *v = sum;
    }
  });
}

#[allow(clippy::too_many_arguments)]
pub fn conv2d_input_gradient(grad: &[f32], sg: Shape, kernels: &[f32], sk: Shape, params: Conv2dParams, out: &mut [f32], si: Shape, parallel: bool) {
  let li = Layout::new(si, params.format);
  let lg = Layout::new(sg, params.format);
  let Conv2dParams { stride, padding, .. } = params;
  chunked(out, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let [x, y, c, n] = li.coords(i * CHUNK + j);
      let mut sum = 0.0;
      for k in 0..lg.channels {
        for kh in 0..sk.height() {
          let Some(h) = target(y, kh, stride, padding, lg.height) else { continue };
          for kw in 0..sk.width() {
            let Some(w) = target(x, kw, stride, padding, lg.width) else { continue };
            sum += grad[lg.index(w, h, k, n)] * kernels[sk.index(kw, kh, c, k)];
          }
        }
      }
      *v = sum;
    }
  });
}

#[allow(clippy::too_many_arguments)]
pub fn conv2d_kernels_gradient(input: &[f32], si: Shape, grad: &[f32], sg: Shape, params: Conv2dParams, out: &mut [f32], sk: Shape, parallel: bool) {
  let li = Layout::new(si, params.format);
  let lg = Layout::new(sg, params.format);
  let Conv2dParams { stride, padding, .. } = params;
  chunked(out, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let [kw, kh, c, k] = sk.coords(i * CHUNK + j);
      let mut sum = 0.0;
      for n in 0..lg.batch {
        for h in 0..lg.height {
          let Some(y) = source(h, kh, stride, padding, li.height) else { continue };
          for w in 0..lg.width {
            let Some(x) = source(w, kw, stride, padding, li.width) else { continue };
            sum += input[li.index(x, y, c, n)] * grad[lg.index(w, h, k, n)];
          }
        }
      }
      *v = sum;
    }
  });
}

/// Per-channel sum over batch, height and width, in that nesting order.

pub fn conv2d_bias_gradient(grad: &[f32], sg: Shape, format: DataFormat, out: &mut [f32], parallel: bool) {
  let lg = Layout::new(sg, format);
  chunked(out, 1, parallel, |k, chunk| {
    let mut sum = 0.0;
    for n in 0..lg.batch {
      for h in 0..lg.height {
        for w in 0..lg.width {
          sum += grad[lg.index(w, h, k, n)];
        }
      }
    }
    chunk[0] = sum;
  });
}

pub fn add_channel_bias(values: &mut [f32], shape: Shape, bias: &[f32], format: DataFormat, parallel: bool) {
  let lay = Layout::new(shape, format);
  chunked(values, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let [_, _, c, _] = lay.coords(i * CHUNK + j);
      *v += bias[c];
    }
  });
}

#[allow(clippy::too_many_arguments)]
pub fn pool2d(input: &[f32], si: Shape, params: Pool2dParams, out: &mut [f32], so: Shape, parallel: bool) {
  let li = Layout::new(si, params.format);
  let lo = Layout::new(so, params.format);
  let Pool2dParams { filter, stride, padding, mode, .. } = params;
  let area = (filter * filter) as f32;
  chunked(out, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let [w, h, c, n] = lo.coords(i * CHUNK + j);
      let mut acc = match mode {
        PoolMode::Max => f32::NEG_INFINITY,
        PoolMode::Avg => 0.0,
      };
      for fy in 0..filter {
        let Some(y) = source(h, fy, stride, padding, li.height) else { continue };
        for fx in 0..filter {
          let Some(x) = source(w, fx, stride, padding, li.width) else { continue };
          let value = input[li.index(x, y, c, n)];
          match mode {
            PoolMode::Max => acc = acc.max(value),
            PoolMode::Avg => acc += value,
          }
        }
      }
      *v = match mode {
        PoolMode::Max => acc,
        PoolMode::Avg => acc / area,
      };
    }
  });
}

/// Route gradients back through every window covering each input value.
/// Max pooling credits all inputs equal to their window's maximum.

#[allow(clippy::too_many_arguments)]
pub fn pool2d_gradient(output: &[f32], so: Shape, input: &[f32], si: Shape, grad: &[f32], params: Pool2dParams, out: &mut [f32], parallel: bool) {
  let li = Layout::new(si, params.format);
  let lo = Layout::new(so, params.format);
  let Pool2dParams { filter, stride, padding, mode, .. } = params;
  let area = (filter * filter) as f32;
  chunked(out, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let index = i * CHUNK + j;
      let [x, y, c, n] = li.coords(index);
      let mut sum = 0.0;
      for fy in 0..filter {
        let Some(h) = target(y, fy, stride, padding, lo.height) else { continue };
        for fx in 0..filter {
          let Some(w) = target(x, fx, stride, padding, lo.width) else { continue };
          let o = lo.index(w, h, c, n);
          match mode {
            PoolMode::Max => if input[index] == output[o] { sum += grad[o] },
            PoolMode::Avg => sum += grad[o] / area,
          }
        }
      }
      *v = sum;
    }
  });
}

pub fn upsample2d(input: &[f32], si: Shape, scale: usize, out: &mut [f32], so: Shape, parallel: bool) {
  chunked(out, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let [w, h, d, n] = so.coords(i * CHUNK + j);
      *v = input[si.index(w / scale, h / scale, d, n)];
    }
  });
}

pub fn upsample2d_gradient(grad: &[f32], sg: Shape, scale: usize, out: &mut [f32], so: Shape, parallel: bool) {
  chunked(out, CHUNK, parallel, |i, chunk| {
    for (j, v) in chunk.iter_mut().enumerate() {
      let [w, h, d, n] = so.coords(i * CHUNK + j);
      let mut sum = 0.0;
      for y in 0..scale {
        for x in 0..scale {
          sum += grad[sg.index(w * scale + x, h * scale + y, d, n)];
        }
      }
      *v = sum;
    }
  });
}


#[cfg(test)]
mod tests {
  use super::*;

  const NCHW: Conv2dParams = Conv2dParams { stride: 1, padding: 0, format: DataFormat::Nchw };

  #[test]
  fn output_shapes() {
    let input = Shape::new(28, 28, 3, 8);
    assert_eq!(conv_output_shape(input, Shape::new(5, 5, 3, 16), 1, 0, DataFormat::Nchw), Shape::new(24, 24, 16, 8));
    assert_eq!(conv_output_shape(input, Shape::new(3, 3, 3, 4), 2, 1, DataFormat::Nchw), Shape::new(14, 14, 4, 8));
    assert_eq!(pool_output_shape(input, 2, 2, 0, DataFormat::Nchw), Shape::new(14, 14, 3, 8));
    assert_eq!(conv_output_shape(Shape::new(3, 28, 28, 8), Shape::new(5, 5, 3, 16), 1, 0, DataFormat::Nhwc), Shape::new(16, 24, 24, 8));
  }

  #[test]
  #[should_panic(expected = "channels of input")]
  fn channel_mismatch() {
    conv_output_shape(Shape::new(8, 8, 3, 1), Shape::new(3, 3, 2, 4), 1, 0, DataFormat::Nchw);
  }

  #[test]
  fn box_filter() {
    let si = Shape::new(3, 3, 1, 1);
    let input: Vec<f32> = (1..=9).map(|v| v as f32 ).collect();
    let sk = Shape::new(2, 2, 1, 1);
    let so = conv_output_shape(si, sk, 1, 0, DataFormat::Nchw);
    let mut out = vec![0.0; so.size()];
    conv2d(&input, si, &[1.0; 4], sk, NCHW, &mut out, so, false);
    assert_eq!(out, vec![12.0, 16.0, 24.0, 28.0]);

    // Every input is covered by as many windows as it contributes to
    let mut grad_in = vec![0.0; si.size()];
    conv2d_input_gradient(&[1.0; 4], so, &[1.0; 4], sk, NCHW, &mut grad_in, si, false);
    assert_eq!(grad_in, vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]);
  }

  #[test]
  fn formats_agree() {
    let nchw = Shape::new(4, 3, 2, 2);
    let input: Vec<f32> = (0..nchw.size()).map(|i| (i as f32 * 0.7).cos() ).collect();
    let li = Layout::new(nchw, DataFormat::Nchw);
    let nhwc = Layout::shape(4, 3, 2, 2, DataFormat::Nhwc);
    let ln = Layout::new(nhwc, DataFormat::Nhwc);
    let mut permuted = vec![0.0; input.len()];
    for (i, v) in input.iter().enumerate() {
      let [w, h, c, n] = li.coords(i);
      permuted[ln.index(w, h, c, n)] = *v;
    }
    let sk = Shape::new(2, 2, 2, 3);
    let kernels: Vec<f32> = (0..sk.size()).map(|i| i as f32 * 0.1 ).collect();
    let params = Conv2dParams { stride: 1, padding: 1, format: DataFormat::Nchw };
    let so = conv_output_shape(nchw, sk, 1, 1, DataFormat::Nchw);
    let mut a = vec![0.0; so.size()];
    conv2d(&input, nchw, &kernels, sk, params, &mut a, so, false);
    let params = Conv2dParams { format: DataFormat::Nhwc, ..params };
    let so_n = conv_output_shape(nhwc, sk, 1, 1, DataFormat::Nhwc);
    let mut b = vec![0.0; so_n.size()];
    conv2d(&permuted, nhwc, &kernels, sk, params, &mut b, so_n, false);
    let (lo, lon) = (Layout::new(so, DataFormat::Nchw), Layout::new(so_n, DataFormat::Nhwc));
    for (i, v) in a.iter().enumerate() {
      let [w, h, c, n] = lo.coords(i);
      assert_eq!(*v, b[lon.index(w, h, c, n)]);
    }
  }

  #[test]
  fn max_pool() {
    let si = Shape::new(4, 2, 1, 1);
    let input = [1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 8.0, 7.0];
    let params = Pool2dParams { filter: 2, stride: 2, padding: 0, mode: PoolMode::Max, format: DataFormat::Nchw };
    let so = pool_output_shape(si, 2, 2, 0, DataFormat::Nchw);
    let mut out = vec![0.0; 2];
    pool2d(&input, si, params, &mut out, so, false);
    assert_eq!(out, vec![5.0, 8.0]);
    let mut grad = vec![0.0; 8];
    pool2d_gradient(&out, so, &input, si, &[1.0, 2.0], params, &mut grad, false);
    assert_eq!(grad, vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
  }

  #[test]
  fn upsample() {
    let si = Shape::new(2, 1, 1, 1);
    let so = Shape::new(4, 2, 1, 1);
    let mut out = vec![0.0; 8];
    upsample2d(&[1.0, 2.0], si, 2, &mut out, so, false);
    assert_eq!(out, vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
    let mut grad = vec![0.0; 2];
    upsample2d_gradient(&out, so, 2, &mut grad, si, false);
    assert_eq!(grad, vec![4.0, 8.0]);
  }
}
