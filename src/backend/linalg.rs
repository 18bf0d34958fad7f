use crate::{
  internal::*,
  shape::Shape,
};


#[inline]
fn pin(i: usize, len: usize) -> usize {
  if len == 1 { 0 } else { i }
}

/// Output shape of a (possibly transposed) matrix product.

pub fn matmul_shape(transpose_a: bool, transpose_b: bool, a: Shape, b: Shape) -> Shape {
  let (rows, inner_a) = if transpose_a { (a.width(), a.height()) } else { (a.height(), a.width()) };
  let (inner_b, cols) = if transpose_b { (b.width(), b.height()) } else { (b.height(), b.width()) };
  assert!(inner_a == inner_b,
    "Inner dimensions of {} & {} don't match for matrix multiplication", a, b);
  assert!(a.depth() == b.depth() || a.depth() == 1 || b.depth() == 1,
    "Could not broadcast depth of {} & {}", a, b);
  assert!(a.batch() == b.batch() || a.batch() == 1 || b.batch() == 1,
    "Could not broadcast batch of {} & {}", a, b);
  Shape::new(cols, rows, a.depth().max(b.depth()), a.batch().max(b.batch()))
}

#[allow(clippy::too_many_arguments)]
pub fn matmul(transpose_a: bool, transpose_b: bool, a: &[f32], sa: Shape, b: &[f32], sb: Shape, out: &mut [f32], so: Shape, parallel: bool) {
  let m = so.height();
  let n = so.width();
  let k = if transpose_a { sa.height() } else { sa.width() };
  let len_a = sa.width() * sa.height();
  let len_b = sb.width() * sb.height();
  chunked(out, m * n, parallel, |i, c| {
    let (d, batch) = (i % so.depth(), i / so.depth());
    let ia = (pin(d, sa.depth()) + sa.depth() * pin(batch, sa.batch())) * len_a;
    let ib = (pin(d, sb.depth()) + sb.depth() * pin(batch, sb.batch())) * len_b;
    gemm(transpose_a, transpose_b, m, k, n, &a[ia..ia + len_a], &b[ib..ib + len_b], c);
  });
}

// Row-major operands. Transposition swaps row and column strides.

#[cfg(feature = "unsafe")]
#[allow(clippy::too_many_arguments)]
fn gemm(transpose_a: bool, transpose_b: bool, m: usize, k: usize, n: usize, a: &[f32], b: &[f32], c: &mut [f32]) {
  if k == 0 {
    c.fill(0.0);
    return
  }
  let (rsa, csa) = if transpose_a { (1, m as isize) } else { (k as isize, 1) };
  let (rsb, csb) = if transpose_b { (1, k as isize) } else { (n as isize, 1) };
  unsafe {
    matrixmultiply::sgemm(
      m,
      k,
      n,
      1.0,
      a.as_ptr(),
      rsa,
      csa,
      b.as_ptr(),
      rsb,
      csb,
      0.0,
      c.as_mut_ptr(),
      n as isize,
      1,
    );
  }
}

#[cfg(not(feature = "unsafe"))]
#[allow(clippy::too_many_arguments)]
fn gemm(transpose_a: bool, transpose_b: bool, m: usize, k: usize, n: usize, a: &[f32], b: &[f32], c: &mut [f32]) {
  let at = |i: usize, p: usize| if transpose_a { a[p * m + i] } else { a[i * k + p] };
  let bt = |p: usize, j: usize| if transpose_b { b[j * k + p] } else { b[p * n + j] };
  for i in 0..m {
    for j in 0..n {
      let mut sum = 0.0;
      for p in 0..k {
        sum += at(i, p) * bt(p, j);
      }
      c[i * n + j] = sum;
    }
  }
}

pub fn transpose(a: &[f32], sa: Shape, out: &mut [f32], parallel: bool) {
  let so = sa.transposed();
  chunked(out, CHUNK, parallel, |i, c| {
    for (j, v) in c.iter_mut().enumerate() {
      let [w, h, d, n] = so.coords(i * CHUNK + j);
      *v = a[sa.index(h, w, d, n)];
    }
  });
}

/// Sum `a` down to `so`, which has length 1 on every reduced axis.

pub fn sum(a: &[f32], sa: Shape, out: &mut [f32], so: Shape, parallel: bool) {
  let range = |axis: usize, at: usize| if so.dims[axis] == 1 { 0..sa.dims[axis] } else { at..at + 1 };
  chunked(out, CHUNK, parallel, |i, c| {
    for (j, v) in c.iter_mut().enumerate() {
      let [w, h, d, n] = so.coords(i * CHUNK + j);
      let mut total = 0.0;
      for n in range(3, n) {
        for d in range(2, d) {
          for h in range(1, h) {
            for w in range(0, w) {
              total += a[sa.index(w, h, d, n)];
            }
          }
        }
      }
      *v = total;
    }
  });
}

/// Sum over the batch axis only.

pub fn sum_batches(a: &[f32], sa: Shape, out: &mut [f32], parallel: bool) {
  let item = sa.batch_length();
  chunked(out, CHUNK, parallel, |i, c| {
    let start = i * CHUNK;
    for (j, v) in c.iter_mut().enumerate() {
      let mut total = 0.0;
      for n in 0..sa.batch() {
        total += a[start + j + n * item];
      }
      *v = total;
    }
  });
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::shape::Axis;

  #[test]
  fn transposed_products() {
    // 2 rows, 3 columns
    let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let sa = Shape::matrix(3, 2);
    let so = matmul_shape(false, true, sa, sa);
    assert_eq!(so, Shape::matrix(2, 2));
    let mut out = vec![0.0; 4];
    matmul(false, true, &a, sa, &a, sa, &mut out, so, false);
    assert_eq!(out, vec![14.0, 32.0, 32.0, 77.0]);

    let so = matmul_shape(true, false, sa, sa);
    let mut out = vec![0.0; 9];
    matmul(true, false, &a, sa, &a, sa, &mut out, so, true);
    assert_eq!(out, vec![17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]);
  }

  #[test]
  fn batch_broadcast() {
    let a = [1.0, 2.0, 3.0, 4.0];
    let sa = Shape::new(2, 1, 1, 2);
    let b = [1.0, 0.0, 0.0, 1.0];
    let sb = Shape::matrix(2, 2);
    let so = matmul_shape(false, false, sa, sb);
    assert_eq!(so, Shape::new(2, 1, 1, 2));
    let mut out = vec![0.0; 4];
    matmul(false, false, &a, sa, &b, sb, &mut out, so, false);
    assert_eq!(out, a.to_vec());
  }

  #[test]
  #[should_panic(expected = "Inner dimensions")]
  fn inner_mismatch() {
    matmul_shape(false, false, Shape::matrix(5, 1), Shape::matrix(2, 4));
  }

  #[test]
  fn batch_sum_matches_generic_sum() {
    let sa = Shape::new(3, 2, 2, 5);
    let a: Vec<f32> = (0..sa.size()).map(|i| (i as f32 * 0.37).sin() ).collect();
    let so = sa.with_batch(1);
    let mut generic = vec![0.0; so.size()];
    let mut special = vec![0.0; so.size()];
    sum(&a, sa, &mut generic, so, false);
    sum_batches(&a, sa, &mut special, true);
    assert_eq!(generic, special);
    assert_eq!(sa.broadcast_axes(&so), Vec::<Axis>::new());
    assert_eq!(so.broadcast_axes(&sa), vec![Axis::Batch]);
  }
}
