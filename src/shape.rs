use std::fmt::Debug;

use itertools::Itertools;
use serde::{ Serialize, Deserialize };


/// One of the four axes of a [Shape].

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
  Width,
  Height,
  Depth,
  Batch,
}

impl Axis {
  pub const ALL: [Axis; 4] = [Axis::Width, Axis::Height, Axis::Depth, Axis::Batch];

  pub fn index(self) -> usize {
    match self {
      Axis::Width => 0,
      Axis::Height => 1,
      Axis::Depth => 2,
      Axis::Batch => 3,
    }
  }
}


/// The shape of a [Tensor](crate::Tensor).
///
/// Dimensions are stored innermost first: width, height, depth and batch.
/// Values are laid out contiguously, so the flat index of `(w, h, d, n)` is
/// `w + width * (h + height * (d + depth * n))`. Matrices use width as their
/// column count and height as their row count.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
  pub dims: [usize; 4],
}

impl Shape {
  pub fn new(width: usize, height: usize, depth: usize, batch: usize) -> Self {
    Self { dims: [width, height, depth, batch] }
  }

  /// Build a shape from up to four dimensions. Missing ones are set to 1.

  pub fn from_dims(dims: &[usize]) -> Self {
    assert!(dims.len() <= 4, "Shapes have at most 4 dimensions, got {:?}", dims);
    let mut out = [1; 4];
    out[..dims.len()].copy_from_slice(dims);
    Self { dims: out }
  }

  pub fn vector(len: usize) -> Self {
    Self::new(len, 1, 1, 1)
  }

  pub fn matrix(width: usize, height: usize) -> Self {
    Self::new(width, height, 1, 1)
  }

  pub fn width(&self) -> usize { self.dims[0] }
  pub fn height(&self) -> usize { self.dims[1] }
  pub fn depth(&self) -> usize { self.dims[2] }
  pub fn batch(&self) -> usize { self.dims[3] }

  pub fn len(&self, axis: Axis) -> usize {
    self.dims[axis.index()]
  }

  pub fn size(&self) -> usize {
    self.dims.iter().product()
  }

  /// Number of values in a single batch item.

  pub fn batch_length(&self) -> usize {
    self.dims[0] * self.dims[1] * self.dims[2]
  }

  pub fn with_batch(&self, batch: usize) -> Self {
    Self::new(self.dims[0], self.dims[1], self.dims[2], batch)
  }

  pub fn with_len(&self, axis: Axis, len: usize) -> Self {
    let mut shape = *self;
    shape.dims[axis.index()] = len;
    shape
  }

  /// Shape with width and height swapped.

  pub fn transposed(&self) -> Self {
    Self::new(self.dims[1], self.dims[0], self.dims[2], self.dims[3])
  }

  /// True when both shapes agree on everything but the batch axis.

  pub fn same_item(&self, other: &Self) -> bool {
    self.dims[..3] == other.dims[..3]
  }

  #[inline]
  pub fn index(&self, w: usize, h: usize, d: usize, n: usize) -> usize {
    w + self.dims[0] * (h + self.dims[1] * (d + self.dims[2] * n))
  }

  /// Flat index with every axis of length 1 pinned to zero,
  /// which implements broadcasting reads.

  #[inline]
  pub fn broadcast_index(&self, w: usize, h: usize, d: usize, n: usize) -> usize {
    let pin = |i: usize, len: usize| if len == 1 { 0 } else { i };
    self.index(
      pin(w, self.dims[0]),
      pin(h, self.dims[1]),
      pin(d, self.dims[2]),
      pin(n, self.dims[3]),
    )
  }

  /// Split a flat index back into `(w, h, d, n)`.

  #[inline]
  pub fn coords(&self, index: usize) -> [usize; 4] {
    let w = index % self.dims[0];
    let rest = index / self.dims[0];
    let h = rest % self.dims[1];
    let rest = rest / self.dims[1];
    let d = rest % self.dims[2];
    [w, h, d, rest / self.dims[2]]
  }

  /// Elementwise broadcast of two shapes. Each axis must either match
  /// or have length 1 on one side.

  pub fn broadcast(&self, other: &Self) -> Self {
    let mut dims = [0; 4];
    for i in 0..4 {
      let (a, b) = (self.dims[i], other.dims[i]);
      assert!(a == b || a == 1 || b == 1, "Could not broadcast {} & {}", self, other);
      dims[i] = a.max(b);
    }
    Self { dims }
  }

  /// Axes along which `self` got expanded to reach `target`.

  pub fn broadcast_axes(&self, target: &Self) -> Vec<Axis> {
    Axis::ALL.iter()
      .copied()
      .filter(|&axis| self.len(axis) == 1 && target.len(axis) != 1 )
      .collect()
  }
}

impl std::ops::Index<Axis> for Shape {
  type Output = usize;

  fn index(&self, axis: Axis) -> &usize {
    &self.dims[axis.index()]
  }
}

impl std::fmt::Display for Shape {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Shape[{}]", self.dims.iter().join(", "))
  }
}
