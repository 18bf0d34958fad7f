use std::fmt::Debug;

use rand::Rng;

use crate::{
  internal::*,
  shape::{ Axis, Shape },
  storage::{ Device, Location, Storage, StorageType, Values, ValuesMut, Event },
  backend::{ Backend, Cpu },
};


/// Dense four dimensional array of `f32` values.
///
/// A tensor pairs a fixed [Shape] with a [Storage] holding its values.
/// Only the batch length is expected to change over a tensor's lifetime,
/// and growing it reuses the existing allocation whenever capacity allows.
///
/// Values are read and written through guards that synchronize the
/// storage to host memory first. Compute [backends](Backend) access
/// the storage in whichever memory space they run in.

#[derive(Debug, Clone)]
pub struct Tensor {
  shape: Shape,
  storage: Storage,
}

impl Tensor {
  /// Zero-filled tensor. Memory is allocated on first access.

  pub fn new(shape: Shape) -> Self {
    Self::with_type(shape, StorageType::DEFAULT)
  }

  pub fn named(shape: Shape, name: &str) -> Self {
    Self { shape, storage: Storage::new(StorageType::DEFAULT, shape.size(), name) }
  }

  pub fn with_type(shape: Shape, kind: StorageType) -> Self {
    Self { shape, storage: Storage::new(kind, shape.size(), "") }
  }

  pub fn with_device(shape: Shape, kind: StorageType, device: &Device) -> Self {
    Self { shape, storage: Storage::with_device(kind, shape.size(), "", device) }
  }

  pub fn from_vec(shape: Shape, values: Vec<f32>) -> Self {
    assert_eq!(shape.size(), values.len(),
      "{} doesn't match data length {}", shape, values.len());
    let tensor = Self::new(shape);
    tensor.overwrite().copy_from_slice(&values);
    tensor
  }

  pub fn zeros(shape: Shape) -> Self {
    Self::fill(shape, 0.0)
  }

  pub fn ones(shape: Shape) -> Self {
    Self::fill(shape, 1.0)
  }

  pub fn fill(shape: Shape, value: f32) -> Self {
    let tensor = Self::new(shape);
    tensor.overwrite().fill(value);
    tensor
  }

  pub fn random_uniform(shape: Shape, low: f32, high: f32, rng: &mut impl Rng) -> Self {
    let values = (0..shape.size()).map(|_| rng.gen_range(low, high) ).collect();
    Self::from_vec(shape, values)
  }

  pub fn random_normal(shape: Shape, mean: f32, std: f32, rng: &mut impl Rng) -> Self {
    let mut values = Vec::with_capacity(shape.size() + 1);
    while values.len() < shape.size() {
      let (a, b) = randn(rng);
      values.push(mean + a * std);
      values.push(mean + b * std);
    }
    values.truncate(shape.size());
    Self::from_vec(shape, values)
  }

  pub fn shape(&self) -> Shape {
    self.shape
  }

  pub fn len(&self) -> usize {
    self.shape.size()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn batch(&self) -> usize {
    self.shape.batch()
  }

  pub fn name(&self) -> &str {
    self.storage.name()
  }

  pub fn set_name(&mut self, name: &str) {
    self.storage.set_name(name);
  }

  /// Exchange shapes and buffers with `other`. Both keep their names.

  pub(crate) fn swap_contents(&mut self, other: &mut Tensor) {
    std::mem::swap(self, other);
    let name = self.name().to_string();
    self.set_name(other.name());
    other.set_name(&name);
  }

  pub fn storage(&self) -> &Storage {
    &self.storage
  }

  pub fn location(&self) -> Location {
    self.storage.location()
  }

  pub fn change_type(&mut self, kind: StorageType) {
    self.storage.change_type(kind);
  }

  pub fn resize(&mut self, shape: Shape) {
    self.shape = shape;
    self.storage.resize(shape.size());
  }

  pub fn resize_batch(&mut self, batch: usize) {
    self.resize(self.shape.with_batch(batch));
  }

  /// Read all values on host.

  pub fn values(&self) -> Values {
    self.storage.read(Location::Host)
  }

  /// Modify values on host, keeping their previous contents.

  pub fn values_mut(&self) -> ValuesMut {
    self.storage.write(Location::Host, false)
  }

  /// Host access for a full overwrite. Previous contents are not
  /// synchronized and must be treated as garbage.

  pub fn overwrite(&self) -> ValuesMut {
    self.storage.write(Location::Host, true)
  }

  pub(crate) fn read(&self, location: Location) -> Values {
    self.storage.read(location)
  }

  pub(crate) fn write(&self, location: Location, overwrite: bool) -> ValuesMut {
    self.storage.write(location, overwrite)
  }

  pub fn get(&self, w: usize, h: usize, d: usize, n: usize) -> f32 {
    self.values()[self.shape.index(w, h, d, n)]
  }

  pub fn set(&self, value: f32, w: usize, h: usize, d: usize, n: usize) {
    self.values_mut()[self.shape.index(w, h, d, n)] = value;
  }

  pub fn to_vec(&self) -> Vec<f32> {
    self.values().to_vec()
  }

  /// Copy shape and values into `target`, reusing its storage.

  pub fn copy_to(&self, target: &mut Tensor) {
    target.resize(self.shape);
    let values = self.values();
    target.overwrite().copy_from_slice(&values);
  }

  pub fn approx_eq(&self, other: &Self, tolerance: f32) -> bool {
    if self.shape != other.shape { return false }
    self.values().iter()
      .zip(other.values().iter())
      .all(|(a, b)| (a - b).abs() <= tolerance * (1.0 + a.abs().max(b.abs())) )
  }

  pub fn matmul(&self, rhs: &Self) -> Self {
    let mut out = Self::new(self.shape);
    Cpu.matmul(false, false, self, rhs, &mut out);
    out
  }

  pub fn transposed(&self) -> Self {
    let mut out = Self::new(self.shape);
    Cpu.transpose(self, &mut out);
    out
  }

  pub fn sum_over(&self, axes: &[Axis]) -> Self {
    let mut out = Self::new(self.shape);
    Cpu.sum(self, axes, &mut out);
    out
  }

  pub fn mul_elem(&self, rhs: &Self) -> Self {
    let mut out = Self::new(self.shape);
    Cpu.mul_elem(self, rhs, &mut out);
    out
  }

  pub fn add(&self, rhs: &Self) -> Self {
    let mut out = Self::new(self.shape);
    Cpu.add(1.0, self, 1.0, rhs, &mut out);
    out
  }

  pub fn copy_to_host(&self) { self.storage.copy_to_host() }
  pub fn copy_to_device(&self) { self.storage.copy_to_device() }
  pub fn override_host(&self) { self.storage.override_host() }
  pub fn override_device(&self) { self.storage.override_device() }
  pub fn offload(&self) { self.storage.offload() }
  pub fn prefetch(&self) { self.storage.prefetch() }
  pub fn release(&self) { self.storage.release() }

  pub fn offload_event(&self) -> Event {
    self.storage.offload_event()
  }

  pub fn prefetch_event(&self) -> Event {
    self.storage.prefetch_event()
  }

  /// Reserve device memory for use as a scratch workspace.

  pub fn try_device_allocate(&self) {
    if self.storage.kind().contains(StorageType::DEVICE_REF_COUNTED) {
      self.storage.inc_device_ref(1);
    }
    self.storage.allocate_on_device();
  }

  /// Hand back a workspace reserved with [try_device_allocate](Self::try_device_allocate).

  pub fn try_device_release(&self) {
    if self.storage.kind().contains(StorageType::DEVICE_REF_COUNTED) {
      self.storage.dec_device_ref(1);
    } else {
      self.storage.free_on_device();
    }
  }
}

impl std::fmt::Display for Tensor {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    let values = self.values();
    let shown = values.iter().take(16).map(|v| format!("{v:.4}") ).collect::<Vec<_>>().join(", ");
    let more = if values.len() > 16 { ", ..." } else { "" };
    write!(f, "Tensor({}) [{shown}{more}]", self.shape)
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use rand::{ SeedableRng, rngs::StdRng };
  use crate::storage::DeviceConfig;

  #[test]
  fn from_vec() {
    let t = Tensor::from_vec(Shape::matrix(3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(t.get(2, 1, 0, 0), 6.0);
    t.set(9.0, 0, 1, 0, 0);
    assert_eq!(t.to_vec(), vec![1.0, 2.0, 3.0, 9.0, 5.0, 6.0]);
  }

  #[test]
  #[should_panic(expected = "doesn't match data length")]
  fn wrong_length() {
    Tensor::from_vec(Shape::vector(3), vec![1.0]);
  }

  #[test]
  fn resize_batch() {
    let mut t = Tensor::ones(Shape::new(2, 1, 1, 4));
    t.resize_batch(2);
    assert_eq!(t.len(), 4);
    assert_eq!(t.storage().capacity(), 8);
    assert_eq!(t.to_vec(), vec![1.0; 4]);
  }

  #[test]
  fn random() {
    let mut rng = StdRng::seed_from_u64(1);
    let t = Tensor::random_uniform(Shape::vector(100), -0.5, 0.5, &mut rng);
    assert!(t.values().iter().all(|v| (-0.5..0.5).contains(v) ));
    let n = Tensor::random_normal(Shape::vector(7), 3.0, 0.0, &mut rng);
    assert_eq!(n.to_vec(), vec![3.0; 7]);
  }

  #[test]
  fn math() {
    let a = Tensor::from_vec(Shape::matrix(2, 2), vec![1.0, 2.0, 3.0, 4.0]);
    let b = Tensor::from_vec(Shape::matrix(1, 2), vec![1.0, 1.0]);
    assert_eq!(a.matmul(&b).to_vec(), vec![3.0, 7.0]);
    assert_eq!(a.transposed().to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    assert_eq!(a.sum_over(&[Axis::Height]).to_vec(), vec![4.0, 6.0]);
    assert_eq!(a.mul_elem(&a).to_vec(), vec![1.0, 4.0, 9.0, 16.0]);
    assert_eq!(a.add(&Tensor::fill(Shape::vector(1), 1.0)).to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
  }

  #[test]
  fn device_roundtrip() {
    let device = Device::new(DeviceConfig::default());
    let t = Tensor::with_device(Shape::vector(3), StorageType::DEFAULT, &device);
    t.overwrite().copy_from_slice(&[1.0, 2.0, 3.0]);
    t.copy_to_device();
    assert_eq!(t.location(), Location::Device);
    t.write(Location::Device, false)[0] = 5.0;
    assert_eq!(t.to_vec(), vec![5.0, 2.0, 3.0]);
    assert_eq!(t.location(), Location::Host);
  }

  #[test]
  fn shared_workspace() {
    let device = Device::new(DeviceConfig::default());
    let t = Tensor::with_device(Shape::vector(4), StorageType::DEVICE_REF_COUNTED, &device);
    t.try_device_allocate();
    t.try_device_allocate();
    t.try_device_release();
    assert!(t.storage().is_allocated_on_device());
    t.try_device_release();
    assert!(!t.storage().is_allocated_on_device());
  }

  #[test]
  fn approx_eq() {
    let a = Tensor::fill(Shape::vector(2), 1.0);
    let b = Tensor::fill(Shape::vector(2), 1.0001);
    assert!(a.approx_eq(&b, 1e-3));
    assert!(!a.approx_eq(&b, 1e-6));
  }
}
