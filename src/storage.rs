use std::ops::{ Deref, DerefMut };

use log::trace;
use parking_lot::{ Mutex, RawRwLock, RwLock };
use parking_lot::lock_api::{ ArcRwLockReadGuard, ArcRwLockWriteGuard };

mod device;

pub use device::{ Device, DeviceConfig, Event, MemoryStats };

use device::{ Buffer, DeviceAllocation, Direction };


/// Bit set describing how a [Storage] may use device memory.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StorageType(u8);

impl StorageType {
  pub const DEFAULT: Self = Self(0);
  /// Supports asynchronous [offload](Storage::offload) and [prefetch](Storage::prefetch).
  pub const OFFLOADABLE: Self = Self(1);
  /// Device memory is shared and freed once its reference count drops to zero.
  pub const DEVICE_REF_COUNTED: Self = Self(1 << 1);
  /// Device memory is never freed once allocated.
  pub const KEEP_DEVICE_MEMORY: Self = Self(1 << 2);

  pub fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }
}

impl std::ops::BitOr for StorageType {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}


/// Memory space holding the authoritative copy of a [Storage]'s values.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
  None,
  Host,
  Device,
}


/// Read access to a storage buffer.

pub struct Values {
  guard: ArcRwLockReadGuard<RawRwLock, Vec<f32>>,
  len: usize,
}

impl Deref for Values {
  type Target = [f32];

  fn deref(&self) -> &[f32] {
    &self.guard[..self.len]
  }
}


/// Write access to a storage buffer.

pub struct ValuesMut {
  guard: ArcRwLockWriteGuard<RawRwLock, Vec<f32>>,
  len: usize,
}

impl Deref for ValuesMut {
  type Target = [f32];

  fn deref(&self) -> &[f32] {
    &self.guard[..self.len]
  }
}

impl DerefMut for ValuesMut {
  fn deref_mut(&mut self) -> &mut [f32] {
    &mut self.guard[..self.len]
  }
}


#[derive(Debug)]
struct State {
  capacity: usize,
  len: usize,
  location: Location,
  host: Option<Buffer>,
  device: Option<DeviceAllocation>,
  device_refs: usize,
  offload_event: Event,
  prefetch_event: Event,
  // Write counter and the write each buffer currently reflects
  version: u64,
  host_version: Option<u64>,
  device_version: Option<u64>,
  async_transfers: usize,
  sync_copies: usize,
}

impl State {
  fn wait_for_offload(&self, name: &str) {
    if !self.offload_event.query() {
      trace!("Waiting for offload of '{}'", name);
    }
    self.offload_event.wait();
  }

  fn wait_for_prefetch(&self, name: &str) {
    if !self.prefetch_event.query() {
      trace!("Waiting for prefetch of '{}'", name);
    }
    self.prefetch_event.wait();
  }

  fn wait_for_transfers(&self, name: &str) {
    self.wait_for_offload(name);
    self.wait_for_prefetch(name);
  }

  fn bump(&mut self) -> Option<u64> {
    self.version += 1;
    Some(self.version)
  }
}


/// Owning buffer of a tensor's values, paired between host and device memory.
///
/// Exactly one memory space is authoritative at any time (see [Location]).
/// The other copy may exist physically, but is only trusted after an explicit
/// synchronization. Asynchronous transfers are tracked by one completion
/// [Event] per direction, and every access that could observe or clobber an
/// in-flight transfer waits on it first.
///
/// All mutation of location, reference count and buffers goes through the
/// methods of this type. Violated invariants are fatal.

#[derive(Debug)]
pub struct Storage {
  kind: StorageType,
  name: String,
  device: Device,
  state: Mutex<State>,
}

impl Storage {
  pub fn new(kind: StorageType, len: usize, name: &str) -> Self {
    Self::with_device(kind, len, name, &Device::shared())
  }

  pub fn with_device(kind: StorageType, len: usize, name: &str, device: &Device) -> Self {
    Self {
      kind,
      name: name.to_string(),
      device: device.clone(),
      state: Mutex::new(State {
        capacity: len,
        len,
        location: Location::None,
        host: None,
        device: None,
        device_refs: 0,
        offload_event: Event::new(),
        prefetch_event: Event::new(),
        version: 0,
        host_version: None,
        device_version: None,
        async_transfers: 0,
        sync_copies: 0,
      }),
    }
  }

  pub fn kind(&self) -> StorageType {
    self.kind
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn set_name(&mut self, name: &str) {
    self.name = name.to_string();
  }

  pub fn device(&self) -> &Device {
    &self.device
  }

  pub fn len(&self) -> usize {
    self.state.lock().len
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.state.lock().capacity
  }

  pub fn location(&self) -> Location {
    self.state.lock().location
  }

  pub fn device_refs(&self) -> usize {
    self.state.lock().device_refs
  }

  pub fn is_allocated_on_host(&self) -> bool {
    self.state.lock().host.is_some()
  }

  pub fn is_allocated_on_device(&self) -> bool {
    self.state.lock().device.is_some()
  }

  /// Number of asynchronous transfers this storage has issued.

  pub fn async_transfers(&self) -> usize {
    self.state.lock().async_transfers
  }

  /// Number of blocking copies this storage has performed.

  pub fn sync_copies(&self) -> usize {
    self.state.lock().sync_copies
  }

  pub fn offload_event(&self) -> Event {
    self.state.lock().offload_event.clone()
  }

  pub fn prefetch_event(&self) -> Event {
    self.state.lock().prefetch_event.clone()
  }

  pub fn change_type(&mut self, kind: StorageType) {
    if self.kind == kind { return }
    let st = self.state.get_mut();
    assert!(st.host.is_none() && st.device.is_none(),
      "Changing type of allocated storage '{}' is not allowed", self.name);
    self.kind = kind;
  }

  /// Set the logical length. Buffers only get reallocated when `len`
  /// exceeds the current capacity, in which case their contents are lost.

  pub fn resize(&self, len: usize) {
    let mut st = self.state.lock();
    if len <= st.capacity {
      st.len = len;
      return
    }
    trace!("Growing '{}' from {} to {}", self.name, st.capacity, len);
    st.wait_for_transfers(&self.name);
    st.capacity = len;
    st.len = len;
    st.host_version = None;
    st.device_version = None;
    let had_device = st.device.take().is_some();
    if st.host.is_some() {
      st.host = Some(device::buffer(len));
      st.location = Location::Host;
      st.host_version = st.bump();
    }
    if had_device {
      self.allocate_on_device_locked(&mut st);
    }
  }

  /// Free host and device memory unconditionally.

  pub fn release(&self) {
    let mut st = self.state.lock();
    st.wait_for_transfers(&self.name);
    trace!("Releasing '{}'", self.name);
    st.device = None;
    st.host = None;
    st.location = Location::None;
    st.device_refs = 0;
    st.host_version = None;
    st.device_version = None;
  }

  pub fn allocate_on_host(&self) {
    let mut st = self.state.lock();
    self.allocate_on_host_locked(&mut st);
  }

  fn allocate_on_host_locked(&self, st: &mut State) {
    assert!(st.device.is_none(), "Data of '{}' cannot be only on device", self.name);
    if st.host.is_some() {
      trace!("Allocating '{}' on host <<< already allocated", self.name);
      return
    }
    trace!("Allocating '{}' on host <<< allocating {}", self.name, st.capacity);
    st.host = Some(device::buffer(st.capacity));
    st.location = Location::Host;
    st.host_version = st.bump();
  }

  pub fn free_on_host(&self) {
    let mut st = self.state.lock();
    assert!(st.device.is_none(), "Data of '{}' cannot be only on device", self.name);
    if st.host.is_none() {
      trace!("Releasing '{}' on host <<< not allocated", self.name);
      return
    }
    trace!("Releasing '{}' on host", self.name);
    st.wait_for_transfers(&self.name);
    st.host = None;
    st.location = Location::None;
    st.host_version = None;
  }

  /// Allocate device memory, allocating on host first if needed.

  pub fn allocate_on_device(&self) {
    let mut st = self.state.lock();
    self.allocate_on_device_locked(&mut st);
  }

  fn allocate_on_device_locked(&self, st: &mut State) {
    if st.capacity == 0 { return }
    if st.host.is_none() {
      self.allocate_on_host_locked(st);
    }
    if st.device.is_some() {
      trace!("Allocating '{}' on device <<< already allocated", self.name);
      return
    }
    trace!("Allocating '{}' on device <<< allocating {}", self.name, st.capacity);
    st.device = Some(self.device.allocate(st.capacity, &self.name));
    st.device_version = None;
  }

  /// Free device memory. Refused for [StorageType::KEEP_DEVICE_MEMORY].
  ///
  /// Waits for in-flight transfers and brings the host copy up to date
  /// first when the device held the authoritative values.

  pub fn free_on_device(&self) {
    let mut st = self.state.lock();
    self.free_on_device_locked(&mut st);
  }

  fn free_on_device_locked(&self, st: &mut State) {
    if st.device.is_none() {
      trace!("Releasing '{}' on device <<< not allocated", self.name);
      return
    }
    if self.kind.contains(StorageType::KEEP_DEVICE_MEMORY) {
      trace!("Releasing '{}' on device <<< not allowed", self.name);
      return
    }
    trace!("Releasing '{}' on device <<< release incoming", self.name);
    st.wait_for_transfers(&self.name);
    if st.location == Location::Device && st.host_version != st.device_version {
      self.copy_locked(st, Direction::DeviceToHost);
    }
    st.device = None;
    st.device_version = None;
    if st.host.is_some() {
      st.location = Location::Host;
    }
  }

  /// Start an asynchronous device to host copy. A no-op for storage that
  /// isn't [offloadable](StorageType::OFFLOADABLE), when the host copy is
  /// already current, or while an earlier offload is still in flight.

  pub fn offload(&self) {
    let mut st = self.state.lock();
    if st.capacity == 0 { return }
    assert!(st.host.is_some(), "Attempting to offload '{}' to deallocated host storage", self.name);
    if !self.kind.contains(StorageType::OFFLOADABLE) {
      trace!("Offloading '{}' <<< not supported", self.name);
      return
    }
    if st.device.is_none() || st.location != Location::Device {
      trace!("Offloading '{}' <<< nothing to offload", self.name);
      return
    }
    if !st.offload_event.query() {
      trace!("Offloading '{}' <<< requested already", self.name);
      return
    }
    if st.host_version == st.device_version {
      trace!("Offloading '{}' <<< host copy is current", self.name);
      return
    }
    trace!("Offloading '{}' <<< requested", self.name);
    st.wait_for_prefetch(&self.name);
    self.submit_locked(&mut st, Direction::DeviceToHost);
  }

  /// Start an asynchronous host to device copy, allocating device memory
  /// if needed. Same no-op rules as [offload](Self::offload).

  pub fn prefetch(&self) {
    let mut st = self.state.lock();
    if st.capacity == 0 { return }
    if !self.kind.contains(StorageType::OFFLOADABLE) {
      trace!("Prefetching '{}' <<< not supported", self.name);
      return
    }
    assert!(st.host.is_some(), "Attempting to prefetch '{}' from deallocated host storage", self.name);
    if st.device.is_none() {
      self.allocate_on_device_locked(&mut st);
    }
    if st.location != Location::Host {
      trace!("Prefetching '{}' <<< device copy is authoritative", self.name);
      return
    }
    if !st.prefetch_event.query() {
      trace!("Prefetching '{}' <<< requested already", self.name);
      return
    }
    if st.host_version == st.device_version {
      trace!("Prefetching '{}' <<< device copy is current", self.name);
      return
    }
    trace!("Prefetching '{}' <<< requested", self.name);
    st.wait_for_offload(&self.name);
    self.submit_locked(&mut st, Direction::HostToDevice);
  }

  fn submit_locked(&self, st: &mut State, direction: Direction) {
    let (host, device) = Self::buffers(st, &self.name);
    let len = st.len;
    match direction {
      Direction::HostToDevice => {
        self.device.submit(direction, &host, &device, len, &st.prefetch_event, &self.name);
        st.device_version = st.host_version;
      },
      Direction::DeviceToHost => {
        self.device.submit(direction, &device, &host, len, &st.offload_event, &self.name);
        st.host_version = st.device_version;
      },
    }
    st.async_transfers += 1;
  }

  fn copy_locked(&self, st: &mut State, direction: Direction) {
    let (host, device) = Self::buffers(st, &self.name);
    let len = st.len;
    match direction {
      Direction::HostToDevice => {
        self.device.copy(&host, &device, len);
        st.device_version = st.host_version;
      },
      Direction::DeviceToHost => {
        self.device.copy(&device, &host, len);
        st.host_version = st.device_version;
      },
    }
    st.sync_copies += 1;
  }

  fn buffers(st: &State, name: &str) -> (Buffer, Buffer) {
    let host = st.host.clone()
      .unwrap_or_else(|| panic!("Host memory of '{}' is not allocated", name) );
    let device = st.device.as_ref()
      .map(|alloc| alloc.buffer.clone() )
      .unwrap_or_else(|| panic!("Device memory of '{}' is not allocated", name) );
    (host, device)
  }

  /// Make the device copy authoritative. Blocks on in-flight transfers.

  pub fn copy_to_device(&self) {
    let mut st = self.state.lock();
    if st.location == Location::Device { return }
    assert!(st.location == Location::Host,
      "Attempting to copy '{}' from unallocated host memory to device", self.name);
    if st.capacity == 0 { return }
    self.allocate_on_device_locked(&mut st);
    st.wait_for_transfers(&self.name);
    if st.device_version != st.host_version {
      trace!("Copy '{}' to device", self.name);
      self.copy_locked(&mut st, Direction::HostToDevice);
    } else {
      trace!("Copy '{}' to device <<< device copy is current", self.name);
    }
    st.location = Location::Device;
  }

  /// Make the host copy authoritative. Blocks on in-flight transfers.

  pub fn copy_to_host(&self) {
    let mut st = self.state.lock();
    if st.location == Location::Host { return }
    assert!(st.location != Location::None,
      "Attempting to copy '{}' to unallocated host memory", self.name);
    st.wait_for_transfers(&self.name);
    if st.host_version != st.device_version {
      trace!("Copy '{}' to host", self.name);
      self.copy_locked(&mut st, Direction::DeviceToHost);
    } else {
      trace!("Copy '{}' to host <<< host copy is current", self.name);
    }
    st.location = Location::Host;
  }

  /// Mark the host copy authoritative without copying. The caller is
  /// expected to overwrite all values.

  pub fn override_host(&self) {
    let mut st = self.state.lock();
    self.override_host_locked(&mut st);
  }

  fn override_host_locked(&self, st: &mut State) {
    if st.host.is_none() {
      self.allocate_on_host_locked(st);
    }
    st.wait_for_transfers(&self.name);
    st.location = Location::Host;
    st.host_version = st.bump();
    trace!("Override host '{}'", self.name);
  }

  /// Mark the device copy authoritative without copying.

  pub fn override_device(&self) {
    let mut st = self.state.lock();
    self.override_device_locked(&mut st);
  }

  fn override_device_locked(&self, st: &mut State) {
    self.allocate_on_device_locked(st);
    st.wait_for_transfers(&self.name);
    st.location = Location::Device;
    st.device_version = st.bump();
    trace!("Override device '{}'", self.name);
  }

  pub fn inc_device_ref(&self, n: usize) {
    assert!(self.kind.contains(StorageType::DEVICE_REF_COUNTED),
      "Increasing ref count of non-refcounted storage '{}'", self.name);
    self.state.lock().device_refs += n;
  }

  /// Drop `n` device references. The device allocation is freed when the
  /// count reaches zero.

  pub fn dec_device_ref(&self, n: usize) {
    assert!(self.kind.contains(StorageType::DEVICE_REF_COUNTED),
      "Decreasing ref count of non-refcounted storage '{}'", self.name);
    let mut st = self.state.lock();
    assert!(n <= st.device_refs,
      "Over-decreasing ref count of '{}' ({} by {})", self.name, st.device_refs, n);
    st.device_refs -= n;
    if st.device_refs == 0 {
      trace!("Ref count of '{}' zeroed <<< deallocating device memory", self.name);
      self.free_on_device_locked(&mut st);
    }
  }

  /// Read the host copy, allocating it on first use.

  pub fn host(&self) -> Values {
    let mut st = self.state.lock();
    if st.host.is_none() {
      self.allocate_on_host_locked(&mut st);
    }
    assert!(st.location == Location::Host,
      "Attempting to read host memory of '{}' while its values are on {:?}", self.name, st.location);
    st.wait_for_offload(&self.name);
    Values { guard: Self::read_buffer(st.host.clone(), &self.name), len: st.len }
  }

  pub fn host_mut(&self) -> ValuesMut {
    let mut st = self.state.lock();
    if st.host.is_none() {
      self.allocate_on_host_locked(&mut st);
    }
    assert!(st.location == Location::Host,
      "Attempting to write host memory of '{}' while its values are on {:?}", self.name, st.location);
    st.wait_for_transfers(&self.name);
    st.host_version = st.bump();
    ValuesMut { guard: Self::write_buffer(st.host.clone(), &self.name), len: st.len }
  }

  pub fn device_data(&self) -> Values {
    let st = self.state.lock();
    assert!(st.device.is_some(), "Attempting to read unallocated device memory of '{}'", self.name);
    assert!(st.location == Location::Device,
      "Attempting to read device memory of '{}' while its values are on {:?}", self.name, st.location);
    st.wait_for_prefetch(&self.name);
    let device = st.device.as_ref().map(|alloc| alloc.buffer.clone() );
    Values { guard: Self::read_buffer(device, &self.name), len: st.len }
  }

  pub fn device_data_mut(&self) -> ValuesMut {
    let mut st = self.state.lock();
    assert!(st.device.is_some(), "Attempting to write to unallocated device memory of '{}'", self.name);
    assert!(st.location == Location::Device,
      "Attempting to write to device memory of '{}' while its values are on {:?}", self.name, st.location);
    st.wait_for_transfers(&self.name);
    st.device_version = st.bump();
    let device = st.device.as_ref().map(|alloc| alloc.buffer.clone() );
    ValuesMut { guard: Self::write_buffer(device, &self.name), len: st.len }
  }

  fn read_buffer(buffer: Option<Buffer>, name: &str) -> ArcRwLockReadGuard<RawRwLock, Vec<f32>> {
    let buffer = buffer.unwrap_or_else(|| panic!("Storage '{}' is not allocated", name) );
    RwLock::read_arc(&buffer)
  }

  fn write_buffer(buffer: Option<Buffer>, name: &str) -> ArcRwLockWriteGuard<RawRwLock, Vec<f32>> {
    let buffer = buffer.unwrap_or_else(|| panic!("Storage '{}' is not allocated", name) );
    RwLock::write_arc(&buffer)
  }

  /// Synchronize to `location` and read from there.

  pub fn read(&self, location: Location) -> Values {
    self.ensure_allocated();
    match location {
      Location::Device if self.capacity() > 0 => {
        self.copy_to_device();
        self.device_data()
      },
      _ => {
        self.copy_to_host();
        self.host()
      },
    }
  }

  /// Make `location` authoritative and write there. With `overwrite` set
  /// the previous contents are not transferred.

  pub fn write(&self, location: Location, overwrite: bool) -> ValuesMut {
    self.ensure_allocated();
    match location {
      Location::Device if self.capacity() > 0 => {
        if overwrite { self.override_device() } else { self.copy_to_device() }
        self.device_data_mut()
      },
      _ => {
        if overwrite { self.override_host() } else { self.copy_to_host() }
        self.host_mut()
      },
    }
  }

  fn ensure_allocated(&self) {
    let mut st = self.state.lock();
    if st.location == Location::None {
      self.allocate_on_host_locked(&mut st);
    }
  }

  /// Block until no transfer is in flight.

  pub fn synchronize(&self) {
    self.state.lock().wait_for_transfers(&self.name);
  }
}

impl Clone for Storage {
  /// Deep copy that lands on host, with no device references.

  fn clone(&self) -> Self {
    let st = self.state.lock();
    let out = Self::with_device(self.kind, st.capacity, &self.name, &self.device);
    out.resize(st.len);
    if st.location != Location::None {
      st.wait_for_transfers(&self.name);
      let source = match st.location {
        Location::Device => st.device.as_ref().map(|alloc| alloc.buffer.clone() ),
        _ => st.host.clone(),
      };
      let source = Self::read_buffer(source, &self.name);
      out.host_mut().copy_from_slice(&source[..st.len]);
    }
    out
  }
}

impl Drop for Storage {
  fn drop(&mut self) {
    // Transfers may still reference our buffers
    self.state.get_mut().wait_for_transfers(&self.name);
  }
}
