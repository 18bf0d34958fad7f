use std::sync::Arc;
use std::sync::mpsc::{ channel, Sender };
use std::sync::OnceLock;
use std::thread::JoinHandle;
use std::time::Duration;

use log::trace;
use parking_lot::{ Condvar, Mutex, RwLock };


pub(crate) type Buffer = Arc<RwLock<Vec<f32>>>;

pub(crate) fn buffer(len: usize) -> Buffer {
  Arc::new(RwLock::new(vec![0.0; len]))
}


/// Completion token of an asynchronous transfer.
///
/// Tokens start out signalled. Recording a transfer against a token marks it
/// pending until the transfer stream signals completion.

#[derive(Debug, Clone)]
pub struct Event {
  state: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for Event {
  fn default() -> Self {
    Self::new()
  }
}

impl Event {
  pub fn new() -> Self {
    Self { state: Arc::new((Mutex::new(true), Condvar::new())) }
  }

  pub(crate) fn record(&self) {
    *self.state.0.lock() = false;
  }

  pub(crate) fn signal(&self) {
    let (done, cond) = &*self.state;
    *done.lock() = true;
    cond.notify_all();
  }

  /// Non-blocking check whether the last recorded transfer has completed.

  pub fn query(&self) -> bool {
    *self.state.0.lock()
  }

  pub fn wait(&self) {
    let (done, cond) = &*self.state;
    let mut done = done.lock();
    while !*done {
      cond.wait(&mut done);
    }
  }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
  HostToDevice,
  DeviceToHost,
}

struct Transfer {
  src: Buffer,
  dst: Buffer,
  len: usize,
  event: Event,
  direction: Direction,
  name: String,
}


/// Settings for a simulated accelerator.

#[derive(Debug, Clone)]
pub struct DeviceConfig {
  pub name: String,
  /// Artificial delay applied to every asynchronous transfer.
  pub transfer_latency: Duration,
  /// Device memory limit in bytes. Exceeding it is fatal.
  pub capacity: Option<usize>,
}

impl Default for DeviceConfig {
  fn default() -> Self {
    Self {
      name: "accelerator:0".to_string(),
      transfer_latency: Duration::ZERO,
      capacity: None,
    }
  }
}


/// Allocation and transfer counters of a [Device].

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
  pub device_bytes: usize,
  pub peak_device_bytes: usize,
  pub allocations: usize,
  pub releases: usize,
  pub async_transfers: usize,
  pub sync_copies: usize,
}


/// Accelerator memory with its own address space and a single
/// asynchronous transfer stream.
///
/// Device memory lives in separate buffers, transfers are executed in
/// submission order by a background worker and signal an [Event] on
/// completion. Cloning a device yields another handle to the same one.

#[derive(Debug, Clone)]
pub struct Device {
  inner: Arc<DeviceInner>,
}

#[derive(Debug)]
struct DeviceInner {
  config: DeviceConfig,
  stream: Mutex<Option<Sender<Transfer>>>,
  worker: Mutex<Option<JoinHandle<()>>>,
  stats: Mutex<MemoryStats>,
}

impl std::fmt::Debug for Transfer {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Transfer({:?} '{}' {})", self.direction, self.name, self.len)
  }
}

impl Drop for DeviceInner {
  fn drop(&mut self) {
    // Closing the stream lets the worker drain and exit
    self.stream.get_mut().take();
    if let Some(worker) = self.worker.get_mut().take() {
      let _ = worker.join();
    }
  }
}

impl Device {
  pub fn new(config: DeviceConfig) -> Self {
    let (sender, receiver) = channel::<Transfer>();
    let latency = config.transfer_latency;
    let worker = std::thread::Builder::new()
      .name(format!("{}-stream", config.name))
      .spawn(move || {
        for transfer in receiver {
          if !latency.is_zero() {
            std::thread::sleep(latency);
          }
          {
            let src = transfer.src.read();
            let mut dst = transfer.dst.write();
            dst[..transfer.len].copy_from_slice(&src[..transfer.len]);
          }
          trace!("{:?} completed", transfer);
          transfer.event.signal();
        }
      })
      .unwrap_or_else(|err| panic!("Could not start transfer stream of '{}': {err}", config.name));
    Self {
      inner: Arc::new(DeviceInner {
        config,
        stream: Mutex::new(Some(sender)),
        worker: Mutex::new(Some(worker)),
        stats: Mutex::new(MemoryStats::default()),
      }),
    }
  }

  /// Process-wide device used by storage that isn't given one explicitly.

  pub fn shared() -> Self {
    static DEFAULT: OnceLock<Device> = OnceLock::new();
    DEFAULT.get_or_init(|| Device::new(DeviceConfig::default()) ).clone()
  }

  pub fn name(&self) -> &str {
    &self.inner.config.name
  }

  pub fn stats(&self) -> MemoryStats {
    *self.inner.stats.lock()
  }

  pub fn same(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  pub(crate) fn allocate(&self, len: usize, name: &str) -> DeviceAllocation {
    let bytes = len * std::mem::size_of::<f32>();
    {
      let mut stats = self.inner.stats.lock();
      if let Some(capacity) = self.inner.config.capacity {
        assert!(stats.device_bytes + bytes <= capacity,
          "Out of device memory on '{}' while allocating {} bytes for '{}' ({} of {} in use)",
          self.name(), bytes, name, stats.device_bytes, capacity);
      }
      stats.device_bytes += bytes;
      stats.peak_device_bytes = stats.peak_device_bytes.max(stats.device_bytes);
      stats.allocations += 1;
    }
    trace!("Allocated {} bytes on '{}' for '{}'", bytes, self.name(), name);
    DeviceAllocation {
      buffer: buffer(len),
      bytes,
      device: self.clone(),
    }
  }

  /// Queue an asynchronous copy. `event` gets recorded here and signalled
  /// by the stream once the copy has landed.

  pub(crate) fn submit(&self, direction: Direction, src: &Buffer, dst: &Buffer, len: usize, event: &Event, name: &str) {
    event.record();
    let transfer = Transfer {
      src: src.clone(),
      dst: dst.clone(),
      len,
      event: event.clone(),
      direction,
      name: name.to_string(),
    };
    let stream = self.inner.stream.lock();
    let sent = stream.as_ref().map(|stream| stream.send(transfer) );
    if !matches!(sent, Some(Ok(()))) {
      event.signal();
      panic!("Transfer stream of '{}' is gone, could not copy '{}'", self.name(), name);
    }
    self.inner.stats.lock().async_transfers += 1;
  }

  /// Blocking copy on the calling thread.

  pub(crate) fn copy(&self, src: &Buffer, dst: &Buffer, len: usize) {
    let src = src.read();
    let mut dst = dst.write();
    dst[..len].copy_from_slice(&src[..len]);
    self.inner.stats.lock().sync_copies += 1;
  }
}


/// Device memory owned by a single [Storage](crate::Storage).
/// Its bytes are handed back to the device when dropped.

#[derive(Debug)]
pub(crate) struct DeviceAllocation {
  pub(crate) buffer: Buffer,
  bytes: usize,
  device: Device,
}

impl Drop for DeviceAllocation {
  fn drop(&mut self) {
    let mut stats = self.device.inner.stats.lock();
    stats.device_bytes -= self.bytes;
    stats.releases += 1;
  }
}
