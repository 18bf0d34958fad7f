//! Computation graphs over 4-D tensors with reverse-mode differentiation
//! and host/device memory residency.
//!
//! # Features
//!
//! - **Explicit graphs**: Nodes live in an index-based [Graph] arena. Building
//! an operation infers its output shape immediately and panics on incompatible
//! inputs, naming the operation.
//!
//! - **Pruned gradients**: [Session::compute_gradients] only visits nodes lying
//! on a path from a trainable variable to the loss. Frozen sub-networks cost nothing.
//!
//! - **Broadcasting**: Inputs of length 1 along an axis get broadcast, and
//! their gradients summed back over exactly the broadcast axes.
//!
//! - **Memory residency**: Every [Tensor] is backed by a [Storage] tracking
//! whether host or device memory holds its current values, with synchronous
//! copies, asynchronous offload and prefetch, and reference counted device memory.
//!
//! - **Interchangeable backends**: [Cpu](backend::Cpu), [MultiCpu](backend::MultiCpu)
//! and [Accelerator](backend::Accelerator) produce bit-identical results.
//!
//! - **Optimization**: Includes SGD, Momentum and ADAM, plus variable checkpoints.
//!
//! # Examples
//!
//! Fitting a small dense layer:
//! ```
//! use gradflow::{ Graph, Session, Shape, Tensor, Axis, optimize::{ Optimizer, Adam } };
//!
//! let mut graph = Graph::new();
//! let x = graph.placeholder(Shape::matrix(2, 1));
//! let w = graph.variable(Tensor::fill(Shape::matrix(8, 2), 0.1));
//! let b = graph.variable(Tensor::zeros(Shape::matrix(8, 1)));
//! let mm = graph.matmul(x, w);
//! let z = graph.add(mm, b);
//! let y = graph.tanh(z);
//! let sqr = graph.pow(y, 2.0);
//! let loss = graph.sum(sqr, &[Axis::Width]);
//!
//! let mut session = Session::default();
//! let mut optimizer = Optimizer::new(0.01, Adam::default());
//! let input = Tensor::from_vec(Shape::new(2, 1, 1, 2), vec![1.0, 2.0, -1.0, 0.5]);
//! let first = optimizer.minimize(&mut session, &mut graph, loss, &[(x, &input)]);
//! let mut last = first;
//! for _ in 0..100 {
//!   last = optimizer.minimize(&mut session, &mut graph, loss, &[(x, &input)]);
//! }
//! assert!(last < first);
//! ```
//!
//! # Optional features
//!
//! Some features can be toggled in your `Cargo.toml`.
//!
//! - `unsafe` *(default)*: Accelerated matrix math using [matrixmultiply] crate.
//! - `rayon` *(default)*: Multi-threaded kernels and the `MultiCpu` backend.

mod internal;
mod shape;
mod tensor;
mod error;
mod session;

pub mod storage;
pub mod backend;
pub mod graph;
pub mod optimize;

pub use shape::{ Shape, Axis };
pub use tensor::Tensor;
pub use storage::{ Storage, StorageType, Location, Device, DeviceConfig, Event, MemoryStats };
pub use backend::Backend;
pub use graph::{ Graph, NodeId, NodeKind, Node, NodeStats, Op };
pub use session::Session;
pub use error::{ Error, Result };
