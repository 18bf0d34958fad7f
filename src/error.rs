use crate::shape::Shape;


/// Failures of checkpoint I/O.
///
/// Everything else in this crate treats broken invariants as programmer
/// errors and panics.

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] postcard::Error),

  /// Checkpoint names a variable the graph doesn't have.
  #[error("Unknown variable '{0}'")]
  UnknownVariable(String),

  #[error("Shape mismatch for '{name}': expected {expected}, got {got}")]
  ShapeMismatch {
    name: String,
    expected: Shape,
    got: Shape,
  },
}

pub type Result<T> = std::result::Result<T, Error>;
