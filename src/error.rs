use thiserror::Error;

/// Errors reported by the pool and block-pool allocators.
///
/// The [`Allocator`](crate::Allocator) interface itself reports failure as `None`;
/// these are the typed forms behind it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  /// The supplied buffer cannot hold the control header plus one chunk.
  #[error("buffer too small: {size} bytes, need at least {min}")]
  BufferTooSmall {
    /// Length of the supplied buffer.
    size: usize,
    /// Minimum viable arena size.
    min: usize,
  },

  /// No free run is large enough, even after coalescing.
  #[error("out of memory: no free run can hold {requested} bytes")]
  OutOfMemory {
    /// Requested payload size in bytes.
    requested: usize,
  },

  /// A block pool was asked to grow by zero blocks.
  #[error("grow size must be at least one block")]
  InvalidGrowSize,

  /// An arena invariant does not hold.
  #[error("arena corrupted: {0}")]
  Corrupted(String),
}
