#![allow(clippy::missing_safety_doc)]

//! Arena allocator over a single caller-supplied buffer.
//!
//! The buffer is split into 8-byte chunks. Allocations are runs of whole
//! chunks carrying a 4-byte `{length, state}` header; free runs additionally
//! carry 16-bit links into a doubly linked free list threaded through the
//! arena itself, so the pool needs no storage outside the buffer.
//!
//! ```rust
//! use chunkpool::{Allocator, PoolAllocator};
//!
//! let mut buffer = vec![0u8; 4096];
//! let mut pool = PoolAllocator::new(&mut buffer).unwrap();
//!
//! let ptr = pool.allocate(100).unwrap();
//! let ptr = unsafe { pool.resize(Some(ptr), 400) }.unwrap();
//! unsafe { pool.release(Some(ptr)) };
//! ```
//!
//! [`PoolAllocator`] and [`SystemAllocator`] both implement [`Allocator`], so
//! consumers such as [`BlockPool`] can be handed either one as `&mut dyn Allocator`.
//!
//! Pointers are only guaranteed byte alignment; the pool is meant for plain
//! data. It is not thread-safe.

mod allocator;
mod block_pool;
pub mod chunk;
mod error;
mod pool;

pub use allocator::{Allocator, SystemAllocator, live_allocations};
pub use block_pool::BlockPool;
pub use error::PoolError;
pub use pool::{PoolAllocator, PoolStats};
