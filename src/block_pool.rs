//! Uniform-size block pool layered over any [`Allocator`].
//!
//! Blocks are bumped out of buffers requested from the parent `grow_size`
//! blocks at a time. Released blocks go on an intrusive stack and are handed
//! out first. The pool never shrinks; [`BlockPool::clear`] or dropping it
//! returns every buffer to the parent.
//!
//! ```text
//!   buffers ─▶ ┌──────┬─────────┬─────────┬─────────┐
//!              │ next │ block 0 │ block 1 │ block 2 │ ─▶ older buffer ─▶ ...
//!              └──────┴─────────┴─────────┴─────────┘
//! ```

use core::{mem::size_of, ptr, ptr::NonNull};

use crate::{allocator::Allocator, error::PoolError};

/// Link stored at the front of every buffer and every released block.
const LINK_SIZE: usize = size_of::<*mut u8>();

/// Links may sit at any byte offset: parents only promise byte alignment.
#[inline]
unsafe fn read_link(at: *const u8) -> *mut u8 {
  unsafe { ptr::read_unaligned(at.cast::<*mut u8>()) }
}

#[inline]
unsafe fn write_link(at: *mut u8, link: *mut u8) {
  unsafe { ptr::write_unaligned(at.cast::<*mut u8>(), link) }
}

pub struct BlockPool<'a> {
  parent: &'a mut dyn Allocator,
  /// Most recently released block.
  free: *mut u8,
  /// Newest buffer.
  buffers: *mut u8,
  /// Blocks bumped out of the newest buffer.
  bumped: usize,
  block_size: usize,
  grow_size: usize,
  buffer_count: usize,
}

impl<'a> BlockPool<'a> {
  /// Creates an empty pool. No memory is requested until the first [`alloc`](Self::alloc).
  ///
  /// `block_size` is raised to at least one pointer so a released block can hold its link.
  pub fn new(
    parent: &'a mut dyn Allocator,
    block_size: usize,
    grow_size: usize,
  ) -> Result<Self, PoolError> {
    if grow_size == 0 {
      return Err(PoolError::InvalidGrowSize);
    }

    Ok(Self {
      parent,
      free: ptr::null_mut(),
      buffers: ptr::null_mut(),
      bumped: grow_size,
      block_size: block_size.max(LINK_SIZE),
      grow_size,
      buffer_count: 0,
    })
  }

  #[inline]
  pub fn block_size(&self) -> usize {
    self.block_size
  }

  #[inline]
  pub fn grow_size(&self) -> usize {
    self.grow_size
  }

  /// Buffers currently held from the parent.
  #[inline]
  pub fn buffer_count(&self) -> usize {
    self.buffer_count
  }

  /// Hands out one block, growing from the parent when the newest buffer is used up.
  pub fn alloc(&mut self) -> Option<NonNull<u8>> {
    if let Some(block) = NonNull::new(self.free) {
      self.free = unsafe { read_link(block.as_ptr()) };
      return Some(block);
    }

    if self.bumped >= self.grow_size {
      self.grow()?;
    }

    let offset = LINK_SIZE + self.block_size * self.bumped;
    self.bumped += 1;
    NonNull::new(unsafe { self.buffers.add(offset) })
  }

  /// Returns a block to the pool.
  ///
  /// # Safety
  ///
  /// `block` must come from this pool's [`alloc`](Self::alloc) and not have been freed since.
  pub unsafe fn free(&mut self, block: NonNull<u8>) {
    unsafe { write_link(block.as_ptr(), self.free) };
    self.free = block.as_ptr();
  }

  /// Returns every buffer to the parent. All outstanding blocks become dangling.
  pub fn clear(&mut self) {
    let mut buffer = self.buffers;
    while let Some(current) = NonNull::new(buffer) {
      buffer = unsafe { read_link(current.as_ptr()) };
      unsafe { self.parent.release(Some(current)) };
    }

    self.buffers = ptr::null_mut();
    self.free = ptr::null_mut();
    self.bumped = self.grow_size;
    self.buffer_count = 0;
  }

  fn grow(&mut self) -> Option<()> {
    let bytes = self
      .block_size
      .checked_mul(self.grow_size)
      .and_then(|blocks| blocks.checked_add(LINK_SIZE))?;

    let Some(buffer) = self.parent.allocate(bytes) else {
      tracing::debug!(bytes, "block pool parent out of memory");
      return None;
    };

    unsafe { write_link(buffer.as_ptr(), self.buffers) };
    self.buffers = buffer.as_ptr();
    self.bumped = 0;
    self.buffer_count += 1;

    tracing::trace!(bytes, buffers = self.buffer_count, "block pool grew");
    Some(())
  }
}

impl Drop for BlockPool<'_> {
  fn drop(&mut self) {
    self.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    allocator::SystemAllocator,
    chunk::{CHUNK_SIZE, CONTROL_HEADER_SIZE},
    pool::PoolAllocator,
  };

  fn arena(chunks: usize) -> Vec<u8> {
    vec![0; CONTROL_HEADER_SIZE + chunks * CHUNK_SIZE]
  }

  #[test]
  fn test_blocks_are_disjoint_and_grow() {
    let mut buffer = arena(128);
    let mut parent = PoolAllocator::new(&mut buffer).unwrap();
    let mut blocks = BlockPool::new(&mut parent, 16, 4).unwrap();

    let ptrs: Vec<_> = (0..10).map(|_| blocks.alloc().unwrap()).collect();
    assert_eq!(blocks.buffer_count(), 3);

    for (i, ptr) in ptrs.iter().enumerate() {
      unsafe { ptr.as_ptr().write_bytes(i as u8, 16) };
    }
    for (i, ptr) in ptrs.iter().enumerate() {
      let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 16) };
      assert!(bytes.iter().all(|&b| b == i as u8));
    }
  }

  #[test]
  fn test_free_block_is_reused_first() {
    let mut system = SystemAllocator;
    let mut blocks = BlockPool::new(&mut system, 32, 8).unwrap();

    let a = blocks.alloc().unwrap();
    let b = blocks.alloc().unwrap();
    unsafe {
      blocks.free(a);
      blocks.free(b);
    }
    assert_eq!(blocks.alloc(), Some(b));
    assert_eq!(blocks.alloc(), Some(a));
    assert_eq!(blocks.buffer_count(), 1);
  }

  #[test]
  fn test_block_size_holds_a_link() {
    let mut system = SystemAllocator;
    let blocks = BlockPool::new(&mut system, 1, 8).unwrap();
    assert_eq!(blocks.block_size(), LINK_SIZE);
    assert_eq!(blocks.grow_size(), 8);
  }

  #[test]
  fn test_zero_grow_size_rejected() {
    let mut system = SystemAllocator;
    assert!(matches!(
      BlockPool::new(&mut system, 16, 0),
      Err(PoolError::InvalidGrowSize)
    ));
  }

  #[test]
  fn test_parent_exhaustion() {
    let mut buffer = arena(16);
    let mut parent = PoolAllocator::new(&mut buffer).unwrap();
    let mut blocks = BlockPool::new(&mut parent, 32, 2).unwrap();

    // One buffer is 72 bytes (10 chunks); a second one cannot fit.
    assert!(blocks.alloc().is_some());
    assert!(blocks.alloc().is_some());
    assert!(blocks.alloc().is_none());
    assert_eq!(blocks.buffer_count(), 1);
  }

  #[test]
  fn test_clear_returns_buffers() {
    let mut buffer = arena(64);
    let mut parent = PoolAllocator::new(&mut buffer).unwrap();

    {
      let mut blocks = BlockPool::new(&mut parent, 8, 2).unwrap();
      for _ in 0..5 {
        blocks.alloc().unwrap();
      }
      assert_eq!(blocks.buffer_count(), 3);

      blocks.clear();
      assert_eq!(blocks.buffer_count(), 0);
      assert!(blocks.alloc().is_some());
    }

    // Dropping released the buffer allocated after the clear.
    assert_eq!(parent.stats().used_runs, 0);
    parent.check_integrity().unwrap();
  }
}
