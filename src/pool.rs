//! Pool allocator: variable-size runs of fixed chunks carved out of a single
//! caller-supplied buffer.
//!
//! ```text
//!   ┌─────────┬────────┬────────┬────────────────┬────────┬──────────────┐
//!   │ control │ run 0  │ run 1  │ run 3          │ run 7  │ run 8        │
//!   │ header  │ used   │ free   │ used           │ free   │ used         │
//!   └─────────┴────────┴────────┴────────────────┴────────┴──────────────┘
//!               free list: 7 ⇄ 1   (16-bit chunk indices, newest first)
//! ```
//!
//! Release is O(1) and never merges. Neighbouring free runs are merged by a
//! full sweep only when a first-fit search fails, and the search is retried once.

use core::{cmp::Ordering, fmt, marker::PhantomData, mem::size_of, ptr, ptr::NonNull, slice};

use bytemuck::Pod;

use crate::{
  allocator::{Allocator, note_allocate, note_release},
  chunk::{
    CHUNK_SIZE, CONTROL_HEADER_SIZE, ControlHeader, FREE, FreeNode, HEADER_RESERVE, MAX_SLOTS,
    MIN_POOL_SIZE, NO_SLOT, RunHeader, USED, chunks_needed, run_capacity,
  },
  error::PoolError,
};

/// Arena allocator over a borrowed byte buffer.
///
/// The buffer is borrowed for the pool's lifetime and handed back, as a whole,
/// when the pool is dropped.
///
/// # Thread Safety
///
/// Not thread-safe. Every operation mutates run headers in place; share a pool
/// across threads only behind a lock.
pub struct PoolAllocator<'a> {
  base: NonNull<u8>,
  _buffer: PhantomData<&'a mut [u8]>,
}

// The pool holds the only access path to its buffer.
unsafe impl Send for PoolAllocator<'_> {}

/// Snapshot of the arena partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
  pub num_slots: usize,
  pub free_runs: usize,
  pub used_runs: usize,
  pub free_chunks: usize,
  pub used_chunks: usize,
  pub largest_free_run: usize,
}

impl<'a> PoolAllocator<'a> {
  /// Builds a pool on `buffer`, which becomes one free run.
  ///
  /// Fails if the buffer cannot hold the control header plus one chunk. At most
  /// [`MAX_SLOTS`] chunks are addressable; bytes beyond that are left unused.
  pub fn new(buffer: &'a mut [u8]) -> Result<Self, PoolError> {
    let size = buffer.len();
    if size < MIN_POOL_SIZE {
      return Err(PoolError::BufferTooSmall {
        size,
        min: MIN_POOL_SIZE,
      });
    }

    let available = (size - CONTROL_HEADER_SIZE) / CHUNK_SIZE;
    let num_slots = available.min(MAX_SLOTS);
    if num_slots < available {
      tracing::debug!(available, num_slots, "slot indices exhausted, arena tail unused");
    }

    buffer.fill(0);
    let mut pool = Self {
      base: NonNull::from(buffer).cast::<u8>(),
      _buffer: PhantomData,
    };
    pool.init(num_slots as u16);

    tracing::debug!(size, num_slots, "pool created");
    Ok(pool)
  }

  /// Re-partitions the arena as a single free run. Every outstanding pointer
  /// becomes dangling.
  pub fn reset(&mut self) {
    let num_slots = self.num_slots() as u16;
    self.init(num_slots);
  }

  fn init(&mut self, num_slots: u16) {
    self.set_control(ControlHeader::new(0, num_slots));
    self.set_node(
      0,
      FreeNode {
        len: num_slots,
        state: FREE,
        next: NO_SLOT,
        prev: NO_SLOT,
      },
    );
  }

  /// Number of chunks in the arena.
  #[inline]
  pub fn num_slots(&self) -> usize {
    self.control().num_slots as usize
  }

  /// Largest payload the empty arena can hold.
  #[inline]
  pub fn capacity_bytes(&self) -> usize {
    run_capacity(self.num_slots())
  }

  /// Whether `ptr` points into this arena's chunks.
  pub fn contains(&self, ptr: *const u8) -> bool {
    let start = self.base.as_ptr() as usize + CONTROL_HEADER_SIZE;
    let end = start + self.num_slots() * CHUNK_SIZE;
    (start..end).contains(&(ptr as usize))
  }

  /// Payload bytes available behind `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this pool.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    run_capacity(self.header(self.run_index(ptr)).len as usize)
  }

  /// Allocates `size` bytes, coalescing once if the first search fails.
  pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
    let Some(idx) = chunks_needed(size).and_then(|chunks| self.alloc_chunks(chunks)) else {
      tracing::debug!(requested = size, "pool out of memory");
      return Err(PoolError::OutOfMemory { requested: size });
    };

    self.verify();
    note_allocate();
    Ok(self.payload(idx))
  }

  // ===========================================================================
  // Raw access
  // ===========================================================================

  #[inline]
  fn chunk(&self, idx: u16) -> *mut u8 {
    debug_assert!((idx as usize) < self.num_slots(), "chunk {idx} out of range");
    unsafe {
      self
        .base
        .as_ptr()
        .add(CONTROL_HEADER_SIZE + idx as usize * CHUNK_SIZE)
    }
  }

  #[inline]
  fn payload(&self, idx: u16) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.chunk(idx).add(HEADER_RESERVE)) }
  }

  #[inline]
  fn run_index(&self, ptr: NonNull<u8>) -> u16 {
    let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
    ((offset - CONTROL_HEADER_SIZE - HEADER_RESERVE) / CHUNK_SIZE) as u16
  }

  #[inline]
  fn load<T: Pod>(&self, at: *const u8) -> T {
    bytemuck::pod_read_unaligned(unsafe { slice::from_raw_parts(at, size_of::<T>()) })
  }

  #[inline]
  fn store<T: Pod>(&mut self, at: *mut u8, value: T) {
    let bytes = bytemuck::bytes_of(&value);
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), at, bytes.len()) };
  }

  #[inline]
  fn control(&self) -> ControlHeader {
    self.load(self.base.as_ptr())
  }

  #[inline]
  fn set_control(&mut self, control: ControlHeader) {
    self.store(self.base.as_ptr(), control);
  }

  #[inline]
  fn free_head(&self) -> u16 {
    self.control().free_head
  }

  #[inline]
  fn set_free_head(&mut self, idx: u16) {
    let control = self.control();
    self.set_control(ControlHeader::new(idx, control.num_slots));
  }

  /// Header view, valid for every run.
  #[inline]
  fn header(&self, idx: u16) -> RunHeader {
    self.load(self.chunk(idx))
  }

  /// Rewrites only the header, leaving links or payload behind it intact.
  #[inline]
  fn set_header(&mut self, idx: u16, header: RunHeader) {
    self.store(self.chunk(idx), header);
  }

  /// Free-run view. Links are garbage unless the run is free.
  #[inline]
  fn node(&self, idx: u16) -> FreeNode {
    self.load(self.chunk(idx))
  }

  #[inline]
  fn set_node(&mut self, idx: u16, node: FreeNode) {
    self.store(self.chunk(idx), node);
  }

  fn set_next(&mut self, idx: u16, next: u16) {
    let node = self.node(idx);
    self.set_node(idx, FreeNode { next, ..node });
  }

  fn set_prev(&mut self, idx: u16, prev: u16) {
    let node = self.node(idx);
    self.set_node(idx, FreeNode { prev, ..node });
  }

  // ===========================================================================
  // Free list
  // ===========================================================================

  /// Marks the run free and links it at the head of the free list.
  fn push_free(&mut self, idx: u16) {
    let head = self.free_head();
    if head != NO_SLOT {
      self.set_prev(head, idx);
    }

    let len = self.header(idx).len;
    self.set_node(
      idx,
      FreeNode {
        len,
        state: FREE,
        next: head,
        prev: NO_SLOT,
      },
    );
    self.set_free_head(idx);
  }

  /// Unlinks a free run in O(1). Its state flag is left to the caller.
  fn unlink_free(&mut self, idx: u16) {
    let node = self.node(idx);

    if idx == self.free_head() {
      self.set_free_head(node.next);
      if node.next != NO_SLOT {
        self.set_prev(node.next, NO_SLOT);
      }
      return;
    }

    if node.prev != NO_SLOT {
      self.set_next(node.prev, node.next);
    }
    if node.next != NO_SLOT {
      self.set_prev(node.next, node.prev);
    }
  }

  /// Free run whose last chunk sits right before `idx`.
  fn free_run_ending_at(&self, idx: u16) -> Option<u16> {
    let mut cursor = self.free_head();
    for _ in 0..self.num_slots() {
      if cursor == NO_SLOT {
        break;
      }
      let node = self.node(cursor);
      if cursor as usize + node.len as usize == idx as usize {
        return Some(cursor);
      }
      cursor = node.next;
    }
    None
  }

  // ===========================================================================
  // First fit & split
  // ===========================================================================

  /// Cuts the run at `idx` down to `at` chunks; the tail becomes a free run
  /// at the head of the free list. The run's state is kept.
  fn split(&mut self, idx: u16, at: u16) {
    let header = self.header(idx);
    debug_assert!(at > 0 && at < header.len, "split {at} outside run of {}", header.len);

    let rest = idx + at;
    self.set_header(
      rest,
      RunHeader {
        len: header.len - at,
        state: FREE,
      },
    );
    self.push_free(rest);
    self.set_header(idx, RunHeader { len: at, ..header });
  }

  /// Takes the first free run of at least `chunks` chunks, splitting off the excess.
  fn find_fit(&mut self, chunks: u16) -> Option<u16> {
    let mut cursor = self.free_head();

    // A sound list never has more members than chunks.
    for _ in 0..self.num_slots() {
      if cursor == NO_SLOT {
        break;
      }

      let node = self.node(cursor);
      if node.len >= chunks {
        if node.len > chunks {
          self.split(cursor, chunks);
        }
        self.unlink_free(cursor);
        self.set_header(
          cursor,
          RunHeader {
            len: chunks,
            state: USED,
          },
        );
        return Some(cursor);
      }

      cursor = node.next;
    }

    None
  }

  /// First fit, then one coalescing pass and a second first fit.
  fn alloc_chunks(&mut self, chunks: usize) -> Option<u16> {
    if chunks > self.num_slots() {
      return None;
    }
    let chunks = chunks as u16;

    self.find_fit(chunks).or_else(|| {
      self.coalesce();
      self.find_fit(chunks)
    })
  }

  // ===========================================================================
  // Coalescing
  // ===========================================================================

  /// Absorbs every free run directly following `idx` into it. Returns the new length.
  fn join_forward(&mut self, idx: u16) -> u16 {
    let num_slots = self.num_slots();
    let mut header = self.header(idx);
    let mut next = idx as usize + header.len as usize;

    while next < num_slots {
      let neighbour = self.header(next as u16);
      if neighbour.state != FREE {
        break;
      }
      debug_assert!(neighbour.len > 0, "zero-length run at {next}");

      self.unlink_free(next as u16);
      // Absorbed: no longer a run of its own.
      self.set_header(
        next as u16,
        RunHeader {
          state: USED,
          ..neighbour
        },
      );
      header.len += neighbour.len;
      next += neighbour.len as usize;
    }

    self.set_header(idx, header);
    header.len
  }

  /// Merges every maximal stretch of free runs into one run.
  ///
  /// Runs automatically when a first-fit search fails. Returns the number of
  /// free runs left after the sweep.
  pub fn coalesce(&mut self) -> usize {
    let num_slots = self.num_slots();
    let mut idx = 0;
    let mut visited = 0;

    while idx < num_slots && visited < num_slots {
      if self.header(idx as u16).state == FREE {
        visited += 1;
        self.join_forward(idx as u16);
      }
      let len = self.header(idx as u16).len as usize;
      debug_assert!(len > 0, "zero-length run at {idx}");
      idx += len.max(1);
    }

    tracing::trace!(free_runs = visited, "arena coalesced");
    self.verify();
    visited
  }

  // ===========================================================================
  // Reallocation
  // ===========================================================================

  fn grow(&mut self, idx: u16, old_len: u16, chunks: u16, new_size: usize) -> Option<NonNull<u8>> {
    let merged = self.join_forward(idx);

    match merged.cmp(&chunks) {
      Ordering::Greater => {
        self.split(idx, chunks);
        Some(self.payload(idx))
      }
      Ordering::Equal => Some(self.payload(idx)),
      Ordering::Less => {
        let keep = run_capacity(old_len as usize).min(new_size);
        self.relocate(idx, chunks, keep)
      }
    }
  }

  /// Moves the run at `idx` to a run of `chunks` chunks, carrying `keep` payload bytes.
  ///
  /// The run stays allocated until its data has been moved, so a failure leaves
  /// it exactly where and as it was.
  fn relocate(&mut self, idx: u16, chunks: u16, keep: usize) -> Option<NonNull<u8>> {
    let src = self.payload(idx);

    if let Some(fresh) = self.alloc_chunks(chunks as usize) {
      let dst = self.payload(fresh);
      unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), keep) };
      self.push_free(idx);
      tracing::trace!(from = idx, to = fresh, chunks, "allocation relocated");
      return Some(dst);
    }

    // Every free run is now maximal and the run's successors were absorbed
    // already, so releasing it could only help by joining a free predecessor.
    let len = self.header(idx).len;
    let before = self
      .free_run_ending_at(idx)
      .filter(|&before| self.header(before).len + len >= chunks);
    let Some(before) = before else {
      tracing::debug!(run = idx, chunks, "resize failed, allocation left in place");
      return None;
    };

    let span = self.header(before).len + len;
    self.unlink_free(before);

    let dst = self.payload(before);
    unsafe { ptr::copy(src.as_ptr(), dst.as_ptr(), keep) };

    self.set_header(
      before,
      RunHeader {
        len: span,
        state: USED,
      },
    );
    if span > chunks {
      self.split(before, chunks);
    }

    tracing::trace!(from = idx, to = before, chunks, "allocation slid into predecessor");
    Some(dst)
  }

  // ===========================================================================
  // Diagnostics
  // ===========================================================================

  /// Walks the arena run by run.
  pub fn stats(&self) -> PoolStats {
    let num_slots = self.num_slots();
    let mut stats = PoolStats {
      num_slots,
      ..PoolStats::default()
    };

    let mut idx = 0;
    while idx < num_slots {
      let header = self.header(idx as u16);
      let len = header.len as usize;
      if header.state == FREE {
        stats.free_runs += 1;
        stats.free_chunks += len;
        stats.largest_free_run = stats.largest_free_run.max(len);
      } else {
        stats.used_runs += 1;
        stats.used_chunks += len;
      }
      idx += len.max(1);
    }

    stats
  }

  /// Checks the arena invariants: runs tile the arena exactly, and the free
  /// list is an acyclic, doubly linked list of exactly the free runs.
  pub fn check_integrity(&self) -> Result<(), PoolError> {
    let num_slots = self.num_slots();
    let corrupted = |msg: String| -> Result<(), PoolError> { Err(PoolError::Corrupted(msg)) };

    let mut free_heads = vec![false; num_slots];
    let mut free_runs = 0;
    let mut idx = 0;
    while idx < num_slots {
      let header = self.header(idx as u16);
      if header.len == 0 {
        return corrupted(format!("run {idx} has zero length"));
      }
      match header.state {
        FREE => {
          free_heads[idx] = true;
          free_runs += 1;
        }
        USED => {}
        state => return corrupted(format!("run {idx} has state {state}")),
      }
      idx += header.len as usize;
    }
    if idx != num_slots {
      return corrupted(format!("runs cover {idx} chunks, arena has {num_slots}"));
    }

    let mut cursor = self.free_head();
    let mut prev = NO_SLOT;
    let mut members = 0;
    while cursor != NO_SLOT {
      if members >= num_slots {
        return corrupted("free list does not terminate".to_string());
      }
      if cursor as usize >= num_slots || !free_heads[cursor as usize] {
        return corrupted(format!("free list links {cursor}, not a free run"));
      }
      free_heads[cursor as usize] = false;

      let node = self.node(cursor);
      if node.prev != prev {
        return corrupted(format!("run {cursor} links back to {}, expected {prev}", node.prev));
      }
      members += 1;
      prev = cursor;
      cursor = node.next;
    }
    if members != free_runs {
      return corrupted(format!("free list holds {members} of {free_runs} free runs"));
    }

    Ok(())
  }

  #[inline]
  fn verify(&self) {
    #[cfg(feature = "verify")]
    debug_assert_eq!(self.check_integrity(), Ok(()));
  }
}

impl fmt::Debug for PoolAllocator<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolAllocator")
      .field("base", &self.base)
      .field("num_slots", &self.num_slots())
      .field("free_head", &self.free_head())
      .finish()
  }
}

// =============================================================================
// Allocator
// =============================================================================

impl Allocator for PoolAllocator<'_> {
  fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.try_allocate(size).ok()
  }

  unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
    let Some(ptr) = ptr else {
      return self.allocate(new_size);
    };

    let Some(chunks) = chunks_needed(new_size).filter(|&chunks| chunks <= self.num_slots()) else {
      tracing::debug!(requested = new_size, "resize larger than the arena");
      return None;
    };
    let chunks = chunks as u16;

    let idx = self.run_index(ptr);
    let old_len = self.header(idx).len;

    let result = match old_len.cmp(&chunks) {
      Ordering::Greater => {
        self.split(idx, chunks);
        Some(ptr)
      }
      Ordering::Equal => Some(ptr),
      Ordering::Less => self.grow(idx, old_len, chunks, new_size),
    };

    self.verify();
    result
  }

  unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
    let Some(ptr) = ptr else {
      return;
    };

    let idx = self.run_index(ptr);
    self.push_free(idx);
    note_release();
    self.verify();
  }
}
