//! The allocation interface shared by every consumer, and its host-backed
//! implementation.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicIsize, Ordering},
};

/// Live allocations across every allocator in the process.
/// Incremented on each successful allocate, decremented on each release.
static LIVE_ALLOCATIONS: AtomicIsize = AtomicIsize::new(0);

/// Current value of the process-wide allocation counter. Diagnostics only.
pub fn live_allocations() -> isize {
  LIVE_ALLOCATIONS.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn note_allocate() {
  LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn note_release() {
  LIVE_ALLOCATIONS.fetch_sub(1, Ordering::Relaxed);
}

/// Byte allocator interface. Object safe: callers hold `&mut dyn Allocator`
/// and never care which implementation is behind it.
pub trait Allocator {
  /// Allocates `size` bytes. `None` when the request cannot be satisfied.
  fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

  /// Resizes an allocation, possibly moving it. `resize(None, n)` is `allocate(n)`.
  ///
  /// On `None` the original allocation is untouched and still owned by the caller.
  ///
  /// # Safety
  ///
  /// `ptr` must come from this allocator and not have been released.
  unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>>;

  /// Releases an allocation. `release(None)` is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must come from this allocator and not have been released.
  unsafe fn release(&mut self, ptr: Option<NonNull<u8>>);
}

// =============================================================================
// System Allocator
// =============================================================================

/// Pass-through to the host's `malloc`/`realloc`/`free`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
  fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    let ptr = NonNull::new(unsafe { libc::malloc(size.max(1)) }.cast::<u8>())?;
    note_allocate();
    Some(ptr)
  }

  unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
    let Some(ptr) = ptr else {
      return self.allocate(new_size);
    };
    // realloc leaves the old block intact when it fails.
    NonNull::new(unsafe { libc::realloc(ptr.as_ptr().cast(), new_size.max(1)) }.cast::<u8>())
  }

  unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
    if let Some(ptr) = ptr {
      unsafe { libc::free(ptr.as_ptr().cast()) };
      note_release();
    }
  }
}
