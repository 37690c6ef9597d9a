//! Chunk layout: the fixed-size slot every run is built from, and the two
//! views of a run's leading bytes.
//!
//! ```text
//!   free run                          allocated run
//!   ┌──────┬───────┬──────┬──────┐    ┌──────┬───────┬────────────────────┐
//!   │ len  │ state │ next │ prev │    │ len  │ state │ payload ...        │
//!   └──────┴───────┴──────┴──────┘    └──────┴───────┴────────────────────┘
//!   0      2       4      6      8    0      2       4
//! ```
//!
//! `next`/`prev` and the first four payload bytes share storage. They are only
//! meaningful while the run's state is [`FREE`].

use bytemuck::{Pod, Zeroable};
use core::mem::size_of;

// =============================================================================
// Records
// =============================================================================

/// Header present at the first chunk of every run, free or allocated.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RunHeader {
  /// Run length in chunks.
  pub len: u16,
  /// [`FREE`] or [`USED`].
  pub state: u16,
}

/// Free-run view: the header followed by the free-list links.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FreeNode {
  pub len: u16,
  pub state: u16,
  pub next: u16,
  pub prev: u16,
}

impl FreeNode {
  #[inline]
  pub const fn header(&self) -> RunHeader {
    RunHeader {
      len: self.len,
      state: self.state,
    }
  }
}

/// Arena control header, stored at offset 0 of the caller's buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ControlHeader {
  pub free_head: u16,
  pub num_slots: u16,
  _reserved: u32,
}

impl ControlHeader {
  pub const fn new(free_head: u16, num_slots: u16) -> Self {
    Self {
      free_head,
      num_slots,
      _reserved: 0,
    }
  }
}

// =============================================================================
// Constants
// =============================================================================

pub const FREE: u16 = 0;
pub const USED: u16 = 1;

/// Unit of allocation. Equal to the free-run record so a one-chunk run can be linked.
pub const CHUNK_SIZE: usize = size_of::<FreeNode>();

/// Bytes reserved at the front of every run for its [`RunHeader`].
pub const HEADER_RESERVE: usize = size_of::<RunHeader>();

pub const CONTROL_HEADER_SIZE: usize = size_of::<ControlHeader>();

/// Smallest buffer a pool can be built on: the control header plus one chunk.
pub const MIN_POOL_SIZE: usize = CONTROL_HEADER_SIZE + CHUNK_SIZE;

/// "No slot" link value.
pub const NO_SLOT: u16 = u16::MAX;

/// Slot indices are 16 bits wide; `NO_SLOT` is never a valid index.
pub const MAX_SLOTS: usize = NO_SLOT as usize;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!(CHUNK_SIZE == 8);
const _: () = assert!(HEADER_RESERVE == 4);
const _: () = assert!(HEADER_RESERVE < CHUNK_SIZE);
const _: () = assert!(CONTROL_HEADER_SIZE % CHUNK_SIZE == 0);
const _: () = assert!(core::mem::offset_of!(FreeNode, next) == HEADER_RESERVE);

// =============================================================================
// Sizing
// =============================================================================

/// Chunks a run needs to hold `requested` payload bytes plus its header.
///
/// `None` if the arithmetic overflows, which no arena could satisfy anyway.
#[inline]
pub const fn chunks_needed(requested: usize) -> Option<usize> {
  match requested.checked_add(HEADER_RESERVE) {
    Some(total) => Some(total.div_ceil(CHUNK_SIZE)),
    None => None,
  }
}

/// Payload bytes a run of `len` chunks can hold.
#[inline]
pub const fn run_capacity(len: usize) -> usize {
  len * CHUNK_SIZE - HEADER_RESERVE
}
