use chunkpool::{Allocator, BlockPool, PoolAllocator, SystemAllocator, live_allocations};

// Only test in this binary: the counter is process-wide.
#[test]
fn counter_tracks_allocate_and_release() {
  let start = live_allocations();

  let mut buffer = vec![0u8; 1024];
  let mut pool = PoolAllocator::new(&mut buffer).unwrap();
  let mut system = SystemAllocator;

  let a = pool.allocate(16).unwrap();
  let b = system.allocate(16).unwrap();
  assert_eq!(live_allocations(), start + 2);

  // Null resize allocates; a failed allocation does not count.
  let c = unsafe { pool.resize(None, 8) }.unwrap();
  assert!(pool.allocate(1 << 20).is_none());
  assert_eq!(live_allocations(), start + 3);

  // In-place and relocating resizes keep the count.
  let a = unsafe { pool.resize(Some(a), 400) }.unwrap();
  let b = unsafe { system.resize(Some(b), 4096) }.unwrap();
  assert_eq!(live_allocations(), start + 3);

  unsafe {
    pool.release(Some(a));
    pool.release(Some(c));
    pool.release(None);
    system.release(Some(b));
  }
  assert_eq!(live_allocations(), start);

  {
    let mut blocks = BlockPool::new(&mut pool, 24, 4).unwrap();
    blocks.alloc().unwrap();
    assert_eq!(live_allocations(), start + 1);
  }
  assert_eq!(live_allocations(), start);
}
